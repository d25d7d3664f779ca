//!
//! # Sequential ray tracing
//!
//! A ray is driven through the surfaces in table order: at each surface it is
//! moved into the local frame, intersected with the surface, refracted or
//! reflected and moved back to the world frame.
//! The first failure stops the ray, which is then reported as vignetted.

use crate::{
    intersect::Intersector,
    ray::{Ray, RayFailure, RayStatus},
    refract::{reflect, refract},
    surface::{SurfaceKind, Vector},
    system::OpticalSystem,
};
use std::fmt;

/// Ray state right after a surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceRecord {
    /// Surface index
    pub surface: usize,
    /// Hit point in world coordinates
    pub point: Vector,
    /// Direction leaving the surface
    pub direction: Vector,
    /// Geometric distance from the previous surface
    pub s: f64,
    /// Optical path length since launch
    pub opl: f64,
}

#[derive(Debug, Clone)]
pub struct TraceResult {
    pub records: Vec<SurfaceRecord>,
    /// Ray at the last surface reached
    pub ray: Ray,
    pub status: RayStatus,
}
impl TraceResult {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
    /// Points of the ray path, launch point first
    pub fn polyline(&self) -> Vec<Vector> {
        self.records.iter().map(|r| r.point).collect()
    }
    /// Record of surface `i` if the ray got there
    pub fn at(&self, i: usize) -> Option<&SurfaceRecord> {
        self.records.iter().find(|r| r.surface == i)
    }
    pub fn last(&self) -> Option<&SurfaceRecord> {
        self.records.last()
    }
}
impl fmt::Display for TraceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.records {
            writeln!(
                f,
                "#{:02} P: [{:+12.6},{:+12.6},{:+12.6}] s: {:10.6} L: {:12.6}",
                r.surface, r.point[0], r.point[1], r.point[2], r.s, r.opl
            )?;
        }
        write!(f, "{}", self.status)
    }
}

/// Sequential tracer
pub struct Tracer<'a> {
    system: &'a OpticalSystem,
    check_aperture: bool,
}
impl<'a> Tracer<'a> {
    pub fn new(system: &'a OpticalSystem) -> Self {
        Self {
            system,
            check_aperture: true,
        }
    }
    /// Disables the clear aperture checks of all the surfaces
    pub fn ignore_apertures(self) -> Self {
        Self {
            check_aperture: false,
            ..self
        }
    }
    /// Traces the ray from the object to the image surface
    pub fn trace(&self, ray: Ray) -> TraceResult {
        self.trace_to(ray, self.system.image())
    }
    /// Traces the ray from the object to the surface `last`
    ///
    /// The status is [`RayStatus::AtImage`] if the ray reaches `last`.
    pub fn trace_to(&self, ray: Ray, last: usize) -> TraceResult {
        let last = last.min(self.system.image());
        let mut records = Vec::with_capacity(last + 1);
        records.push(SurfaceRecord {
            surface: 0,
            point: ray.p,
            direction: ray.u,
            s: 0.,
            opl: ray.opl,
        });
        let mut ray = ray;
        for i in 1..=last {
            match self.step(&mut ray, i, self.system.index_after(i)) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    return TraceResult {
                        records,
                        ray,
                        status: RayStatus::Vignetted { surface: i, reason },
                    }
                }
            }
        }
        TraceResult {
            records,
            ray,
            status: RayStatus::AtImage,
        }
    }
    /// Traces the ray backward from surface `from` to the first surface
    ///
    /// The ray must travel in the medium behind surface `from - 1`; it leaves
    /// in object space.
    pub fn trace_backward(&self, ray: Ray, from: usize) -> TraceResult {
        let from = from.min(self.system.image());
        let mut records = Vec::with_capacity(from + 1);
        records.push(SurfaceRecord {
            surface: from,
            point: ray.p,
            direction: ray.u,
            s: 0.,
            opl: ray.opl,
        });
        let mut ray = ray;
        for i in (1..from).rev() {
            match self.step(&mut ray, i, self.system.index_after(i - 1)) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    return TraceResult {
                        records,
                        ray,
                        status: RayStatus::Vignetted { surface: i, reason },
                    }
                }
            }
        }
        TraceResult {
            records,
            ray,
            status: RayStatus::AtImage,
        }
    }
    /// Moves the ray through surface `i` into the medium of index `n2`
    fn step(&self, ray: &mut Ray, i: usize, n2: f64) -> Result<SurfaceRecord, RayFailure> {
        let surface = self.system.surface(i);
        if surface.kind == SurfaceKind::CoordinateBreak {
            return Ok(SurfaceRecord {
                surface: i,
                point: ray.p,
                direction: ray.u,
                s: 0.,
                opl: ray.opl,
            });
        }
        let frame = self.system.frame(i);
        let p = frame.to_local(&ray.p);
        let d = frame.dir_to_local(&ray.u);
        let mut intersector = Intersector::new(self.system.asphere(i), self.system.aperture(i));
        if !self.check_aperture {
            intersector = intersector.ignore_aperture();
        }
        let hit = intersector.intersect(&p, &d)?;
        ray.p = frame.to_world(&hit.point);
        ray.opl += ray.n.abs() * hit.t;
        let d_out = match surface.kind {
            SurfaceKind::Image => d,
            _ if surface.reflective => reflect(&d, &hit.normal),
            _ if ray.n.abs() == n2.abs() => d,
            _ => refract(&d, &hit.normal, ray.n, n2)?,
        };
        ray.u = frame.dir_to_world(&d_out);
        if surface.kind != SurfaceKind::Image {
            ray.n = n2;
        }
        Ok(SurfaceRecord {
            surface: i,
            point: ray.p,
            direction: ray.u,
            s: hit.t,
            opl: ray.opl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{glass::GlassCatalog, surface::Surface};

    fn system(surfaces: Vec<Surface>) -> OpticalSystem {
        OpticalSystem::new(surfaces, 0.5876, &GlassCatalog::builtin()).unwrap()
    }

    #[test]
    fn trivial_system() {
        let system = system(vec![
            Surface::object(f64::INFINITY),
            Surface::standard(f64::INFINITY, 10.),
            Surface::image(),
        ]);
        let u = Vector::new(0.1, -0.05, 1.).normalize();
        let ray = Ray::new(Vector::new(1., 2., -3.), u, 0.5876);
        let result = Tracer::new(&system).trace(ray);
        assert!(result.is_ok());
        assert!((result.ray.u - u).norm() < 1e-15);
        let t = result.at(2).unwrap().s;
        assert!((t - 10. / u.z).abs() < 1e-12);
        let launch_to_plane = 3. / u.z;
        assert!((result.ray.opl - launch_to_plane - t).abs() < 1e-12);
        assert!((result.ray.p - (Vector::new(1., 2., -3.) + u * (launch_to_plane + t))).norm() < 1e-12);
    }

    #[test]
    fn vignetting_stops_the_ray() {
        let system = system(vec![
            Surface::object(f64::INFINITY),
            Surface::standard(50., 5.).set_material("N-BK7").set_semi_diameter(5.),
            Surface::standard(f64::INFINITY, 50.),
            Surface::image(),
        ]);
        let ray = Ray::new(Vector::new(0., 6., -1.), Vector::z(), 0.5876);
        let tracer = Tracer::new(&system);
        let result = tracer.trace(ray);
        assert_eq!(
            result.status,
            RayStatus::Vignetted {
                surface: 1,
                reason: RayFailure::ApertureMiss
            }
        );
        assert!(tracer.ignore_apertures().trace(ray).is_ok());
    }

    #[test]
    fn fold_mirror() {
        let system = system(vec![
            Surface::object(f64::INFINITY),
            Surface::coordinate_break([0., 0.], [45., 0., 0.], 0.),
            Surface::mirror(f64::INFINITY, 0.).set_semi_diameter(5.),
            Surface::coordinate_break([0., 0.], [45., 0., 0.], -10.),
            Surface::image(),
        ]);
        let ray = Ray::new(Vector::new(0., 0., -5.), Vector::z(), 0.5876);
        let result = Tracer::new(&system).trace(ray);
        assert!(result.is_ok(), "{}", result);
        assert!((result.ray.p - Vector::new(0., 10., 0.)).norm() < 1e-9);
        assert!((result.ray.u - Vector::y()).norm() < 1e-12);
        assert!((result.ray.opl - 15.).abs() < 1e-9);
        assert_eq!(result.ray.n, -1.);
    }

    #[test]
    fn backward_trace_returns_to_launch() {
        let system = system(vec![
            Surface::object(f64::INFINITY),
            Surface::standard(51.68, 5.).set_material("N-BK7").set_semi_diameter(12.5),
            Surface::standard(f64::INFINITY, 95.).set_semi_diameter(12.5),
            Surface::image(),
        ]);
        let start = Vector::new(0., 3., -20.);
        let u = Vector::new(0., -0.02, 1.).normalize();
        let tracer = Tracer::new(&system);
        let forward = tracer.trace(Ray::new(start, u, 0.5876));
        assert!(forward.is_ok());
        let backward = tracer.trace_backward(forward.ray.reversed(), system.image());
        assert!(backward.is_ok());
        let ray = backward.ray;
        let s = (start.z - ray.p.z) / ray.u.z;
        assert!((ray.at(s) - start).norm() < 1e-9);
        assert!((ray.u + u).norm() < 1e-12);
    }
}
