//!
//! # Ray–surface intersection
//!
//! The intersection of the ray $\vec p + t\vec d$ with the surface
//! $z=\mathrm{sag}(r)$ is the root of
//! $$f(t) = p_z + td_z - \mathrm{sag}(r(t)),\quad f^\prime(t) = d_z - \mathrm{sag}^\prime(r)\frac{xd_x+yd_y}{r}.$$
//! Newton iterations are started from a list of guesses until one of them
//! converges in front of the ray and, optionally, inside the clear aperture.
//! Points and directions are expressed in the surface local frame.

use crate::{
    ray::RayFailure,
    surface::{Aperture, Asphere, Vector},
};
use std::result::Result;

/// Newton iteration limit
pub const MAX_ITERATIONS: usize = 64;
const BEHIND: f64 = -1e-9;
const FALLBACK_GUESSES: [f64; 3] = [1e-6, 1e-4, 1e-2];

/// Ray/surface intersection in the surface local frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Distance along the ray
    pub t: f64,
    pub point: Vector,
    /// Unit normal pointing toward +z
    pub normal: Vector,
}

pub struct Intersector<'a> {
    asphere: &'a Asphere,
    aperture: Aperture,
    check_aperture: bool,
    tolerance: f64,
}
impl<'a> Intersector<'a> {
    pub fn new(asphere: &'a Asphere, aperture: Aperture) -> Self {
        let tolerance = 1e-10 * aperture.radius().unwrap_or(1.).max(1.);
        Self {
            asphere,
            aperture,
            check_aperture: true,
            tolerance,
        }
    }
    /// Disables the clear aperture check
    pub fn ignore_aperture(self) -> Self {
        Self {
            check_aperture: false,
            ..self
        }
    }
    /// Intersects the ray `p+td` with the surface, `d` must be a unit vector
    pub fn intersect(&self, p: &Vector, d: &Vector) -> Result<Hit, RayFailure> {
        if self.asphere.is_plane() {
            return self.intersect_plane(p, d);
        }
        let mut failure = RayFailure::NoConvergence;
        for guess in self.guesses(p, d) {
            match self.newton(p, d, guess) {
                Ok(hit) => {
                    if !self.check_aperture || self.aperture.contains(hit.point.x, hit.point.y) {
                        return Ok(hit);
                    }
                    failure = RayFailure::ApertureMiss;
                }
                Err(RayFailure::Domain) if failure == RayFailure::NoConvergence => {
                    failure = RayFailure::Domain
                }
                Err(_) => (),
            }
        }
        log::debug!("intersection failed ({}) from {:?} along {:?}", failure, p, d);
        Err(failure)
    }
    fn intersect_plane(&self, p: &Vector, d: &Vector) -> Result<Hit, RayFailure> {
        if d.z.abs() < 1e-15 {
            return Err(RayFailure::NoConvergence);
        }
        let t = -p.z / d.z;
        if t < BEHIND {
            return Err(RayFailure::NoConvergence);
        }
        let point = p + d * t;
        if self.check_aperture && !self.aperture.contains(point.x, point.y) {
            return Err(RayFailure::ApertureMiss);
        }
        Ok(Hit {
            t,
            point: Vector::new(point.x, point.y, 0.),
            normal: Vector::z(),
        })
    }
    /// Newton starting points: tangent plane, conic roots, aperture edge, fallback ladder
    fn guesses(&self, p: &Vector, d: &Vector) -> Vec<f64> {
        let mut guesses = Vec::with_capacity(10);
        if d.z.abs() > 1e-15 {
            guesses.push(-p.z / d.z);
        }
        // base conic c(x²+y²+(1+k)z²) - 2z = 0
        let c = self.asphere.curvature;
        let q = 1. + self.asphere.conic;
        if c != 0. {
            let a = c * (d.x * d.x + d.y * d.y + q * d.z * d.z);
            let b = 2. * (c * (p.x * d.x + p.y * d.y + q * p.z * d.z) - d.z);
            let cc = c * (p.x * p.x + p.y * p.y + q * p.z * p.z) - 2. * p.z;
            let mut roots = quadratic_roots(a, b, cc);
            roots.retain(|t| *t >= BEHIND);
            guesses.extend(roots);
        }
        if let Some(sd) = self.aperture.radius() {
            // points of the ray at 0.8sd and sd from the axis
            let a = d.x * d.x + d.y * d.y;
            let b = 2. * (p.x * d.x + p.y * d.y);
            for rho in [0.8 * sd, sd] {
                let cc = p.x * p.x + p.y * p.y - rho * rho;
                guesses.extend(quadratic_roots(a, b, cc).into_iter().filter(|t| *t >= 0.));
            }
        }
        guesses.extend(FALLBACK_GUESSES);
        guesses
    }
    fn residual(&self, p: &Vector, d: &Vector, t: f64) -> Result<(f64, Vector), RayFailure> {
        let x = p + d * t;
        let r = x.x.hypot(x.y);
        let sag = self.asphere.sag(r).ok_or(RayFailure::Domain)?;
        Ok((x.z - sag, x))
    }
    fn newton(&self, p: &Vector, d: &Vector, guess: f64) -> Result<Hit, RayFailure> {
        let mut t = guess;
        for _ in 0..MAX_ITERATIONS {
            let (f, x) = self.residual(p, d, t)?;
            let r = x.x.hypot(x.y);
            let fp = if r > 0. {
                let slope = self.asphere.slope(r).ok_or(RayFailure::Domain)?;
                d.z - slope * (x.x * d.x + x.y * d.y) / r
            } else {
                d.z
            };
            if f.abs() < self.tolerance {
                // polishing step
                if fp.abs() > 1e-12 {
                    let tp = t - f / fp;
                    if let Ok((fp_, _)) = self.residual(p, d, tp) {
                        if fp_.abs() <= f.abs() {
                            t = tp;
                        }
                    }
                }
                if t < BEHIND {
                    return Err(RayFailure::NoConvergence);
                }
                let point = p + d * t;
                let normal = self
                    .asphere
                    .normal(point.x, point.y)
                    .ok_or(RayFailure::Domain)?;
                return Ok(Hit { t, point, normal });
            }
            if fp.abs() < 1e-300 {
                break;
            }
            t -= f / fp;
            if !t.is_finite() {
                break;
            }
        }
        Err(RayFailure::NoConvergence)
    }
}

/// Real roots of $at^2+bt+c$ in increasing order
fn quadratic_roots(a: f64, b: f64, c: f64) -> Vec<f64> {
    if a.abs() < 1e-300 {
        return if b.abs() < 1e-300 { vec![] } else { vec![-c / b] };
    }
    let delta = b * b - 4. * a * c;
    if delta < 0. {
        return vec![];
    }
    // numerically stable form
    let q = -0.5 * (b + b.signum() * delta.sqrt());
    let mut roots = if q == 0. {
        vec![0.]
    } else {
        vec![q / a, c / q]
    };
    roots.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_hit_matches_closed_form() {
        let asphere = Asphere::new(1. / 50., 0.);
        let intersector = Intersector::new(&asphere, Aperture::Circular(20.));
        let p = Vector::new(0., 5., -10.);
        let d = Vector::z();
        let hit = intersector.intersect(&p, &d).unwrap();
        let z = 50. - (2500f64 - 25.).sqrt();
        assert!((hit.point.z - z).abs() < 1e-10);
        assert!((hit.t - (10. + z)).abs() < 1e-10);
        assert!((hit.normal.norm() - 1.).abs() < 1e-14);
    }

    #[test]
    fn asphere_hit_lies_on_surface() {
        let asphere = Asphere::new(-1. / 30., -2.5).even(vec![2e-5, -1e-8]);
        let intersector = Intersector::new(&asphere, Aperture::Circular(10.));
        let p = Vector::new(1., -2., -5.);
        let d = Vector::new(0.1, 0.2, 1.).normalize();
        let hit = intersector.intersect(&p, &d).unwrap();
        let r = hit.point.x.hypot(hit.point.y);
        assert!((hit.point.z - asphere.sag(r).unwrap()).abs() < 1e-9);
        assert!(((p + d * hit.t) - hit.point).norm() < 1e-12);
    }

    #[test]
    fn aperture_miss() {
        let asphere = Asphere::new(1. / 50., 0.);
        let intersector = Intersector::new(&asphere, Aperture::Circular(2.));
        let p = Vector::new(0., 3., -1.);
        assert_eq!(
            intersector.intersect(&p, &Vector::z()),
            Err(RayFailure::ApertureMiss)
        );
        assert!(intersector
            .ignore_aperture()
            .intersect(&p, &Vector::z())
            .is_ok());
    }

    #[test]
    fn outside_domain() {
        let asphere = Asphere::new(1. / 5., 0.);
        let intersector = Intersector::new(&asphere, Aperture::Unbounded);
        let p = Vector::new(0., 6., -1.);
        assert!(intersector.intersect(&p, &Vector::z()).is_err());
    }

    #[test]
    fn plane_behind() {
        let asphere = Asphere::new(0., 0.);
        let intersector = Intersector::new(&asphere, Aperture::Unbounded);
        let p = Vector::new(0., 0., 1.);
        assert_eq!(
            intersector.intersect(&p, &Vector::z()),
            Err(RayFailure::NoConvergence)
        );
        let hit = intersector.intersect(&p, &-Vector::z()).unwrap();
        assert!((hit.t - 1.).abs() < 1e-15);
    }

    #[test]
    fn stable_quadratic() {
        let roots = quadratic_roots(1., -1e8, 1.);
        assert!((roots[0] - 1e-8).abs() < 1e-20);
        assert!((roots[1] - 1e8).abs() < 1e-4);
    }
}
