//!
//! # Object fields
//!
//! A [`Field`] is either a pair of field angles for an object at infinity or
//! an object point for a finite object.
//! [`Launch`] maps two free parameters to the ray leaving the object:
//!  - object at infinity: the ray direction is fixed by the field angles and the
//!    parameters are the launch point coordinates in the wavefront plane
//!    normal to that direction, in front of the first surface,
//!  - finite object: the launch point is the object point and the parameters
//!    are the direction tangents in the object frame.

use crate::{
    error::{Error, Result},
    frame::Frame,
    ray::Ray,
    surface::Vector,
    system::OpticalSystem,
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Field {
    /// Field angles [deg]
    Angle { x: f64, y: f64 },
    /// Object point [mm]
    Height { x: f64, y: f64 },
}
impl Default for Field {
    fn default() -> Self {
        Field::Angle { x: 0., y: 0. }
    }
}
impl Field {
    pub fn angle(x: f64, y: f64) -> Self {
        Field::Angle { x, y }
    }
    pub fn height(x: f64, y: f64) -> Self {
        Field::Height { x, y }
    }
    pub fn is_on_axis(&self) -> bool {
        match *self {
            Field::Angle { x, y } | Field::Height { x, y } => x == 0. && y == 0.,
        }
    }
}
impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Angle { x, y } => write!(f, "field angle ({:.4}°, {:.4}°)", x, y),
            Field::Height { x, y } => write!(f, "object point ({:.4}mm, {:.4}mm)", x, y),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    /// Plane wave: fixed direction, launch point in the plane `base + a·e1 + b·e2`
    Plane {
        base: Vector,
        u: Vector,
        e1: Vector,
        e2: Vector,
    },
    /// Point source: fixed point, direction `rotation·(a, b, 1)`
    Point { q: Vector, frame: Frame },
}

/// Ray launcher for a given field
#[derive(Debug, Clone, Copy)]
pub struct Launch {
    source: Source,
    n: f64,
    wavelength: f64,
}
impl Launch {
    pub fn new(system: &OpticalSystem, field: Field) -> Result<Self> {
        let source = match (field, system.is_infinite_object()) {
            (Field::Angle { x, y }, true) => {
                if !(x.abs() < 90. && y.abs() < 90.) {
                    return Err(Error::invalid_input(
                        "field",
                        format!("field angles must be within ±90°, found ({},{})", x, y),
                    ));
                }
                let first = (1..system.image())
                    .find(|&i| system.surface(i).is_optical())
                    .unwrap_or(1);
                let sd = system.aperture(first).radius().unwrap_or(10.);
                let base = system.frame(first).to_world(&Vector::new(0., 0., -(sd + 10.)));
                let u = Vector::new(x.to_radians().tan(), y.to_radians().tan(), 1.).normalize();
                let e1 = Vector::y().cross(&u).normalize();
                let e2 = u.cross(&e1);
                Source::Plane { base, u, e1, e2 }
            }
            (Field::Height { x, y }, false) => {
                let frame = *system.frame(0);
                Source::Point {
                    q: frame.to_world(&Vector::new(x, y, 0.)),
                    frame,
                }
            }
            (Field::Angle { .. }, false) => {
                return Err(Error::invalid_input(
                    "field",
                    "field angles require an object at infinity",
                ))
            }
            (Field::Height { .. }, true) => {
                return Err(Error::invalid_input(
                    "field",
                    "object heights require a finite object distance",
                ))
            }
        };
        Ok(Self {
            source,
            n: system.object_index(),
            wavelength: system.wavelength(),
        })
    }
    /// Whether the parameters are launch point coordinates [mm]
    pub fn is_plane_wave(&self) -> bool {
        matches!(self.source, Source::Plane { .. })
    }
    /// Ray for the launch parameters `[a, b]`
    pub fn ray(&self, params: [f64; 2]) -> Ray {
        let [a, b] = params;
        let ray = match self.source {
            Source::Plane { base, u, e1, e2 } => {
                Ray::new(base + e1 * a + e2 * b, u, self.wavelength)
            }
            Source::Point { q, frame } => Ray::new(
                q,
                frame.dir_to_world(&Vector::new(a, b, 1.)),
                self.wavelength,
            ),
        };
        ray.with_index(self.n)
    }
    /// Launch parameters of the ray aimed at the world point `target`
    ///
    /// For a plane wave the ray goes through `target` along the field direction.
    pub fn aim_at(&self, target: &Vector) -> [f64; 2] {
        match self.source {
            Source::Plane { base, e1, e2, .. } => {
                let v = target - base;
                [v.dot(&e1), v.dot(&e2)]
            }
            Source::Point { q, frame } => {
                let v = frame.dir_to_local(&(target - q));
                if v.z.abs() < 1e-15 {
                    [0., 0.]
                } else {
                    [v.x / v.z, v.y / v.z]
                }
            }
        }
    }
    /// Fixed field direction of a plane wave
    pub fn direction(&self) -> Option<Vector> {
        match self.source {
            Source::Plane { u, .. } => Some(u),
            Source::Point { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{glass::GlassCatalog, surface::Surface};

    fn system(object: f64) -> OpticalSystem {
        OpticalSystem::new(
            vec![
                Surface::object(object),
                Surface::standard(50., 5.).set_index(1.5).set_semi_diameter(10.),
                Surface::standard(f64::INFINITY, 90.),
                Surface::image(),
            ],
            0.55,
            &GlassCatalog::new(),
        )
        .unwrap()
    }

    #[test]
    fn plane_wave_launch() {
        let system = system(f64::INFINITY);
        let launch = Launch::new(&system, Field::angle(0., 5.)).unwrap();
        let u = launch.direction().unwrap();
        assert!((u.y / u.z - 5f64.to_radians().tan()).abs() < 1e-15);
        let r0 = launch.ray([0., 0.]);
        let r1 = launch.ray([1., -2.]);
        // launch points share the same wavefront
        assert!((r1.p - r0.p).dot(&u).abs() < 1e-14);
        assert!((r0.p.z + 20.).abs() < 1e-12);
        let target = Vector::new(0.5, 0.25, 0.);
        let p = launch.aim_at(&target);
        let ray = launch.ray(p);
        let s = (target - ray.p).dot(&u);
        assert!((ray.at(s) - target).norm() < 1e-12);
    }

    #[test]
    fn point_source_launch() {
        let system = system(200.);
        let launch = Launch::new(&system, Field::height(0., 10.)).unwrap();
        let target = Vector::new(0., 0., 0.);
        let ray = launch.ray(launch.aim_at(&target));
        assert!((ray.p - Vector::new(0., 10., -200.)).norm() < 1e-12);
        let s = (target - ray.p).norm();
        assert!((ray.at(s) - target).norm() < 1e-12);
    }

    #[test]
    fn field_and_object_must_agree() {
        assert!(Launch::new(&system(200.), Field::angle(0., 1.)).is_err());
        assert!(Launch::new(&system(f64::INFINITY), Field::height(0., 1.)).is_err());
    }

    #[test]
    fn deserialize_field() {
        let field: Field = serde_json::from_str(r#"{"type":"angle","x":0,"y":5}"#).unwrap();
        assert_eq!(field, Field::angle(0., 5.));
    }
}
