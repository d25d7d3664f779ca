//!
//! # Rays
//!
//! A ray is defined with a point $\vec p$, a unit direction vector $\vec u$,
//! the refractive index $n$ of the medium it travels in and the optical path
//! length accumulated since launch.
//! Propagating the ray by a geometric distance $s$ gives
//! $$\vec{p^\prime} = \vec p + s \vec u, \quad L^\prime = L + |n|s.$$

use crate::surface::Vector;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    /// Point in world coordinates [mm]
    pub p: Vector,
    /// Unit direction vector
    pub u: Vector,
    /// Signed refractive index of the current medium (negative after an odd number of mirrors)
    pub n: f64,
    /// Optical path length [mm]
    pub opl: f64,
    /// Wavelength [µm]
    pub wavelength: f64,
}
impl Ray {
    /// Ray in air with a zero optical path length, `u` is normalized
    pub fn new(p: Vector, u: Vector, wavelength: f64) -> Self {
        Self {
            p,
            u: u.normalize(),
            n: 1.,
            opl: 0.,
            wavelength,
        }
    }
    pub fn with_index(self, n: f64) -> Self {
        Self { n, ..self }
    }
    /// Propagates the ray by the geometric distance `s`
    pub fn trace(&mut self, s: f64) {
        self.p += self.u * s;
        self.opl += self.n.abs() * s;
    }
    /// Point at distance `s` along the ray
    pub fn at(&self, s: f64) -> Vector {
        self.p + self.u * s
    }
    /// Ray going back along its path
    pub fn reversed(&self) -> Self {
        Self { u: -self.u, ..*self }
    }
}
impl fmt::Display for Ray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "P: [{:+15.9},{:+15.9},{:+15.9}] ; U: [{:+.9},{:+.9},{:+.9}] ; n: {:+.6} ; L: {:.9}",
            self.p[0], self.p[1], self.p[2], self.u[0], self.u[1], self.u[2], self.n, self.opl
        )
    }
}

/// Reasons a ray stops before the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayFailure {
    /// Total internal reflection
    Tir,
    /// Outside the clear aperture
    ApertureMiss,
    /// Intersection solver did not converge or the ray never reaches the surface
    NoConvergence,
    /// Sag undefined at the hit radius
    Domain,
}
impl fmt::Display for RayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RayFailure::Tir => "total internal reflection",
            RayFailure::ApertureMiss => "aperture miss",
            RayFailure::NoConvergence => "no intersection",
            RayFailure::Domain => "outside sag domain",
        };
        write!(f, "{}", s)
    }
}

/// Terminal ray states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayStatus {
    AtImage,
    Vignetted { surface: usize, reason: RayFailure },
}
impl RayStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RayStatus::AtImage)
    }
}
impl fmt::Display for RayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RayStatus::AtImage => write!(f, "at image"),
            RayStatus::Vignetted { surface, reason } => {
                write!(f, "vignetted at surface #{}: {}", surface, reason)
            }
        }
    }
}
