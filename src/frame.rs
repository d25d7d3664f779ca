//!
//! # Local frames
//!
//! Every surface lives in its own right-handed frame: the origin is the
//! surface vertex and the local $z$ axis is the surface axis.
//! The frame of surface $i$ is derived from the chain frame carried from
//! surface $i-1$: the chain origin moves by the previous thickness along the
//! chain $z$ axis, then the surface decenter and tilts move the chain.
//! A pose therefore carries to every following surface, whether it belongs
//! to a coordinate break or to an optical surface.

use crate::surface::{Surface, SurfaceKind, TiltOrder, Vector};
use nalgebra as na;
use std::fmt;

pub type Matrix = na::Matrix3<f64>;

/// Elemental rotation of angle `o` [rd] around the axis `axis` (0: x, 1: y, 2: z)
#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    pub o: f64,
    pub axis: u8,
}
impl Rotation {
    pub fn new(o: f64, axis: u8) -> Rotation {
        Rotation { o, axis }
    }
    /// Active rotation matrix
    pub fn matrix(&self) -> Matrix {
        let (s, c) = self.o.sin_cos();
        match self.axis {
            0 => Matrix::new(1., 0., 0., 0., c, -s, 0., s, c),
            1 => Matrix::new(c, 0., s, 0., 1., 0., -s, 0., c),
            _ => Matrix::new(c, -s, 0., s, c, 0., 0., 0., 1.),
        }
    }
}

/// Rotation matrix from tilts `[tx,ty,tz]` in degrees
pub fn tilt_matrix(tilt: [f64; 3], order: TiltOrder) -> Matrix {
    let rx = Rotation::new(tilt[0].to_radians(), 0).matrix();
    let ry = Rotation::new(tilt[1].to_radians(), 1).matrix();
    let rz = Rotation::new(tilt[2].to_radians(), 2).matrix();
    match order {
        TiltOrder::XYZ => rx * ry * rz,
        TiltOrder::ZYX => rz * ry * rx,
    }
}

/// Surface pose in world coordinates
///
/// The columns of `rotation` are the local axes expressed in the world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub origin: Vector,
    pub rotation: Matrix,
}
impl Default for Frame {
    fn default() -> Self {
        Self {
            origin: Vector::zeros(),
            rotation: Matrix::identity(),
        }
    }
}
impl Frame {
    pub fn new(origin: Vector, rotation: Matrix) -> Self {
        Self { origin, rotation }
    }
    /// World point to local point
    pub fn to_local(&self, p: &Vector) -> Vector {
        self.rotation.tr_mul(&(p - self.origin))
    }
    /// World direction to local direction
    pub fn dir_to_local(&self, d: &Vector) -> Vector {
        self.rotation.tr_mul(d)
    }
    /// Local point to world point
    pub fn to_world(&self, p: &Vector) -> Vector {
        self.origin + self.rotation * p
    }
    /// Local direction to world direction
    pub fn dir_to_world(&self, d: &Vector) -> Vector {
        self.rotation * d
    }
    /// Local axes `[x, y, z]` in world coordinates
    pub fn axes(&self) -> [Vector; 3] {
        [
            self.rotation.column(0).into_owned(),
            self.rotation.column(1).into_owned(),
            self.rotation.column(2).into_owned(),
        ]
    }
    /// Frame moved along its own z axis
    pub fn advance(&self, distance: f64) -> Self {
        Self {
            origin: self.origin + self.rotation.column(2) * distance,
            ..*self
        }
    }
    /// Frame decentered in its own xy plane then tilted
    pub fn posed(&self, decenter: [f64; 2], tilt: [f64; 3], order: TiltOrder) -> Self {
        Self {
            origin: self.origin + self.rotation * Vector::new(decenter[0], decenter[1], 0.),
            rotation: self.rotation * tilt_matrix(tilt, order),
        }
    }
}
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [_, _, z] = self.axes();
        write!(
            f,
            "O: [{:+12.6},{:+12.6},{:+12.6}] ; Z: [{:+.6},{:+.6},{:+.6}]",
            self.origin[0], self.origin[1], self.origin[2], z[0], z[1], z[2]
        )
    }
}

/// World frames of every surface of the table
///
/// The first surface after the object sits at the world origin; a finite
/// object sits at $z=-t_0$ and an infinite one is given the default frame.
pub fn build_frames(surfaces: &[Surface]) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(surfaces.len());
    let mut chain = Frame::default();
    for (i, surface) in surfaces.iter().enumerate() {
        if i == 0 {
            let t0 = surface.thickness;
            let object = if surface.kind == SurfaceKind::Object && t0.is_finite() {
                chain.advance(-t0)
            } else {
                chain
            };
            frames.push(object);
            continue;
        }
        if surface.has_pose() {
            chain = chain.posed(surface.decenter, surface.tilt, surface.tilt_order);
        }
        frames.push(chain);
        chain = chain.advance(surface.thickness);
    }
    frames
}
