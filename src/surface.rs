//!
//! # Surface table
//!
//! A [`Surface`] is one record of the sequential surface table: its kind, its
//! figure (radius, conic and aspheric terms), its clear aperture, its pose
//! relative to the previous surface and the medium behind it.
//! [`Asphere`] is the figure alone, it evaluates the sag
//! $$z(r)=\frac{cr^2}{1+\sqrt{1-(1+\kappa)c^2r^2}}+\sum_{j=1}^{10} a_{2j+2}r^{2j+2}+\sum_{i=1}^{10} b_{2i+1}r^{2i+1},$$
//! its radial slope and its normal.

use crate::error::{Error, Result};
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

pub type Vector = na::Vector3<f64>;

/// Maximum number of even (and of odd) aspheric coefficients
pub const MAX_ASPHERIC_TERMS: usize = 10;

/// Surface categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurfaceKind {
    Object,
    Standard,
    Stop,
    CoordinateBreak,
    Image,
}
impl fmt::Display for SurfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SurfaceKind::Object => "OBJECT",
            SurfaceKind::Standard => "STANDARD",
            SurfaceKind::Stop => "STOP",
            SurfaceKind::CoordinateBreak => "COORDINATE_BREAK",
            SurfaceKind::Image => "IMAGE",
        };
        write!(f, "{}", s)
    }
}

/// Rotation composition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum TiltOrder {
    /// $R=R_xR_yR_z$
    #[default]
    XYZ,
    /// $R=R_zR_yR_x$
    ZYX,
}
impl TryFrom<u8> for TiltOrder {
    type Error = String;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(TiltOrder::XYZ),
            1 => Ok(TiltOrder::ZYX),
            _ => Err(format!("tilt_order must be 0 or 1, found {}", value)),
        }
    }
}
impl From<TiltOrder> for u8 {
    fn from(order: TiltOrder) -> u8 {
        match order {
            TiltOrder::XYZ => 0,
            TiltOrder::ZYX => 1,
        }
    }
}

/// Medium on the +z side of a surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(from = "MediumRepr", into = "MediumRepr")]
pub enum Medium {
    #[default]
    Air,
    /// Constant refractive index
    Index(f64),
    /// Named material resolved by an [`IndexModel`](crate::glass::IndexModel)
    Glass(String),
}
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MediumRepr {
    Index(f64),
    Name(String),
}
impl From<MediumRepr> for Medium {
    fn from(repr: MediumRepr) -> Self {
        match repr {
            MediumRepr::Index(n) => Medium::Index(n),
            MediumRepr::Name(name) if name.eq_ignore_ascii_case("air") || name.is_empty() => {
                Medium::Air
            }
            MediumRepr::Name(name) => Medium::Glass(name),
        }
    }
}
impl From<Medium> for MediumRepr {
    fn from(medium: Medium) -> Self {
        match medium {
            Medium::Air => MediumRepr::Name("AIR".to_owned()),
            Medium::Index(n) => MediumRepr::Index(n),
            Medium::Glass(name) => MediumRepr::Name(name),
        }
    }
}
impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Medium::Air => write!(f, "AIR"),
            Medium::Index(n) => write!(f, "n={}", n),
            Medium::Glass(name) => write!(f, "{}", name),
        }
    }
}

/// Lengths that may be infinite: a JSON number or one of `"inf"`, `"-inf"`, `"infinity"`
mod length {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }
    pub fn serialize<S: Serializer>(x: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if x.is_infinite() {
            serializer.serialize_str(if *x > 0. { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*x)
        }
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(x) => Ok(x),
            Repr::Text(s) => match s.trim().to_lowercase().as_str() {
                "inf" | "+inf" | "infinity" | "∞" => Ok(f64::INFINITY),
                "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
                other => other
                    .parse::<f64>()
                    .map_err(|_| de::Error::custom(format!("invalid length: {}", s))),
            },
        }
    }
}

fn infinite() -> f64 {
    f64::INFINITY
}

/// Surface table record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Surface {
    pub kind: SurfaceKind,
    /// Radius of curvature [mm], infinite for a plane
    #[serde(default = "infinite", with = "length")]
    pub radius: f64,
    /// Distance to the next surface along the local +z axis [mm]
    #[serde(default, with = "length")]
    pub thickness: f64,
    #[serde(default)]
    pub conic: f64,
    /// Even coefficients `a4, a6, ..., a22`
    #[serde(default)]
    pub aspheric: Vec<f64>,
    /// Odd coefficients `b3, b5, ..., b21`
    #[serde(default)]
    pub aspheric_odd: Vec<f64>,
    /// Circular clear aperture radius [mm]
    #[serde(default)]
    pub semi_diameter: Option<f64>,
    /// Rectangular aperture half-widths [mm]
    #[serde(default)]
    pub rectangular: Option<[f64; 2]>,
    /// Decenter `(dx,dy)` [mm]
    #[serde(default)]
    pub decenter: [f64; 2],
    /// Tilts `(tx,ty,tz)` [deg]
    #[serde(default)]
    pub tilt: [f64; 3],
    #[serde(default)]
    pub tilt_order: TiltOrder,
    #[serde(default)]
    pub index_after: Medium,
    #[serde(default)]
    pub reflective: bool,
    /// Free text label, not used by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}
impl Default for Surface {
    fn default() -> Self {
        Self {
            kind: SurfaceKind::Standard,
            radius: f64::INFINITY,
            thickness: 0.,
            conic: 0.,
            aspheric: vec![],
            aspheric_odd: vec![],
            semi_diameter: None,
            rectangular: None,
            decenter: [0.; 2],
            tilt: [0.; 3],
            tilt_order: TiltOrder::XYZ,
            index_after: Medium::Air,
            reflective: false,
            tag: None,
        }
    }
}
impl Surface {
    /// Object surface at `thickness` in front of the first surface (infinite for an object at infinity)
    pub fn object(thickness: f64) -> Self {
        Self {
            kind: SurfaceKind::Object,
            thickness,
            ..Default::default()
        }
    }
    /// Refracting surface
    pub fn standard(radius: f64, thickness: f64) -> Self {
        Self {
            radius,
            thickness,
            ..Default::default()
        }
    }
    /// Plane aperture stop
    pub fn stop(semi_diameter: f64, thickness: f64) -> Self {
        Self {
            kind: SurfaceKind::Stop,
            thickness,
            semi_diameter: Some(semi_diameter),
            ..Default::default()
        }
    }
    /// Coordinate break: decenter and tilt the following surfaces
    pub fn coordinate_break(decenter: [f64; 2], tilt: [f64; 3], thickness: f64) -> Self {
        Self {
            kind: SurfaceKind::CoordinateBreak,
            decenter,
            tilt,
            thickness,
            ..Default::default()
        }
    }
    pub fn image() -> Self {
        Self {
            kind: SurfaceKind::Image,
            ..Default::default()
        }
    }
    /// Mirror
    pub fn mirror(radius: f64, thickness: f64) -> Self {
        Self {
            radius,
            thickness,
            reflective: true,
            ..Default::default()
        }
    }
    pub fn set_kind(self, kind: SurfaceKind) -> Self {
        Self { kind, ..self }
    }
    pub fn set_conic(self, conic: f64) -> Self {
        Self { conic, ..self }
    }
    pub fn set_aspheric(self, aspheric: Vec<f64>) -> Self {
        Self { aspheric, ..self }
    }
    pub fn set_aspheric_odd(self, aspheric_odd: Vec<f64>) -> Self {
        Self {
            aspheric_odd,
            ..self
        }
    }
    pub fn set_semi_diameter(self, semi_diameter: f64) -> Self {
        Self {
            semi_diameter: Some(semi_diameter),
            ..self
        }
    }
    pub fn set_rectangular(self, half_widths: [f64; 2]) -> Self {
        Self {
            rectangular: Some(half_widths),
            ..self
        }
    }
    pub fn set_decenter(self, decenter: [f64; 2]) -> Self {
        Self { decenter, ..self }
    }
    pub fn set_tilt(self, tilt: [f64; 3], tilt_order: TiltOrder) -> Self {
        Self {
            tilt,
            tilt_order,
            ..self
        }
    }
    pub fn set_material<S: Into<String>>(self, name: S) -> Self {
        Self {
            index_after: Medium::Glass(name.into()),
            ..self
        }
    }
    pub fn set_index(self, n: f64) -> Self {
        Self {
            index_after: Medium::Index(n),
            ..self
        }
    }
    pub fn set_thickness(self, thickness: f64) -> Self {
        Self { thickness, ..self }
    }
    pub fn is_plane(&self) -> bool {
        self.radius.is_infinite()
    }
    /// Curvature `1/R`, 0 for a plane
    pub fn curvature(&self) -> f64 {
        if self.is_plane() {
            0.
        } else {
            1. / self.radius
        }
    }
    /// Whether the surface changes the ray direction
    pub fn is_optical(&self) -> bool {
        !matches!(
            self.kind,
            SurfaceKind::Object | SurfaceKind::CoordinateBreak
        )
    }
    pub fn has_pose(&self) -> bool {
        self.decenter.iter().chain(self.tilt.iter()).any(|x| *x != 0.)
    }
    /// Surface figure
    pub fn asphere(&self) -> Asphere {
        Asphere::new(self.curvature(), self.conic)
            .even(self.aspheric.clone())
            .odd(self.aspheric_odd.clone())
    }
    /// Clear aperture
    pub fn aperture(&self) -> Aperture {
        match (self.rectangular, self.semi_diameter) {
            (Some([hx, hy]), _) => Aperture::Rectangular { hx, hy },
            (None, Some(r)) if r > 0. => Aperture::Circular(r),
            _ => Aperture::Unbounded,
        }
    }
    /// Checks the record on its own, independently of the rest of the table
    pub fn validate(&self, index: usize) -> Result<()> {
        let fail = |detail: String| Err(Error::invalid_input("surface", format!("#{}: {}", index, detail)));
        if self.radius == 0. || self.radius.is_nan() {
            return fail(format!("radius must be non-zero, found {}", self.radius));
        }
        if !self.conic.is_finite() {
            return fail(format!("conic must be finite, found {}", self.conic));
        }
        if self.aspheric.len() > MAX_ASPHERIC_TERMS || self.aspheric_odd.len() > MAX_ASPHERIC_TERMS {
            return fail(format!(
                "at most {} even and {} odd aspheric coefficients",
                MAX_ASPHERIC_TERMS, MAX_ASPHERIC_TERMS
            ));
        }
        if self
            .aspheric
            .iter()
            .chain(self.aspheric_odd.iter())
            .any(|a| !a.is_finite())
        {
            return fail("aspheric coefficients must be finite".into());
        }
        if self.thickness.is_nan() || (self.thickness.is_infinite() && self.kind != SurfaceKind::Object) {
            return fail(format!("invalid thickness {}", self.thickness));
        }
        if let Some(sd) = self.semi_diameter {
            if !(sd.is_finite() && sd >= 0.) {
                return fail(format!("invalid semi-diameter {}", sd));
            }
        }
        if let Some([hx, hy]) = self.rectangular {
            if !(hx > 0. && hy > 0. && hx.is_finite() && hy.is_finite()) {
                return fail(format!("invalid rectangular aperture [{},{}]", hx, hy));
            }
        }
        if self
            .decenter
            .iter()
            .chain(self.tilt.iter())
            .any(|x| !x.is_finite())
        {
            return fail("decenter and tilt must be finite".into());
        }
        match &self.index_after {
            Medium::Index(n) if !(n.is_finite() && *n > 0.) => {
                fail(format!("refractive index must be positive, found {}", n))
            }
            _ => Ok(()),
        }
    }
}
impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} R={:>12.4} t={:>10.4} k={:+.4} sd={:?} {}{}",
            self.kind.to_string(),
            self.radius,
            self.thickness,
            self.conic,
            self.semi_diameter,
            self.index_after,
            if self.reflective { " MIRROR" } else { "" }
        )
    }
}

/// Relative tolerance of the clear aperture edge, covers the stop aiming residual
const APERTURE_SLACK: f64 = 1e-8;

/// Surface clear aperture
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aperture {
    Unbounded,
    /// Semi-diameter
    Circular(f64),
    /// Half-widths along x and y
    Rectangular { hx: f64, hy: f64 },
}
impl Aperture {
    /// Whether the local point `(x,y)` is inside the aperture
    pub fn contains(&self, x: f64, y: f64) -> bool {
        match *self {
            Aperture::Unbounded => true,
            Aperture::Circular(r) => x.hypot(y) <= r * (1. + APERTURE_SLACK),
            Aperture::Rectangular { hx, hy } => {
                x.abs() <= hx * (1. + APERTURE_SLACK) && y.abs() <= hy * (1. + APERTURE_SLACK)
            }
        }
    }
    /// Radius of the circle enclosing the aperture
    pub fn radius(&self) -> Option<f64> {
        match *self {
            Aperture::Unbounded => None,
            Aperture::Circular(r) => Some(r),
            Aperture::Rectangular { hx, hy } => Some(hx.hypot(hy)),
        }
    }
}

/// Rotationally symmetric conic with even and odd polynomial terms
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Asphere {
    /// Curvature $c=1/R$
    pub curvature: f64,
    /// Conic constant $\kappa$
    pub conic: f64,
    even: Vec<f64>,
    odd: Vec<f64>,
}
impl Asphere {
    pub fn new(curvature: f64, conic: f64) -> Self {
        Self {
            curvature,
            conic,
            ..Default::default()
        }
    }
    /// Sets the even terms `a4, a6, ...`
    pub fn even(self, even: Vec<f64>) -> Self {
        Self { even, ..self }
    }
    /// Sets the odd terms `b3, b5, ...`, an empty list disables them
    pub fn odd(self, odd: Vec<f64>) -> Self {
        Self { odd, ..self }
    }
    pub fn is_plane(&self) -> bool {
        self.curvature == 0. && self.even.is_empty() && self.odd.is_empty()
    }
    fn discriminant(&self, r2: f64) -> f64 {
        1. - (1. + self.conic) * self.curvature * self.curvature * r2
    }
    /// Sag at radius `r`, `None` outside the sag domain
    pub fn sag(&self, r: f64) -> Option<f64> {
        let r2 = r * r;
        let c = self.curvature;
        let mut z = if c == 0. {
            0.
        } else {
            let d = self.discriminant(r2);
            if d <= 0. {
                return None;
            }
            c * r2 / (1. + d.sqrt())
        };
        // a4 r^4 + a6 r^6 + ...
        let mut rn = r2 * r2;
        for a in &self.even {
            z += a * rn;
            rn *= r2;
        }
        // b3 r^3 + b5 r^5 + ...
        let mut rn = r2 * r.abs();
        for b in &self.odd {
            z += b * rn;
            rn *= r2;
        }
        if z.is_finite() {
            Some(z)
        } else {
            None
        }
    }
    /// Radial slope $dz/dr$ at radius `r`, `None` outside the sag domain
    pub fn slope(&self, r: f64) -> Option<f64> {
        let r = r.abs();
        let r2 = r * r;
        let c = self.curvature;
        let mut s = if c == 0. {
            0.
        } else {
            let d = self.discriminant(r2);
            if d <= 0. {
                return None;
            }
            c * r / d.sqrt()
        };
        let mut rn = r2 * r;
        for (j, a) in self.even.iter().enumerate() {
            s += (2 * j + 4) as f64 * a * rn;
            rn *= r2;
        }
        let mut rn = r2;
        for (i, b) in self.odd.iter().enumerate() {
            s += (2 * i + 3) as f64 * b * rn;
            rn *= r2;
        }
        if s.is_finite() {
            Some(s)
        } else {
            None
        }
    }
    /// Unit normal $(-z'x/r,-z'y/r,1)/\|\cdot\|$ at the local point `(x,y)`
    pub fn normal(&self, x: f64, y: f64) -> Option<Vector> {
        let r = x.hypot(y);
        if r < f64::EPSILON * 1e-3 {
            return Some(Vector::z());
        }
        let s = self.slope(r)?;
        Some(Vector::new(-s * x / r, -s * y / r, 1.).normalize())
    }
    /// Sag evaluated over a set of radii, NaN outside the domain
    pub fn sag_batch(&self, radii: &[f64]) -> Vec<f64> {
        radii
            .iter()
            .map(|r| self.sag(*r).unwrap_or(f64::NAN))
            .collect()
    }
    /// Radius beyond which the sag is undefined
    pub fn domain_radius(&self) -> f64 {
        let q = (1. + self.conic) * self.curvature * self.curvature;
        if q > 0. {
            1. / q.sqrt()
        } else {
            f64::INFINITY
        }
    }
}
