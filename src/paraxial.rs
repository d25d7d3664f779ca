//!
//! # Paraxial optics
//!
//! First order y–nu trace through the surface table, decenters and tilts are
//! ignored. With $\phi=(n^\prime-n)c$ the power of a surface,
//! $$n^\prime u^\prime = nu - y\phi,\quad y_{i+1} = y_i + t_i\frac{n^\prime u^\prime}{n^\prime}.$$
//! Signed indices make mirrors fit the same equations.

use crate::{
    error::{Error, Result},
    surface::SurfaceKind,
    system::OpticalSystem,
};

pub struct Paraxial<'a> {
    system: &'a OpticalSystem,
}
impl<'a> Paraxial<'a> {
    pub fn new(system: &'a OpticalSystem) -> Self {
        Self { system }
    }
    /// Last surface before the image
    fn last(&self) -> usize {
        self.system.image() - 1
    }
    /// Heights and reduced angles `(y, nu')` right after surfaces `1..=last`,
    /// starting with height `y` and reduced angle `nu` at surface 1
    pub fn trace(&self, y: f64, nu: f64, last: usize) -> Vec<(f64, f64)> {
        let system = self.system;
        let mut y = y;
        let mut nu = nu;
        let mut out = Vec::with_capacity(last);
        for i in 1..=last {
            if i > 1 {
                y += system.surface(i - 1).thickness * nu / system.index_after(i - 1);
            }
            let surface = system.surface(i);
            if surface.is_optical() && surface.kind != SurfaceKind::Image {
                let power = (system.index_after(i) - system.index_after(i - 1)) * surface.curvature();
                nu -= y * power;
            }
            out.push((y, nu));
        }
        out
    }
    /// Axial ray from a finite object point with reduced angle `nu`
    fn trace_from_object(&self, nu: f64, last: usize) -> Vec<(f64, f64)> {
        let y1 = self.system.object_distance() * nu / self.system.object_index();
        self.trace(y1, nu, last)
    }
    fn image_space_ray(&self) -> Result<(f64, f64)> {
        let last = self.last();
        let rays = if self.system.is_infinite_object() {
            self.trace(1., 0., last)
        } else {
            self.trace_from_object(self.system.object_index(), last)
        };
        rays.last()
            .copied()
            .ok_or_else(|| Error::internal("paraxial", "empty surface table"))
    }
    /// Effective focal length [mm]
    pub fn efl(&self) -> Result<f64> {
        let (_, nu) = self
            .trace(1., 0., self.last())
            .last()
            .copied()
            .ok_or_else(|| Error::internal("paraxial", "empty surface table"))?;
        if nu.abs() < 1e-15 {
            return Err(Error::invalid_input("paraxial", "afocal system"));
        }
        Ok(-1. / nu)
    }
    /// Back focal length: distance from the last surface to the paraxial focus [mm]
    pub fn bfl(&self) -> Result<f64> {
        let (y, nu) = self
            .trace(1., 0., self.last())
            .last()
            .copied()
            .ok_or_else(|| Error::internal("paraxial", "empty surface table"))?;
        self.focus_distance(y, nu)
    }
    fn focus_distance(&self, y: f64, nu: f64) -> Result<f64> {
        if nu.abs() < 1e-15 {
            return Err(Error::invalid_input("paraxial", "image at infinity"));
        }
        Ok(-y * self.system.index_after(self.last()) / nu)
    }
    /// Distance from the last surface to the paraxial image of the axial object point [mm]
    pub fn image_distance(&self) -> Result<f64> {
        let (y, nu) = self.image_space_ray()?;
        self.focus_distance(y, nu)
    }
    /// Paraxial height of the axial ray at the stop per unit input
    fn stop_height(&self) -> Result<(f64, f64)> {
        let (stop, radius) = self.system.stop_radius()?;
        let rays = if self.system.is_infinite_object() {
            self.trace(1., 0., stop)
        } else {
            self.trace_from_object(self.system.object_index(), stop)
        };
        let (y, _) = rays
            .last()
            .copied()
            .ok_or_else(|| Error::internal("paraxial", "empty surface table"))?;
        if y.abs() < 1e-15 {
            return Err(Error::invalid_input(
                "paraxial",
                "stop is conjugated to the object",
            ));
        }
        Ok((y.abs(), radius))
    }
    /// Entrance pupil diameter [mm] of a system with an object at infinity
    pub fn entrance_pupil_diameter(&self) -> Result<f64> {
        if !self.system.is_infinite_object() {
            return Err(Error::invalid_input(
                "paraxial",
                "entrance pupil diameter needs an object at infinity",
            ));
        }
        let (y, radius) = self.stop_height()?;
        Ok(2. * radius / y)
    }
    /// Object space numerical aperture $n\sin u\approx nu$ of a finite conjugate system
    pub fn object_na(&self) -> Result<f64> {
        if self.system.is_infinite_object() {
            return Err(Error::invalid_input(
                "paraxial",
                "numerical aperture needs a finite object",
            ));
        }
        let (y, radius) = self.stop_height()?;
        Ok(self.system.object_index().abs() * radius / y)
    }
    /// Working F-number $1/(2|n^\prime u^\prime|)$ of the marginal ray
    pub fn working_f_number(&self) -> Result<f64> {
        let (y, radius) = self.stop_height()?;
        let (_, nu) = self.image_space_ray()?;
        let nu_marginal = nu * radius / y;
        if nu_marginal.abs() < 1e-15 {
            return Err(Error::invalid_input("paraxial", "afocal system"));
        }
        Ok(1. / (2. * nu_marginal.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{glass::GlassCatalog, surface::Surface};

    fn thick_lens() -> OpticalSystem {
        OpticalSystem::new(
            vec![
                Surface::object(f64::INFINITY),
                Surface::standard(50., 1.).set_index(1.5).set_semi_diameter(5.),
                Surface::standard(-50., 40.).set_semi_diameter(5.),
                Surface::image(),
            ],
            0.55,
            &GlassCatalog::new(),
        )
        .unwrap()
    }

    #[test]
    fn lensmaker() {
        let system = thick_lens();
        let paraxial = Paraxial::new(&system);
        let phi = 0.01 + 0.01 - 1e-4 / 1.5;
        assert!((paraxial.efl().unwrap() - 1. / phi).abs() < 1e-9);
        let bfl = (1. - 0.01 / 1.5) / phi;
        assert!((paraxial.bfl().unwrap() - bfl).abs() < 1e-9);
        assert!((paraxial.image_distance().unwrap() - bfl).abs() < 1e-9);
        assert!((paraxial.entrance_pupil_diameter().unwrap() - 10.).abs() < 1e-12);
        assert!((paraxial.working_f_number().unwrap() - 0.1 / phi).abs() < 1e-9);
    }

    #[test]
    fn finite_conjugates() {
        // thin lens f=50 with the object at 2f images at 2f
        let system = OpticalSystem::new(
            vec![
                Surface::object(100.),
                Surface::standard(50., 0.).set_index(1.5).set_semi_diameter(5.),
                Surface::standard(-50., 100.).set_semi_diameter(5.),
                Surface::image(),
            ],
            0.55,
            &GlassCatalog::new(),
        )
        .unwrap();
        let paraxial = Paraxial::new(&system);
        assert!((paraxial.image_distance().unwrap() - 100.).abs() < 1e-9);
        assert!((paraxial.object_na().unwrap() - 0.05).abs() < 1e-12);
        assert!((paraxial.working_f_number().unwrap() - 10.).abs() < 1e-9);
        assert!(paraxial.entrance_pupil_diameter().is_err());
    }

    #[test]
    fn concave_mirror() {
        let system = OpticalSystem::new(
            vec![
                Surface::object(f64::INFINITY),
                Surface::mirror(-200., -100.).set_semi_diameter(10.),
                Surface::image(),
            ],
            0.55,
            &GlassCatalog::new(),
        )
        .unwrap();
        let paraxial = Paraxial::new(&system);
        assert!((paraxial.efl().unwrap() - 100.).abs() < 1e-9);
        assert!((paraxial.bfl().unwrap() + 100.).abs() < 1e-9);
    }
}
