//!
//! # Optical system
//!
//! [`OpticalSystem`] is a validated surface table evaluated at one wavelength:
//! surface world frames, figures, clear apertures, the signed refractive
//! index behind every surface and the aperture stop.

use crate::{
    error::{Error, Result},
    frame::{build_frames, Frame},
    glass::IndexModel,
    surface::{Aperture, Asphere, Medium, Surface, SurfaceKind},
};
use std::fmt;

#[derive(Debug, Clone)]
pub struct OpticalSystem {
    surfaces: Vec<Surface>,
    frames: Vec<Frame>,
    aspheres: Vec<Asphere>,
    apertures: Vec<Aperture>,
    indices: Vec<f64>,
    wavelength: f64,
    stop: Option<usize>,
}
impl OpticalSystem {
    /// Validates the surface table and resolves the refractive indices at `wavelength` [µm]
    pub fn new(surfaces: Vec<Surface>, wavelength: f64, model: &dyn IndexModel) -> Result<Self> {
        if !(wavelength.is_finite() && wavelength > 0.) {
            return Err(Error::invalid_input(
                "system",
                format!("wavelength must be positive, found {}", wavelength),
            ));
        }
        let stop = validate(&surfaces)?;
        let indices = resolve_indices(&surfaces, wavelength, model)?;
        let frames = build_frames(&surfaces);
        let aspheres = surfaces.iter().map(|s| s.asphere()).collect();
        let apertures = surfaces.iter().map(|s| s.aperture()).collect();
        Ok(Self {
            surfaces,
            frames,
            aspheres,
            apertures,
            indices,
            wavelength,
            stop,
        })
    }
    /// Same system with the distance from the last surface to the image set to `thickness`
    pub fn refocus(&mut self, thickness: f64) -> Result<()> {
        if !thickness.is_finite() {
            return Err(Error::invalid_input(
                "system",
                format!("image distance must be finite, found {}", thickness),
            ));
        }
        let last = self.surfaces.len() - 2;
        self.surfaces[last].thickness = thickness;
        self.frames = build_frames(&self.surfaces);
        Ok(())
    }
    pub fn len(&self) -> usize {
        self.surfaces.len()
    }
    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }
    pub fn surface(&self, i: usize) -> &Surface {
        &self.surfaces[i]
    }
    pub fn frame(&self, i: usize) -> &Frame {
        &self.frames[i]
    }
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
    pub fn asphere(&self, i: usize) -> &Asphere {
        &self.aspheres[i]
    }
    pub fn aperture(&self, i: usize) -> Aperture {
        self.apertures[i]
    }
    /// Signed refractive index on the +z side of surface `i`
    pub fn index_after(&self, i: usize) -> f64 {
        self.indices[i]
    }
    pub fn indices(&self) -> &[f64] {
        &self.indices
    }
    pub fn object_index(&self) -> f64 {
        self.indices[0]
    }
    pub fn image_index(&self) -> f64 {
        self.indices[self.indices.len() - 1]
    }
    pub fn image(&self) -> usize {
        self.surfaces.len() - 1
    }
    /// Wavelength [µm]
    pub fn wavelength(&self) -> f64 {
        self.wavelength
    }
    pub fn is_infinite_object(&self) -> bool {
        self.surfaces[0].thickness.is_infinite()
    }
    pub fn object_distance(&self) -> f64 {
        self.surfaces[0].thickness
    }
    /// Aperture stop surface index
    pub fn stop(&self) -> Option<usize> {
        self.stop
    }
    /// Aperture stop surface index and semi-diameter
    pub fn stop_radius(&self) -> Result<(usize, f64)> {
        let stop = self
            .stop
            .ok_or_else(|| Error::invalid_input("system", "no aperture stop: no surface has a semi-diameter"))?;
        match self.apertures[stop].radius() {
            Some(r) if r > 0. => Ok((stop, r)),
            _ => Err(Error::invalid_input(
                "system",
                format!("stop surface #{} has no semi-diameter", stop),
            )),
        }
    }
}
impl fmt::Display for OpticalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "λ = {:.4}µm", self.wavelength)?;
        for (i, surface) in self.surfaces.iter().enumerate() {
            writeln!(
                f,
                "#{:02}{} {} n'={:+.6}",
                i,
                if Some(i) == self.stop { "*" } else { " " },
                surface,
                self.indices[i]
            )?;
        }
        Ok(())
    }
}

/// Checks the table structure and returns the aperture stop
fn validate(surfaces: &[Surface]) -> Result<Option<usize>> {
    let n = surfaces.len();
    if n < 3 {
        return Err(Error::invalid_input(
            "system",
            format!("at least 3 surfaces (object, surface, image) required, found {}", n),
        ));
    }
    if surfaces[0].kind != SurfaceKind::Object {
        return Err(Error::invalid_input("system", "first surface must be OBJECT"));
    }
    if surfaces[n - 1].kind != SurfaceKind::Image {
        return Err(Error::invalid_input("system", "last surface must be IMAGE"));
    }
    let mut stops = vec![];
    for (i, surface) in surfaces.iter().enumerate() {
        surface.validate(i)?;
        match surface.kind {
            SurfaceKind::Object if i > 0 => {
                return Err(Error::invalid_input("system", format!("#{}: second OBJECT", i)))
            }
            SurfaceKind::Image if i < n - 1 => {
                return Err(Error::invalid_input("system", format!("#{}: second IMAGE", i)))
            }
            SurfaceKind::Stop => stops.push(i),
            _ => (),
        }
        if surface.reflective && !surface.is_optical() {
            return Err(Error::invalid_input(
                "system",
                format!("#{}: {} cannot be reflective", i, surface.kind),
            ));
        }
    }
    match stops.len() {
        0 => {
            // smallest semi-diameter, first one on ties
            let stop = surfaces
                .iter()
                .enumerate()
                .skip(1)
                .take(n - 2)
                .filter(|(_, s)| s.kind != SurfaceKind::CoordinateBreak)
                .filter_map(|(i, s)| s.semi_diameter.filter(|sd| *sd > 0.).map(|sd| (i, sd)))
                .fold(None, |acc: Option<(usize, f64)>, (i, sd)| match acc {
                    Some((_, best)) if best <= sd => acc,
                    _ => Some((i, sd)),
                })
                .map(|(i, _)| i);
            if let Some(i) = stop {
                log::debug!("no STOP surface, using #{} (smallest semi-diameter)", i);
            }
            Ok(stop)
        }
        1 => Ok(Some(stops[0])),
        _ => Err(Error::invalid_input(
            "system",
            format!("only one STOP allowed, found {:?}", stops),
        )),
    }
}

/// Signed index behind each surface: negative after an odd number of mirrors
fn resolve_indices(surfaces: &[Surface], wavelength: f64, model: &dyn IndexModel) -> Result<Vec<f64>> {
    let mut indices = Vec::with_capacity(surfaces.len());
    let mut parity = 1f64;
    for (i, surface) in surfaces.iter().enumerate() {
        let inherit = i > 0
            && matches!(
                surface.kind,
                SurfaceKind::CoordinateBreak | SurfaceKind::Image
            );
        if inherit {
            let previous: f64 = indices[i - 1];
            indices.push(previous);
            continue;
        }
        if surface.reflective {
            parity = -parity;
        }
        let n = match &surface.index_after {
            Medium::Air => 1.,
            Medium::Index(n) => *n,
            Medium::Glass(name) => model.index(name, wavelength).ok_or_else(|| {
                Error::invalid_input("system", format!("#{}: unknown material {}", i, name))
            })?,
        };
        if !(n.is_finite() && n > 0.) {
            return Err(Error::invalid_input(
                "system",
                format!("#{}: invalid index {} for {}", i, n, surface.index_after),
            ));
        }
        indices.push(parity * n);
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, glass::GlassCatalog};

    fn singlet() -> Vec<Surface> {
        vec![
            Surface::object(f64::INFINITY),
            Surface::standard(51.68, 5.)
                .set_material("N-BK7")
                .set_semi_diameter(12.5),
            Surface::standard(f64::INFINITY, 95.).set_semi_diameter(12.5),
            Surface::image(),
        ]
    }

    #[test]
    fn resolves_indices_and_stop() {
        let system = OpticalSystem::new(singlet(), 0.5875618, &GlassCatalog::builtin()).unwrap();
        assert!((system.index_after(1) - 1.5168).abs() < 1e-4);
        assert_eq!(system.index_after(2), 1.);
        assert_eq!(system.image_index(), 1.);
        // tie on semi-diameters: first surface wins
        assert_eq!(system.stop(), Some(1));
        assert!(system.is_infinite_object());
    }

    #[test]
    fn invalid_tables() {
        let catalog = GlassCatalog::builtin();
        let mut surfaces = singlet();
        surfaces.swap(0, 1);
        let e = OpticalSystem::new(surfaces, 0.5, &catalog).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidInput);
        assert!(OpticalSystem::new(singlet(), 0., &catalog).is_err());
        let mut surfaces = singlet();
        surfaces[1] = surfaces[1].clone().set_material("UNOBTAINIUM");
        assert!(OpticalSystem::new(surfaces, 0.5, &catalog).is_err());
        let mut surfaces = singlet();
        surfaces.insert(2, Surface::stop(3., 0.));
        surfaces.insert(2, Surface::stop(3., 0.));
        assert!(OpticalSystem::new(surfaces, 0.5, &catalog).is_err());
    }

    #[test]
    fn mirror_flips_index_sign() {
        let surfaces = vec![
            Surface::object(f64::INFINITY),
            Surface::coordinate_break([0., 0.], [45., 0., 0.], 0.),
            Surface::mirror(f64::INFINITY, 0.).set_semi_diameter(5.),
            Surface::coordinate_break([0., 0.], [45., 0., 0.], -10.),
            Surface::image(),
        ];
        let system = OpticalSystem::new(surfaces, 0.5, &GlassCatalog::new()).unwrap();
        assert_eq!(system.indices(), &[1., 1., -1., -1., -1.]);
        assert_eq!(system.stop(), Some(2));
    }

    #[test]
    fn refocus_moves_image() {
        let mut system = OpticalSystem::new(singlet(), 0.55, &GlassCatalog::builtin()).unwrap();
        system.refocus(90.).unwrap();
        assert!((system.frame(3).origin.z - 95.).abs() < 1e-12);
    }
}
