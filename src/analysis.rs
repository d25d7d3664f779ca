//!
//! # Wavefront analysis requests
//!
//! An analysis request is configured with the [`ANALYSIS`] builder and run
//! against a surface table:
//!
//! ```no_run
//! use optrace::{Field, GlassCatalog, PupilSpec, Surface, ANALYSIS};
//! let surfaces = vec![
//!     Surface::object(f64::INFINITY),
//!     Surface::standard(51.68, 5.).set_material("N-BK7").set_semi_diameter(2.5),
//!     Surface::standard(f64::INFINITY, 95.).set_semi_diameter(12.5),
//!     Surface::image(),
//! ];
//! let report = ANALYSIS::default()
//!     .set_wavelength(0.5876)
//!     .set_field(Field::angle(0., 0.))
//!     .set_pupil(PupilSpec::grid(64))
//!     .build(surfaces, &GlassCatalog::builtin())
//!     .and_then(|analysis| analysis.run())
//!     .unwrap();
//! println!("{}", report);
//! ```
//!
//! The surfaces are copied into one [`OpticalSystem`] per wavelength when the
//! request is built; the request itself is a pure function of its inputs.

use crate::{
    aim::{Aimer, ChiefRay, Edge, EdgeRays, MarginalRay},
    error::{Error, Result},
    field::Field,
    glass::IndexModel,
    paraxial::Paraxial,
    progress::{CancelToken, Monitor, Phase, ProgressSink},
    psf::{compute_mtf, compute_psf, marechal, MtfResult, PsfGeometry, PsfResult, PsfSettings},
    pupil::{build_pupil_map, PupilMap, PupilSpec},
    ray::Ray,
    surface::Surface,
    system::OpticalSystem,
    trace::{TraceResult, Tracer},
    units::Conversion,
    zernike::{ZernikeFit, DEFAULT_MODES},
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Primary wavelength and optional weighted wavelengths [µm]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WavelengthSpec {
    pub primary: f64,
    /// `(wavelength, weight)` pairs for the polychromatic Strehl ratio
    #[serde(default)]
    pub weighted: Vec<(f64, f64)>,
}
impl Default for WavelengthSpec {
    fn default() -> Self {
        Self::new(0.5876)
    }
}
impl WavelengthSpec {
    pub fn new(primary: f64) -> Self {
        Self {
            primary,
            weighted: vec![],
        }
    }
    pub fn with_weighted(self, weighted: Vec<(f64, f64)>) -> Self {
        Self { weighted, ..self }
    }
    fn validate(&self) -> Result<()> {
        let bad = |x: f64| !(x.is_finite() && x > 0.);
        if bad(self.primary) || self.weighted.iter().any(|(w, _)| bad(*w)) {
            return Err(Error::invalid_input(
                "analysis",
                format!("wavelengths must be positive: {:?}", self),
            ));
        }
        if self.weighted.iter().any(|(_, w)| !(w.is_finite() && *w >= 0.)) {
            return Err(Error::invalid_input(
                "analysis",
                "wavelength weights must be non-negative",
            ));
        }
        if !self.weighted.is_empty() && self.weighted.iter().map(|(_, w)| w).sum::<f64>() <= 0. {
            return Err(Error::invalid_input(
                "analysis",
                "wavelength weights sum to zero",
            ));
        }
        Ok(())
    }
}

/// Position of the image surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagePlacement {
    /// Image at the thickness of the surface table
    AsGiven,
    /// Image at the paraxial image of the primary wavelength
    Paraxial,
}
impl Default for ImagePlacement {
    fn default() -> Self {
        ImagePlacement::AsGiven
    }
}

/// Analysis request builder
///
/// Defaults: primary wavelength 0.5876µm, on-axis field, 64×64 grid,
/// image as given, 36 Zernike modes, PSF padding of 2, serial.
#[derive(Debug, Clone)]
pub struct ANALYSIS {
    pub wavelength: WavelengthSpec,
    pub field: Field,
    pub pupil: PupilSpec,
    pub image: ImagePlacement,
    pub zernike_modes: usize,
    pub fit_then_evaluate: bool,
    pub psf: PsfSettings,
    pub parallel: bool,
    monitor: Monitor,
}
impl Default for ANALYSIS {
    fn default() -> Self {
        ANALYSIS {
            wavelength: WavelengthSpec::default(),
            field: Field::default(),
            pupil: PupilSpec::default(),
            image: ImagePlacement::default(),
            zernike_modes: DEFAULT_MODES,
            fit_then_evaluate: false,
            psf: PsfSettings::default(),
            parallel: false,
            monitor: Monitor::default(),
        }
    }
}
impl ANALYSIS {
    /// Set the primary wavelength [µm]
    pub fn set_wavelength(self, primary: f64) -> Self {
        Self {
            wavelength: WavelengthSpec {
                primary,
                ..self.wavelength
            },
            ..self
        }
    }
    pub fn set_wavelengths(self, wavelength: WavelengthSpec) -> Self {
        Self { wavelength, ..self }
    }
    pub fn set_field(self, field: Field) -> Self {
        Self { field, ..self }
    }
    pub fn set_pupil(self, pupil: PupilSpec) -> Self {
        Self { pupil, ..self }
    }
    pub fn set_image_placement(self, image: ImagePlacement) -> Self {
        Self { image, ..self }
    }
    /// Set the number of fitted Zernike modes, 0 disables the fit
    pub fn set_zernike_modes(self, zernike_modes: usize) -> Self {
        Self {
            zernike_modes,
            ..self
        }
    }
    /// Use the Zernike reconstruction of the wavefront as PSF input
    pub fn set_fit_then_evaluate(self, fit_then_evaluate: bool) -> Self {
        Self {
            fit_then_evaluate,
            ..self
        }
    }
    pub fn set_psf(self, psf: PsfSettings) -> Self {
        Self { psf, ..self }
    }
    pub fn set_padding(self, padding: usize) -> Self {
        Self {
            psf: PsfSettings { padding, ..self.psf },
            ..self
        }
    }
    /// Set the encircled energy radii [µm]
    pub fn set_ee_radii(self, ee_radii: Vec<f64>) -> Self {
        Self {
            psf: PsfSettings { ee_radii, ..self.psf },
            ..self
        }
    }
    /// Trace the pupil grid rows on the rayon thread pool
    pub fn set_parallel(self, parallel: bool) -> Self {
        Self { parallel, ..self }
    }
    pub fn set_monitor(self, monitor: Monitor) -> Self {
        Self { monitor, ..self }
    }
    pub fn set_cancel(self, cancel: CancelToken) -> Self {
        let sink = self.monitor.sink();
        Self {
            monitor: Monitor::new(Some(cancel), sink),
            ..self
        }
    }
    pub fn set_progress(self, sink: Arc<dyn ProgressSink>) -> Self {
        let cancel = self.monitor.cancel_token();
        Self {
            monitor: Monitor::new(cancel, Some(sink)),
            ..self
        }
    }
    /// Validates the request and resolves the surface table at every wavelength
    pub fn build(self, surfaces: Vec<Surface>, model: &dyn IndexModel) -> Result<Analysis> {
        self.wavelength.validate()?;
        if self.fit_then_evaluate && self.zernike_modes == 0 {
            return Err(Error::invalid_input(
                "analysis",
                "fit-then-evaluate needs at least one Zernike mode",
            ));
        }
        if self.psf.padding == 0 {
            return Err(Error::invalid_input("analysis", "padding factor must be at least 1"));
        }
        let mut system = OpticalSystem::new(surfaces.clone(), self.wavelength.primary, model)?;
        let image_distance = match self.image {
            ImagePlacement::AsGiven => None,
            ImagePlacement::Paraxial => {
                let t = Paraxial::new(&system).image_distance()?;
                log::info!("analysis: paraxial image at {:.6}mm", t);
                system.refocus(t)?;
                Some(t)
            }
        };
        let secondary = self
            .wavelength
            .weighted
            .iter()
            .map(|&(wavelength, weight)| {
                let mut system = OpticalSystem::new(surfaces.clone(), wavelength, model)?;
                if let Some(t) = image_distance {
                    system.refocus(t)?;
                }
                Ok((system, weight))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Analysis {
            system,
            secondary,
            config: self,
        })
    }
}

/// Validated analysis request
#[derive(Debug, Clone)]
pub struct Analysis {
    system: OpticalSystem,
    secondary: Vec<(OpticalSystem, f64)>,
    config: ANALYSIS,
}
impl Analysis {
    /// Optical system at the primary wavelength
    pub fn system(&self) -> &OpticalSystem {
        &self.system
    }
    pub fn config(&self) -> &ANALYSIS {
        &self.config
    }
    /// Traces `ray` from the object to the image surface
    pub fn trace(&self, ray: Ray) -> TraceResult {
        Tracer::new(&self.system).trace(ray)
    }
    pub fn chief_ray(&self) -> Result<ChiefRay> {
        Aimer::new(&self.system, self.config.field)?.chief()
    }
    /// Ray through the stop at the pupil fraction `rho` toward `edge`
    pub fn marginal_ray(&self, rho: f64, edge: Edge) -> Result<MarginalRay> {
        let aimer = Aimer::new(&self.system, self.config.field)?;
        let chief = aimer.chief()?;
        aimer.marginal(&chief, rho, edge.direction())
    }
    pub fn edge_rays(&self, rho: f64) -> Result<EdgeRays> {
        Aimer::new(&self.system, self.config.field)?.edge_rays(rho)
    }
    /// Wavefront over the pupil at the primary wavelength, without Zernike fit
    pub fn pupil_map(&self) -> Result<PupilMap> {
        build_pupil_map(
            &self.system,
            self.config.field,
            &self.config.pupil,
            &self.config.monitor,
            self.config.parallel,
        )
    }
    /// Pupil diameter and focal length setting the PSF sampling
    pub fn geometry(&self) -> Result<PsfGeometry> {
        let paraxial = Paraxial::new(&self.system);
        if self.system.is_infinite_object() {
            Ok(PsfGeometry::new(
                paraxial.entrance_pupil_diameter()?,
                paraxial.efl()?.abs(),
            ))
        } else {
            Ok(PsfGeometry::from_f_number(paraxial.working_f_number()?))
        }
    }
    /// Runs the full request: pupil map, Zernike fit, PSF, MTF and Strehl ratios
    pub fn run(&self) -> Result<WavefrontReport> {
        let config = &self.config;
        let monitor = &config.monitor;
        let geometry = self.geometry()?;
        let mut pupil = self.pupil_map()?;
        let wavelength = pupil.wavelength;

        monitor.check("analysis")?;
        monitor.report(Phase::Fit, 0., format!("fitting {} Zernike modes", config.zernike_modes));
        if config.zernike_modes > 0 {
            match ZernikeFit::fit(
                &pupil.z_opd,
                &pupil.mask,
                &pupil.x,
                &pupil.y,
                wavelength,
                config.zernike_modes,
            ) {
                Ok(fit) => pupil.zernike = Some(fit),
                Err(e) if !config.fit_then_evaluate => log::warn!("analysis: {}", e),
                Err(e) => return Err(e),
            }
        }
        monitor.report(Phase::Fit, 1., "Zernike fit done");

        let opd = match (&pupil.zernike, config.fit_then_evaluate) {
            (Some(fit), true) => {
                ZernikeFit::reconstruct(&fit.for_psf(), &pupil.mask, &pupil.x, &pupil.y, wavelength)
            }
            _ => pupil.z_opd.clone(),
        };
        let rms = pupil.rms();
        let strehl = marechal(rms, wavelength);
        let mut psf = compute_psf(
            &opd,
            &pupil.amp,
            &pupil.mask,
            wavelength,
            geometry,
            &config.psf,
            monitor,
        )?;
        if pupil.valid_count() > 0 {
            psf.strehl = strehl;
        }
        let mtf = compute_mtf(&psf, monitor)?;
        let polychromatic_strehl = self.polychromatic_strehl(strehl)?;
        monitor.report(Phase::Post, 1., "done");

        let report = WavefrontReport {
            rms_waves: rms / wavelength,
            peak_to_valley_waves: pupil.peak_to_valley() / wavelength,
            strehl: psf.strehl,
            polychromatic_strehl,
            geometry,
            pupil,
            psf,
            mtf,
        };
        log::info!("{}", report);
        Ok(report)
    }
    /// Weighted mean of the Maréchal Strehl ratios of the weighted wavelengths
    fn polychromatic_strehl(&self, primary: f64) -> Result<Option<f64>> {
        if self.secondary.is_empty() {
            return Ok(None);
        }
        let config = &self.config;
        let monitor = config.monitor.silent();
        let n = self.secondary.len();
        let mut sum = 0f64;
        let mut weights = 0f64;
        for (k, (system, weight)) in self.secondary.iter().enumerate() {
            config.monitor.check("analysis")?;
            let strehl = if system.wavelength() == self.system.wavelength() {
                primary
            } else {
                let map = build_pupil_map(system, config.field, &config.pupil, &monitor, config.parallel)?;
                marechal(map.rms(), map.wavelength)
            };
            log::info!(
                "analysis: Strehl {:.4} @ {:.4}µm (weight {})",
                strehl,
                system.wavelength(),
                weight
            );
            sum += weight * strehl;
            weights += weight;
            config.monitor.report(
                Phase::Post,
                0.5 + 0.5 * (k + 1) as f64 / n as f64,
                format!("wavelength {}/{}", k + 1, n),
            );
        }
        Ok(Some(sum / weights))
    }
}

/// Outputs of an analysis request
#[derive(Debug, Clone)]
pub struct WavefrontReport {
    /// Wavefront at the primary wavelength, with its Zernike fit
    pub pupil: PupilMap,
    pub psf: PsfResult,
    pub mtf: MtfResult,
    /// RMS wavefront error, piston and tilt removed [waves]
    pub rms_waves: f64,
    pub peak_to_valley_waves: f64,
    /// Maréchal Strehl ratio at the primary wavelength
    pub strehl: f64,
    pub polychromatic_strehl: Option<f64>,
    pub geometry: PsfGeometry,
}
impl WavefrontReport {
    pub fn zernike(&self) -> Option<&ZernikeFit> {
        self.pupil.zernike.as_ref()
    }
}
impl fmt::Display for WavefrontReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.pupil)?;
        writeln!(
            f,
            "D={:.4}mm f={:.4}mm F/{:.3}",
            self.geometry.pupil_diameter,
            self.geometry.focal_length,
            self.geometry.f_number()
        )?;
        writeln!(
            f,
            "RMS {:.4}λ PV {:.4}λ Strehl {:.4}",
            self.rms_waves, self.peak_to_valley_waves, self.strehl
        )?;
        if let Some(s) = self.polychromatic_strehl {
            writeln!(f, "polychromatic Strehl {:.4}", s)?;
        }
        // half of the incoherent cutoff 1/(λF)
        let freq = 0.5 / (self.psf.wavelength.um_to_mm() * self.geometry.f_number());
        if let Some((t, s)) = self.mtf.at(freq) {
            writeln!(f, "MTF @ {:.2} cycles/mm: T {:.4} S {:.4}", freq, t, s)?;
        }
        write!(f, "{}", self.psf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{glass::GlassCatalog, surface::Surface};

    fn singlet() -> Vec<Surface> {
        vec![
            Surface::object(f64::INFINITY),
            Surface::standard(51.68, 5.)
                .set_material("N-BK7")
                .set_semi_diameter(2.5),
            Surface::standard(f64::INFINITY, 95.).set_semi_diameter(12.5),
            Surface::image(),
        ]
    }

    #[test]
    fn builder() {
        let a = ANALYSIS::default()
            .set_wavelength(0.55)
            .set_padding(3)
            .set_ee_radii(vec![1., 2.])
            .set_parallel(true);
        assert_eq!(a.wavelength.primary, 0.55);
        assert_eq!(a.psf.padding, 3);
        assert_eq!(a.psf.ee_radii, vec![1., 2.]);
        assert_eq!(a.zernike_modes, DEFAULT_MODES);
        assert!(a.parallel);
    }

    #[test]
    fn invalid_requests() {
        let catalog = GlassCatalog::builtin();
        let e = ANALYSIS::default()
            .set_wavelength(-1.)
            .build(singlet(), &catalog)
            .unwrap_err();
        assert_eq!(e.kind, crate::error::ErrorKind::InvalidInput);
        let e = ANALYSIS::default()
            .set_zernike_modes(0)
            .set_fit_then_evaluate(true)
            .build(singlet(), &catalog)
            .unwrap_err();
        assert_eq!(e.kind, crate::error::ErrorKind::InvalidInput);
        let e = ANALYSIS::default()
            .set_wavelengths(WavelengthSpec::new(0.55).with_weighted(vec![(0.5, 0.)]))
            .build(singlet(), &catalog)
            .unwrap_err();
        assert_eq!(e.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn singlet_report() {
        let analysis = ANALYSIS::default()
            .set_wavelengths(
                WavelengthSpec::new(0.5876).with_weighted(vec![(0.5876, 1.), (0.4861, 1.)]),
            )
            .set_pupil(PupilSpec::grid(32))
            .set_image_placement(ImagePlacement::Paraxial)
            .set_zernike_modes(15)
            .set_ee_radii(vec![f64::INFINITY])
            .build(singlet(), &GlassCatalog::builtin())
            .unwrap();
        let report = analysis.run().unwrap();
        assert!(report.strehl > 0.98 && report.strehl <= 1.);
        assert!((report.psf.ee_values[0] - 1.).abs() < 1e-6);
        assert_eq!(report.zernike().map(|z| z.modes()), Some(15));
        let poly = report.polychromatic_strehl.unwrap();
        // the F line is out of focus
        assert!(poly < report.strehl && poly > 0.);
        assert!((report.geometry.pupil_diameter - 5.).abs() < 1e-9);
    }

    #[test]
    fn fit_then_evaluate() {
        let analysis = ANALYSIS::default()
            .set_pupil(PupilSpec::grid(32))
            .set_image_placement(ImagePlacement::Paraxial)
            .set_zernike_modes(15)
            .set_fit_then_evaluate(true)
            .build(singlet(), &GlassCatalog::builtin())
            .unwrap();
        let report = analysis.run().unwrap();
        let direct = analysis.pupil_map().unwrap();
        assert!((marechal(direct.rms(), direct.wavelength) - report.strehl).abs() < 1e-12);
    }
}
