//!
//! # Optical path difference
//!
//! The wavefront of a field is sampled over the stop with rays aimed at the
//! normalized pupil coordinates $(\xi,\eta)$, $\xi^2+\eta^2\le 1$.
//! The optical path of each ray is compared with the chief ray on a reference
//! sphere centered on the chief ray image point $I_c$ and going through the
//! exit pupil center $E$, approximated by the projection of the stop center
//! onto the image space chief ray.
//! With $\vec w = I_m-I_c$, $b=\vec w\cdot\vec u_m$ and $R=\|I_c-E\|$, the
//! distance from the sphere to the ray image point is $s$ with
//! $$s-R = b + \frac{b^2-\|\vec w\|^2}{\sqrt{b^2-\|\vec w\|^2+R^2}+R}$$
//! and the OPD is $(L_m-L_c) - n^\prime(s-R)$.

use crate::{
    aim::{Aimer, ChiefRay},
    error::{Error, Result},
    field::Field,
    progress::{Monitor, Phase},
    ray::RayStatus,
    surface::Vector,
    system::OpticalSystem,
    trace::Tracer,
    units::Conversion,
    zernike::ZernikeFit,
};
use nalgebra as na;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

/// OPD beyond which a sample is considered a numerical failure [µm]
pub const OPD_SANITY_BOUND: f64 = 1e5;
/// Chief node OPD that triggers the self-consistency pass [µm]
pub const CHIEF_OPD_TOLERANCE: f64 = 1e-3;
/// Largest fraction of pupil samples allowed to fail to converge
pub const MAX_FAILURE_RATIO: f64 = 0.1;

/// Pupil sampling pattern
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PupilPattern {
    /// Square grid masked by the unit circle
    Grid,
    /// Rings and arms of marginal rays interpolated on the grid
    Annular { rings: usize, arms: usize },
}
impl Default for PupilPattern {
    fn default() -> Self {
        PupilPattern::Grid
    }
}

/// Pupil sampling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PupilSpec {
    /// Grid size N
    pub size: usize,
    #[serde(default)]
    pub pattern: PupilPattern,
}
impl Default for PupilSpec {
    fn default() -> Self {
        Self {
            size: 64,
            pattern: PupilPattern::Grid,
        }
    }
}
impl PupilSpec {
    pub fn grid(size: usize) -> Self {
        Self {
            size,
            pattern: PupilPattern::Grid,
        }
    }
    pub fn annular(size: usize, rings: usize, arms: usize) -> Self {
        Self {
            size,
            pattern: PupilPattern::Annular { rings, arms },
        }
    }
    fn validate(&self) -> Result<()> {
        if self.size < 4 {
            return Err(Error::invalid_input(
                "pupil",
                format!("grid size must be at least 4, found {}", self.size),
            ));
        }
        if self.size % 2 == 1 {
            return Err(Error::invalid_input(
                "pupil",
                format!("grid size must be even to have a node at the pupil center, found {}", self.size),
            ));
        }
        if let PupilPattern::Annular { rings, arms } = self.pattern {
            if rings == 0 || arms < 3 {
                return Err(Error::invalid_input(
                    "pupil",
                    format!("annular pattern needs rings ≥ 1 and arms ≥ 3, found {}×{}", rings, arms),
                ));
            }
        }
        Ok(())
    }
}

/// Normalized pupil coordinates $x_k=(2k-N)/N$
///
/// For an even N the node $k=N/2$ is the pupil center.
pub fn pupil_coordinates(n: usize) -> Vec<f64> {
    (0..n)
        .map(|k| (2. * k as f64 - n as f64) / n as f64)
        .collect()
}

/// Sampled wavefront over the pupil
///
/// Rows are indexed by $\eta$ (`y`), columns by $\xi$ (`x`); samples outside
/// the pupil or vignetted are NaN with `mask` false.
#[derive(Debug, Clone)]
pub struct PupilMap {
    pub size: usize,
    /// Wavelength [µm]
    pub wavelength: f64,
    /// OPD on the reference sphere [µm]
    pub raw: Array2<f64>,
    /// OPD with piston removed [µm]
    pub z_opd: Array2<f64>,
    pub amp: Array2<f64>,
    pub mask: Array2<bool>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Plane $a\xi+b\eta+c$ fitted to the raw OPD [µm]
    pub tilt: [f64; 3],
    /// Reference sphere radius [mm]
    pub reference_radius: f64,
    pub chief: ChiefRay,
    /// Samples that failed to converge
    pub failures: usize,
    pub zernike: Option<ZernikeFit>,
}
impl PupilMap {
    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }
    /// OPD with piston and tilt removed [µm]
    pub fn tilt_removed(&self) -> Array2<f64> {
        let [a, b, _] = self.tilt;
        let mut out = self.z_opd.clone();
        for ((i, j), v) in out.indexed_iter_mut() {
            if self.mask[[i, j]] {
                *v -= a * self.x[j] + b * self.y[i];
            }
        }
        out
    }
    /// RMS of the OPD with piston and tilt removed [µm]
    pub fn rms(&self) -> f64 {
        masked_rms(&self.tilt_removed(), &self.mask)
    }
    /// RMS of the OPD with piston and tilt removed [waves]
    pub fn rms_waves(&self) -> f64 {
        self.rms() / self.wavelength
    }
    /// Peak to valley of the OPD with piston and tilt removed [µm]
    pub fn peak_to_valley(&self) -> f64 {
        let w = self.tilt_removed();
        let (lo, hi) = w
            .iter()
            .zip(self.mask.iter())
            .filter(|(_, m)| **m)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (v, _)| {
                (lo.min(*v), hi.max(*v))
            });
        if hi >= lo {
            hi - lo
        } else {
            0.
        }
    }
    /// Chief ray image point [mm]
    pub fn chief_image(&self) -> Vector {
        self.chief.trace.ray.p
    }
}
impl fmt::Display for PupilMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}×{} pupil @ {:.4}µm: {} samples, RMS {:.4}λ, PV {:.4}λ, tilt [{:+.4e},{:+.4e}]µm",
            self.size,
            self.size,
            self.wavelength,
            self.valid_count(),
            self.rms_waves(),
            self.peak_to_valley() / self.wavelength,
            self.tilt[0],
            self.tilt[1]
        )
    }
}

/// Root mean square of the masked samples about their mean
pub fn masked_rms(w: &Array2<f64>, mask: &Array2<bool>) -> f64 {
    let values: Vec<f64> = w
        .iter()
        .zip(mask.iter())
        .filter(|(v, m)| **m && v.is_finite())
        .map(|(v, _)| *v)
        .collect();
    if values.is_empty() {
        return 0.;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Least squares plane $a\xi+b\eta+c$ through the masked samples
pub fn fit_plane(w: &Array2<f64>, mask: &Array2<bool>, x: &[f64], y: &[f64]) -> [f64; 3] {
    let mut ata = na::Matrix3::<f64>::zeros();
    let mut atb = na::Vector3::<f64>::zeros();
    let mut count = 0usize;
    let mut sum = 0f64;
    for ((i, j), v) in w.indexed_iter() {
        if !mask[[i, j]] || !v.is_finite() {
            continue;
        }
        let row = na::Vector3::new(x[j], y[i], 1.);
        ata += row * row.transpose();
        atb += row * *v;
        count += 1;
        sum += v;
    }
    if count == 0 {
        return [0.; 3];
    }
    let lu = ata.lu();
    if lu.determinant().abs() < 1e-12 {
        log::debug!("plane fit: singular normal equations, piston only");
        return [0., 0., sum / count as f64];
    }
    match lu.solve(&atb) {
        Some(c) => [c[0], c[1], c[2]],
        None => [0., 0., sum / count as f64],
    }
}

/// Nearest neighbour interpolation of scattered samples `(ξ, η, value)` on the N×N grid
///
/// Grid nodes outside the unit circle or whose nearest sample is not finite are masked.
pub fn interpolate_nearest(samples: &[(f64, f64, f64)], n: usize) -> (Array2<f64>, Array2<bool>) {
    let coords = pupil_coordinates(n);
    let mut values = Array2::from_elem((n, n), f64::NAN);
    let mut mask = Array2::from_elem((n, n), false);
    if samples.is_empty() {
        return (values, mask);
    }
    for i in 0..n {
        for j in 0..n {
            let (xi, eta) = (coords[j], coords[i]);
            if xi * xi + eta * eta > 1. {
                continue;
            }
            let nearest = samples.iter().fold((f64::INFINITY, f64::NAN), |acc, s| {
                let d = (s.0 - xi).powi(2) + (s.1 - eta).powi(2);
                if d < acc.0 {
                    (d, s.2)
                } else {
                    acc
                }
            });
            if nearest.1.is_finite() {
                values[[i, j]] = nearest.1;
                mask[[i, j]] = true;
            }
        }
    }
    (values, mask)
}

/// Sphere centered on the chief ray image point
#[derive(Debug, Clone, Copy)]
pub struct ReferenceSphere {
    pub center: Vector,
    /// Signed radius [mm], positive when the exit pupil is in front of the image
    pub radius: f64,
    /// Chief ray optical path length at the image [mm]
    pub opl: f64,
    /// Image space refractive index
    pub index: f64,
}
impl ReferenceSphere {
    pub fn new(system: &OpticalSystem, chief: &ChiefRay, stop: usize) -> Self {
        let ray = chief.trace.ray;
        let stop_center = system.frame(stop).origin;
        // exit pupil center on the image space chief ray
        let radius = -(stop_center - ray.p).dot(&ray.u);
        Self {
            center: ray.p,
            radius,
            opl: ray.opl,
            index: system.image_index().abs(),
        }
    }
    /// OPD [µm] of the ray reaching the image at `point` along `u` with the optical path `opl`
    pub fn opd(&self, point: &Vector, u: &Vector, opl: f64) -> Option<f64> {
        let w = point - self.center;
        let b = w.dot(u);
        let w2 = w.norm_squared();
        let r = self.radius;
        let ds = if r.abs() < 1e-12 {
            b
        } else {
            let q = b * b - w2 + r * r;
            if q < 0. {
                return None;
            }
            if r > 0. {
                b + (b * b - w2) / (q.sqrt() + r)
            } else {
                b - (b * b - w2) / (q.sqrt() - r)
            }
        };
        let opd = (opl - self.opl - self.index * ds).mm_to_um();
        if opd.is_finite() && opd.abs() <= OPD_SANITY_BOUND {
            Some(opd)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Sample {
    Outside,
    Valid(f64),
    Vignetted,
    Failed,
}

/// Wavefront sampler of one field
pub struct OpdBuilder<'a> {
    system: &'a OpticalSystem,
    aimer: Aimer<'a>,
    chief: ChiefRay,
    sphere: ReferenceSphere,
    linear: bool,
}
impl<'a> OpdBuilder<'a> {
    /// Solves the chief ray of `field` and sets up the reference sphere
    pub fn new(system: &'a OpticalSystem, field: Field, monitor: &Monitor) -> Result<Self> {
        monitor.check("pupil")?;
        monitor.report(Phase::Chief, 0., "solving chief ray");
        let aimer = Aimer::new(system, field)?;
        let chief = aimer.chief()?;
        let sphere = ReferenceSphere::new(system, &chief, aimer.stop());
        let linear = aimer.launch().is_plane_wave()
            && !system.surfaces().iter().any(|s| s.has_pose());
        log::info!(
            "{}: chief ray at image [{:+.6},{:+.6},{:+.6}]mm, reference sphere R={:.4}mm",
            field,
            sphere.center.x,
            sphere.center.y,
            sphere.center.z,
            sphere.radius
        );
        monitor.report(Phase::Chief, 1., "chief ray solved");
        Ok(Self {
            system,
            aimer,
            chief,
            sphere,
            linear,
        })
    }
    pub fn chief(&self) -> &ChiefRay {
        &self.chief
    }
    pub fn reference_sphere(&self) -> &ReferenceSphere {
        &self.sphere
    }
    /// Launch parameters of the ray through the normalized stop point `(ξ, η)`
    fn aim(&self, xi: f64, eta: f64) -> Option<[f64; 2]> {
        let r = self.aimer.stop_radius();
        let target = [xi * r, eta * r];
        let guess = self.aimer.linear_guess(&self.chief, target)?;
        if self.linear || (xi == 0. && eta == 0.) {
            return Some(if xi == 0. && eta == 0. {
                self.chief.params
            } else {
                guess
            });
        }
        let tolerance = 1e-8 * r.max(1.);
        match self.aimer.solve(target, guess, tolerance) {
            Ok((p, ..)) => Some(p),
            Err(e) => {
                log::debug!("pupil ({:+.3},{:+.3}): {}, retrying", xi, eta, e);
                let pc = self.chief.params;
                let retry = [
                    pc[0] + 0.5 * (guess[0] - pc[0]),
                    pc[1] + 0.5 * (guess[1] - pc[1]),
                ];
                self.aimer.solve(target, retry, tolerance).ok().map(|(p, ..)| p)
            }
        }
    }
    /// OPD [µm] of the ray with launch `params`
    fn sample(&self, params: Option<[f64; 2]>) -> Sample {
        let params = match params {
            Some(p) => p,
            None => return Sample::Failed,
        };
        let trace = Tracer::new(self.system).trace(self.aimer.ray(params));
        match trace.status {
            RayStatus::AtImage => match self.sphere.opd(&trace.ray.p, &trace.ray.u, trace.ray.opl) {
                Some(opd) => Sample::Valid(opd),
                None => Sample::Vignetted,
            },
            RayStatus::Vignetted { .. } => Sample::Vignetted,
        }
    }
    fn row(&self, i: usize, coords: &[f64], monitor: &Monitor, done: &AtomicUsize) -> Result<Vec<Sample>> {
        monitor.check("pupil")?;
        let eta = coords[i];
        let samples = coords
            .iter()
            .map(|&xi| {
                if xi * xi + eta * eta > 1. {
                    Sample::Outside
                } else {
                    self.sample(self.aim(xi, eta))
                }
            })
            .collect();
        let n = coords.len();
        let k = done.fetch_add(1, Ordering::SeqCst) + 1;
        monitor.report(Phase::Pupil, k as f64 / n as f64, format!("row {}/{}", k, n));
        Ok(samples)
    }
    /// Samples the wavefront on the pupil grid
    pub fn build(&self, spec: &PupilSpec, monitor: &Monitor, parallel: bool) -> Result<PupilMap> {
        spec.validate()?;
        let n = spec.size;
        let coords = pupil_coordinates(n);
        let (raw, mask, inside, failures) = match spec.pattern {
            PupilPattern::Grid => tally(&self.grid_samples(&coords, monitor, parallel)?),
            PupilPattern::Annular { rings, arms } => self.annular(n, rings, arms, monitor)?,
        };
        monitor.check("pupil")?;
        self.assemble(coords, raw, mask, inside, failures)
    }
    /// Samples of every grid node, row by row
    fn grid_samples(&self, coords: &[f64], monitor: &Monitor, parallel: bool) -> Result<Vec<Vec<Sample>>> {
        let n = coords.len();
        let done = AtomicUsize::new(0);
        if parallel {
            (0..n)
                .into_par_iter()
                .map(|i| self.row(i, coords, monitor, &done))
                .collect()
        } else {
            (0..n)
                .map(|i| self.row(i, coords, monitor, &done))
                .collect()
        }
    }
    /// Applies the failure policy, re-references the chief node and removes piston
    fn assemble(
        &self,
        coords: Vec<f64>,
        mut raw: Array2<f64>,
        mask: Array2<bool>,
        inside: usize,
        failures: usize,
    ) -> Result<PupilMap> {
        let n = coords.len();
        if failures as f64 > MAX_FAILURE_RATIO * inside as f64 {
            return Err(Error::non_convergence(
                "pupil",
                format!("{} of {} pupil samples did not converge", failures, inside),
            ));
        }
        if failures > 0 {
            log::warn!("pupil: {} of {} samples did not converge", failures, inside);
        }

        // self-consistency: the chief node must have no OPD
        let c = n / 2;
        if mask[[c, c]] && raw[[c, c]].abs() >= CHIEF_OPD_TOLERANCE {
            let offset = raw[[c, c]];
            log::warn!(
                "pupil: chief node OPD {:.3e}µm, re-referencing to the traced center ray",
                offset
            );
            raw.zip_mut_with(&mask, |v, m| {
                if *m {
                    *v -= offset
                }
            });
        }

        let tilt = fit_plane(&raw, &mask, &coords, &coords);
        let mut z_opd = raw.clone();
        z_opd.zip_mut_with(&mask, |v, m| {
            if *m {
                *v -= tilt[2]
            }
        });
        let amp = mask.mapv(|m| if m { 1. } else { 0. });
        let map = PupilMap {
            size: n,
            wavelength: self.system.wavelength(),
            raw,
            z_opd,
            amp,
            mask,
            x: coords.clone(),
            y: coords,
            tilt,
            reference_radius: self.sphere.radius,
            chief: self.chief.clone(),
            failures,
            zernike: None,
        };
        log::info!("{}", map);
        Ok(map)
    }
    /// Rings × arms of marginal rays plus the chief ray, interpolated on the grid
    fn annular(
        &self,
        n: usize,
        rings: usize,
        arms: usize,
        monitor: &Monitor,
    ) -> Result<(Array2<f64>, Array2<bool>, usize, usize)> {
        let mut samples = vec![(0., 0., self.sample(Some(self.chief.params)))];
        for ring in 1..=rings {
            monitor.check("pupil")?;
            let rho = ring as f64 / rings as f64;
            for arm in 0..arms {
                let theta = 2. * std::f64::consts::PI * arm as f64 / arms as f64;
                let (s, c) = theta.sin_cos();
                let sample = match self.aimer.marginal(&self.chief, rho, [c, s]) {
                    Ok(marginal) => self.sample(Some(marginal.params)),
                    Err(e) => {
                        log::debug!("pupil ring {} arm {}: {}", ring, arm, e);
                        Sample::Failed
                    }
                };
                samples.push((rho * c, rho * s, sample));
            }
            monitor.report(
                Phase::Pupil,
                ring as f64 / rings as f64,
                format!("ring {}/{}", ring, rings),
            );
        }
        let failures = samples.iter().filter(|s| s.2 == Sample::Failed).count();
        let inside = samples.len();
        let scattered: Vec<(f64, f64, f64)> = samples
            .into_iter()
            .map(|(x, y, s)| match s {
                Sample::Valid(opd) => (x, y, opd),
                _ => (x, y, f64::NAN),
            })
            .collect();
        let (raw, mask) = interpolate_nearest(&scattered, n);
        Ok((raw, mask, inside, failures))
    }
}

/// Grid OPD and mask from the node samples, with the in-pupil and failed counts
fn tally(rows: &[Vec<Sample>]) -> (Array2<f64>, Array2<bool>, usize, usize) {
    let n = rows.len();
    let mut raw = Array2::from_elem((n, n), f64::NAN);
    let mut mask = Array2::from_elem((n, n), false);
    let (mut inside, mut failures) = (0usize, 0usize);
    for (i, row) in rows.iter().enumerate() {
        for (j, sample) in row.iter().enumerate() {
            match sample {
                Sample::Outside => continue,
                Sample::Valid(opd) => {
                    raw[[i, j]] = *opd;
                    mask[[i, j]] = true;
                }
                Sample::Vignetted => (),
                Sample::Failed => failures += 1,
            }
            inside += 1;
        }
    }
    (raw, mask, inside, failures)
}

/// Samples the wavefront of `field` over the pupil
pub fn build_pupil_map(
    system: &OpticalSystem,
    field: Field,
    spec: &PupilSpec,
    monitor: &Monitor,
    parallel: bool,
) -> Result<PupilMap> {
    spec.validate()?;
    OpdBuilder::new(system, field, monitor)?.build(spec, monitor, parallel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{glass::GlassCatalog, surface::Surface};

    fn singlet() -> OpticalSystem {
        let mut system = OpticalSystem::new(
            vec![
                Surface::object(f64::INFINITY),
                Surface::standard(51.68, 5.)
                    .set_material("N-BK7")
                    .set_semi_diameter(2.5),
                Surface::standard(f64::INFINITY, 95.).set_semi_diameter(12.5),
                Surface::image(),
            ],
            0.5876,
            &GlassCatalog::builtin(),
        )
        .unwrap();
        let t = crate::paraxial::Paraxial::new(&system).bfl().unwrap();
        system.refocus(t).unwrap();
        system
    }

    #[test]
    fn coordinates() {
        let x = pupil_coordinates(8);
        assert_eq!(x[0], -1.);
        assert_eq!(x[4], 0.);
        assert_eq!(x[7], 0.75);
    }

    #[test]
    fn plane_fit() {
        let n = 16;
        let c = pupil_coordinates(n);
        let w = Array2::from_shape_fn((n, n), |(i, j)| 0.3 * c[j] - 0.2 * c[i] + 1.5);
        let mask = Array2::from_shape_fn((n, n), |(i, j)| c[i].hypot(c[j]) <= 1.);
        let [a, b, k] = fit_plane(&w, &mask, &c, &c);
        assert!((a - 0.3).abs() < 1e-12 && (b + 0.2).abs() < 1e-12 && (k - 1.5).abs() < 1e-12);
        assert!(masked_rms(&w.mapv(|_| 2.), &mask) < 1e-12);
    }

    #[test]
    fn nearest_interpolation() {
        let samples = vec![(0., 0., 1.), (0.9, 0., 2.), (-0.9, 0., f64::NAN)];
        let (v, m) = interpolate_nearest(&samples, 8);
        assert_eq!(v[[4, 4]], 1.);
        assert_eq!(v[[4, 7]], 2.);
        assert!(!m[[4, 0]]);
        assert!(!m[[0, 0]]);
    }

    #[test]
    fn reference_sphere_of_perfect_focus() {
        let sphere = ReferenceSphere {
            center: Vector::zeros(),
            radius: 100.,
            opl: 200.,
            index: 1.,
        };
        // a ray converging to the center from the sphere has the chief path length
        let u = Vector::new(0., -0.1, 1.).normalize();
        assert!(sphere.opd(&Vector::zeros(), &u, 200.).unwrap().abs() < 1e-9);
        // a longer path shows up as positive OPD
        assert!((sphere.opd(&Vector::zeros(), &u, 200.001).unwrap() - 1.).abs() < 1e-9);
    }

    #[test]
    fn singlet_on_axis_wavefront() {
        let system = singlet();
        let map = build_pupil_map(
            &system,
            Field::default(),
            &PupilSpec::grid(32),
            &Monitor::default(),
            false,
        )
        .unwrap();
        let c = map.size / 2;
        assert!(map.raw[[c, c]].abs() < CHIEF_OPD_TOLERANCE);
        assert!(map.rms_waves() < 0.02, "{}", map);
        assert_eq!(map.failures, 0);
        // corners are outside the pupil
        assert!(!map.mask[[0, 0]] && map.z_opd[[0, 0]].is_nan());
    }

    #[test]
    fn parallel_matches_serial() {
        let system = singlet();
        let field = Field::angle(0., 1.);
        let builder = OpdBuilder::new(&system, field, &Monitor::default()).unwrap();
        let spec = PupilSpec::grid(16);
        let a = builder.build(&spec, &Monitor::default(), false).unwrap();
        let b = builder.build(&spec, &Monitor::default(), true).unwrap();
        for (x, y) in a.raw.iter().zip(b.raw.iter()) {
            assert!(x.to_bits() == y.to_bits() || (x.is_nan() && y.is_nan()));
        }
    }

    #[test]
    fn annular_pattern() {
        let system = singlet();
        let map = build_pupil_map(
            &system,
            Field::default(),
            &PupilSpec::annular(16, 3, 8),
            &Monitor::default(),
            false,
        )
        .unwrap();
        assert!(map.valid_count() > 100);
        assert!(map.rms_waves() < 0.05);
    }

    /// Marks the first `count` valid nodes, in row order, as failed
    fn fail_nodes(rows: &mut [Vec<Sample>], count: usize) {
        rows.iter_mut()
            .flat_map(|row| row.iter_mut())
            .filter(|s| matches!(s, Sample::Valid(_)))
            .take(count)
            .for_each(|s| *s = Sample::Failed);
    }

    #[test]
    fn too_many_failures() {
        let system = singlet();
        let monitor = Monitor::default();
        let builder = OpdBuilder::new(&system, Field::default(), &monitor).unwrap();
        let coords = pupil_coordinates(32);
        let mut rows = builder.grid_samples(&coords, &monitor, false).unwrap();
        let inside = tally(&rows).2;
        fail_nodes(&mut rows, inside / 10 + 1);
        let (raw, mask, inside, failures) = tally(&rows);
        assert!(failures as f64 > MAX_FAILURE_RATIO * inside as f64);
        let e = builder
            .assemble(coords, raw, mask, inside, failures)
            .unwrap_err();
        assert_eq!(e.kind, crate::error::ErrorKind::NonConvergence);
    }

    #[test]
    fn few_failures_are_masked() {
        let system = singlet();
        let monitor = Monitor::default();
        let builder = OpdBuilder::new(&system, Field::default(), &monitor).unwrap();
        let coords = pupil_coordinates(32);
        let mut rows = builder.grid_samples(&coords, &monitor, false).unwrap();
        let (_, valid, inside, _) = tally(&rows);
        let count = inside / 10;
        fail_nodes(&mut rows, count);
        let (raw, mask, inside, failures) = tally(&rows);
        assert_eq!(failures, count);
        let map = builder.assemble(coords, raw, mask, inside, failures).unwrap();
        assert_eq!(map.failures, count);
        let failed: Vec<(usize, usize)> = valid
            .indexed_iter()
            .filter(|(ij, v)| **v && !map.mask[*ij])
            .map(|(ij, _)| ij)
            .collect();
        assert_eq!(failed.len(), count);
        assert!(failed.iter().all(|ij| map.z_opd[*ij].is_nan()));
        let c = map.size / 2;
        assert!(map.mask[[c, c]] && map.raw[[c, c]].abs() < CHIEF_OPD_TOLERANCE);
        assert!(map.rms_waves().is_finite());
    }

    #[test]
    fn odd_grid_size() {
        let system = singlet();
        let e = build_pupil_map(
            &system,
            Field::default(),
            &PupilSpec::grid(33),
            &Monitor::default(),
            false,
        )
        .unwrap_err();
        assert_eq!(e.kind, crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn grid_too_small() {
        let system = singlet();
        let e = build_pupil_map(
            &system,
            Field::default(),
            &PupilSpec::grid(2),
            &Monitor::default(),
            false,
        )
        .unwrap_err();
        assert_eq!(e.kind, crate::error::ErrorKind::InvalidInput);
    }
}
