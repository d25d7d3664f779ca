//!
//! # Point spread and modulation transfer functions
//!
//! Fraunhofer model: the PSF is the squared modulus of the Fourier transform
//! of the complex pupil $U=A\,e^{i2\pi W/\lambda}$ zero-padded to $M=pN$ samples,
//! normalized to unit energy. The PSF sampling in the image plane is
//! $$\Delta x = \lambda F\frac{N}{M}.$$
//! The Strehl ratio is the Maréchal approximation
//! $S=e^{-(2\pi\sigma/\lambda)^2}$ of the piston and tilt free RMS
//! wavefront $\sigma$, and the MTF is the modulus of the Fourier transform of
//! the PSF normalized to 1 at the origin.

use crate::{
    error::{Error, Result},
    progress::{Monitor, Phase},
    pupil::{fit_plane, masked_rms, pupil_coordinates},
    units::Conversion,
};
use ndarray::Array2;
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::{f64::consts::PI, fmt, sync::Arc};

/// Default pupil zero-padding factor
pub const DEFAULT_PADDING: usize = 2;

/// Maréchal Strehl ratio of the RMS wavefront `sigma` at `wavelength` (same units)
pub fn marechal(sigma: f64, wavelength: f64) -> f64 {
    (-(2. * PI * sigma / wavelength).powi(2)).exp()
}

/// First order imaging geometry setting the PSF sampling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsfGeometry {
    /// Pupil diameter [mm]
    pub pupil_diameter: f64,
    /// Effective focal length [mm]
    pub focal_length: f64,
}
impl PsfGeometry {
    pub fn new(pupil_diameter: f64, focal_length: f64) -> Self {
        Self {
            pupil_diameter,
            focal_length,
        }
    }
    /// Geometry with the given working F-number
    pub fn from_f_number(f_number: f64) -> Self {
        Self::new(1., f_number)
    }
    pub fn f_number(&self) -> f64 {
        self.focal_length / self.pupil_diameter
    }
}

/// PSF computation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PsfSettings {
    /// Zero-padding factor
    #[serde(default = "default_padding")]
    pub padding: usize,
    /// Encircled energy radii [µm]
    #[serde(default)]
    pub ee_radii: Vec<f64>,
}
fn default_padding() -> usize {
    DEFAULT_PADDING
}
impl Default for PsfSettings {
    fn default() -> Self {
        Self {
            padding: DEFAULT_PADDING,
            ee_radii: vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PsfResult {
    /// Normalized intensity, peak centered at `[M/2, M/2]`
    pub psf: Array2<f64>,
    pub strehl: f64,
    /// Full widths at half maximum [µm]
    pub fwhm_x: f64,
    pub fwhm_y: f64,
    /// Encircled energy radii [µm]
    pub ee_radii: Vec<f64>,
    pub ee_values: Vec<f64>,
    /// Sampling [µm]
    pub dx: f64,
    /// Wavelength [µm]
    pub wavelength: f64,
}
impl PsfResult {
    pub fn size(&self) -> usize {
        self.psf.nrows()
    }
    /// Fraction of the energy within `radius` [µm] of the PSF center
    pub fn encircled_energy(&self, radius: f64) -> f64 {
        encircled_energy(&self.psf, self.dx, &[radius])[0]
    }
}
impl fmt::Display for PsfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PSF {0}×{0} @ {1:.4}µm, Δx={2:.4}µm: Strehl {3:.4}, FWHM {4:.3}×{5:.3}µm",
            self.size(),
            self.wavelength,
            self.dx,
            self.strehl,
            self.fwhm_x,
            self.fwhm_y
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MtfResult {
    pub freq_cycles_per_mm: Vec<f64>,
    /// MTF along y
    pub mtf_tangential: Vec<f64>,
    /// MTF along x
    pub mtf_sagittal: Vec<f64>,
}
impl MtfResult {
    /// Tangential and sagittal MTF at `freq` [cycles/mm], linearly interpolated
    pub fn at(&self, freq: f64) -> Option<(f64, f64)> {
        let f = &self.freq_cycles_per_mm;
        let k = f.iter().position(|x| *x >= freq)?;
        if k == 0 {
            return Some((self.mtf_tangential[0], self.mtf_sagittal[0]));
        }
        let w = (freq - f[k - 1]) / (f[k] - f[k - 1]);
        let lerp = |v: &[f64]| v[k - 1] + w * (v[k] - v[k - 1]);
        Some((lerp(&self.mtf_tangential), lerp(&self.mtf_sagittal)))
    }
}

/// In place 2D FFT of the row major `m×m` buffer
fn fft2(buffer: &mut [Complex64], m: usize, fft: &Arc<dyn Fft<f64>>) {
    fft.process(buffer);
    transpose(buffer, m);
    fft.process(buffer);
    transpose(buffer, m);
}
fn transpose(buffer: &mut [Complex64], m: usize) {
    for i in 0..m {
        for j in i + 1..m {
            buffer.swap(i * m + j, j * m + i);
        }
    }
}

/// Moves the zero frequency sample from `[0,0]` to `[M/2,M/2]`
pub fn fft_shift(data: &Array2<f64>) -> Array2<f64> {
    let (m, n) = data.dim();
    Array2::from_shape_fn((m, n), |(i, j)| data[[(i + m - m / 2) % m, (j + n - n / 2) % n]])
}

/// PSF of the pupil wavefront `opd` [µm] with amplitude `amp` over `mask`
///
/// The Strehl ratio is computed from the piston and tilt free RMS of `opd`.
pub fn compute_psf(
    opd: &Array2<f64>,
    amp: &Array2<f64>,
    mask: &Array2<bool>,
    wavelength: f64,
    geometry: PsfGeometry,
    settings: &PsfSettings,
    monitor: &Monitor,
) -> Result<PsfResult> {
    let (n, n_) = opd.dim();
    if n != n_ || amp.dim() != (n, n) || mask.dim() != (n, n) {
        return Err(Error::invalid_input(
            "psf",
            format!("pupil arrays must be square and of the same size, found {:?}", opd.dim()),
        ));
    }
    if n < 4 {
        return Err(Error::invalid_input("psf", format!("grid size must be at least 4, found {}", n)));
    }
    if !(wavelength > 0.) {
        return Err(Error::invalid_input(
            "psf",
            format!("wavelength must be positive, found {}", wavelength),
        ));
    }
    if settings.padding == 0 {
        return Err(Error::invalid_input("psf", "padding factor must be at least 1"));
    }
    let f_number = geometry.f_number();
    if !(f_number.is_finite() && f_number > 0.) {
        return Err(Error::invalid_input(
            "psf",
            format!("invalid F-number {}", f_number),
        ));
    }
    let m = n * settings.padding;
    let dx = wavelength * f_number * n as f64 / m as f64;
    let energy_mask: Vec<bool> = mask
        .iter()
        .zip(amp.iter())
        .zip(opd.iter())
        .map(|((m, a), w)| *m && *a > 0. && w.is_finite())
        .collect();
    if !energy_mask.iter().any(|x| *x) {
        log::warn!("psf: empty pupil");
        return Ok(PsfResult {
            psf: Array2::zeros((m, m)),
            strehl: 0.,
            fwhm_x: 0.,
            fwhm_y: 0.,
            ee_values: vec![0.; settings.ee_radii.len()],
            ee_radii: settings.ee_radii.clone(),
            dx,
            wavelength,
        });
    }

    // Maréchal Strehl from the piston and tilt free wavefront
    let coords = pupil_coordinates(n);
    let [a, b, c] = fit_plane(opd, mask, &coords, &coords);
    let detrended = Array2::from_shape_fn((n, n), |(i, j)| opd[[i, j]] - a * coords[j] - b * coords[i] - c);
    let sigma = masked_rms(&detrended, mask);
    let strehl = marechal(sigma, wavelength);

    monitor.check("psf")?;
    monitor.report(Phase::Fft, 0., format!("{0}×{0} FFT", m));
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(m);
    let mut buffer = vec![Complex64::new(0., 0.); m * m];
    for ((i, j), w) in opd.indexed_iter() {
        if energy_mask[i * n + j] {
            let phase = 2. * PI * w / wavelength;
            buffer[i * m + j] = Complex64::from_polar(amp[[i, j]], phase);
        }
    }
    fft2(&mut buffer, m, &fft);
    let total: f64 = buffer.iter().map(|v| v.norm_sqr()).sum();
    let intensity = Array2::from_shape_fn((m, m), |(i, j)| buffer[i * m + j].norm_sqr() / total);
    let psf = fft_shift(&intensity);
    monitor.report(Phase::Fft, 1., "PSF done");

    monitor.check("psf")?;
    let (fwhm_x, fwhm_y) = fwhm(&psf, dx);
    let ee_values = encircled_energy(&psf, dx, &settings.ee_radii);
    let result = PsfResult {
        psf,
        strehl,
        fwhm_x,
        fwhm_y,
        ee_radii: settings.ee_radii.clone(),
        ee_values,
        dx,
        wavelength,
    };
    log::info!("{}", result);
    Ok(result)
}

/// Encircled energy within `radii` [µm] of the center `[M/2,M/2]` of the PSF sampled at `dx` [µm]
pub fn encircled_energy(psf: &Array2<f64>, dx: f64, radii: &[f64]) -> Vec<f64> {
    let (m, n) = psf.dim();
    let (ci, cj) = ((m / 2) as f64, (n / 2) as f64);
    radii
        .iter()
        .map(|r| {
            psf.indexed_iter()
                .filter(|((i, j), _)| {
                    let d = ((*i as f64 - ci).powi(2) + (*j as f64 - cj).powi(2)).sqrt() * dx;
                    d <= *r
                })
                .map(|(_, v)| *v)
                .sum()
        })
        .collect()
}

/// Width at half maximum of `profile` around its sample `peak`, in samples
fn half_width(profile: &[f64], peak: usize) -> Option<f64> {
    let half = 0.5 * profile[peak];
    let right = (peak + 1..profile.len()).find(|&k| profile[k] < half).map(|k| {
        let (a, b) = (profile[k - 1], profile[k]);
        (k - 1) as f64 + (a - half) / (a - b)
    })?;
    let left = (0..peak).rev().find(|&k| profile[k] < half).map(|k| {
        let (a, b) = (profile[k + 1], profile[k]);
        (k + 1) as f64 - (a - half) / (a - b)
    })?;
    Some(right - left)
}

/// FWHM along x and y through the PSF peak [µm], NaN if the profile does not drop below half maximum
pub fn fwhm(psf: &Array2<f64>, dx: f64) -> (f64, f64) {
    let (peak, _) = psf
        .indexed_iter()
        .fold(((0, 0), f64::NEG_INFINITY), |acc, (ij, v)| if *v > acc.1 { (ij, *v) } else { acc });
    let row: Vec<f64> = psf.row(peak.0).to_vec();
    let col: Vec<f64> = psf.column(peak.1).to_vec();
    let wx = half_width(&row, peak.1).map_or(f64::NAN, |w| w * dx);
    let wy = half_width(&col, peak.0).map_or(f64::NAN, |w| w * dx);
    (wx, wy)
}

/// MTF of the PSF sampled at `dx` [µm], up to the Nyquist frequency
pub fn compute_mtf(psf: &PsfResult, monitor: &Monitor) -> Result<MtfResult> {
    monitor.check("mtf")?;
    let m = psf.size();
    let mut buffer: Vec<Complex64> = psf.psf.iter().map(|v| Complex64::new(*v, 0.)).collect();
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(m);
    fft2(&mut buffer, m, &fft);
    let dc = buffer[0].norm();
    if dc <= 0. {
        return Ok(MtfResult {
            freq_cycles_per_mm: vec![],
            mtf_tangential: vec![],
            mtf_sagittal: vec![],
        });
    }
    let dx_mm = psf.dx.um_to_mm();
    let half = m / 2;
    let freq_cycles_per_mm = (0..=half).map(|k| k as f64 / (m as f64 * dx_mm)).collect();
    let mtf_sagittal = (0..=half).map(|k| buffer[k].norm() / dc).collect();
    let mtf_tangential = (0..=half).map(|k| buffer[k * m].norm() / dc).collect();
    monitor.report(Phase::Post, 0.5, "MTF done");
    Ok(MtfResult {
        freq_cycles_per_mm,
        mtf_tangential,
        mtf_sagittal,
    })
}
