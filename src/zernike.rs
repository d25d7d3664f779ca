//!
//! # Zernike polynomials
//!
//! Noll ordered, orthonormal Zernike polynomials on the unit disk:
//! $$Z_j(\rho,\theta)=\sqrt{n+1}R_n^0(\rho)$$ for $m=0$ and
//! $$Z_j(\rho,\theta)=\sqrt{2(n+1)}R_n^m(\rho)\cos(m\theta)\;\text{or}\;\sin(m\theta)$$
//! otherwise, cosine for even $j$ and sine for odd $j$.
//! The wavefront is fitted by least squares with a small ridge regularization.

use crate::error::{Error, Result};
use nalgebra as na;
use ndarray::Array2;
use once_cell::sync::Lazy;
use std::fmt;

/// Default number of Noll modes
pub const DEFAULT_MODES: usize = 36;
const RIDGE: f64 = 1e-10;

static FACTORIALS: Lazy<Vec<f64>> = Lazy::new(|| {
    let mut f = vec![1f64; 171];
    for i in 1..f.len() {
        f[i] = f[i - 1] * i as f64;
    }
    f
});

fn factorial(n: usize) -> f64 {
    FACTORIALS.get(n).copied().unwrap_or(f64::INFINITY)
}

/// Radial order `n` and signed azimuthal frequency `m` of the Noll index `j ≥ 1`
///
/// `m > 0` stands for the cosine terms and `m < 0` for the sine terms.
pub fn noll_to_nm(j: usize) -> (usize, i32) {
    let j = j.max(1);
    let mut n = 0usize;
    while (n + 1) * (n + 2) / 2 < j {
        n += 1;
    }
    let k = j - n * (n + 1) / 2 - 1;
    let m = (n % 2 + 2 * ((k + (n + 1) % 2) / 2)) as i32;
    if m == 0 || j % 2 == 0 {
        (n, m)
    } else {
        (n, -m)
    }
}

/// Radial polynomial $R_n^m(\rho)$
pub fn radial(n: usize, m: usize, rho: f64) -> f64 {
    if m > n || (n - m) % 2 == 1 {
        return 0.;
    }
    let h = (n - m) / 2;
    let p = (n + m) / 2;
    (0..=h)
        .map(|s| {
            let c = factorial(n - s) / (factorial(s) * factorial(p - s) * factorial(h - s));
            let sign = if s % 2 == 0 { 1. } else { -1. };
            sign * c * rho.powi((n - 2 * s) as i32)
        })
        .sum()
}

/// Zernike polynomial $Z_j(\rho,\theta)$
pub fn zernike(j: usize, rho: f64, theta: f64) -> f64 {
    let (n, m) = noll_to_nm(j);
    let r = radial(n, m.unsigned_abs() as usize, rho);
    match m {
        0 => ((n + 1) as f64).sqrt() * r,
        m if m > 0 => (2. * (n + 1) as f64).sqrt() * r * (m as f64 * theta).cos(),
        m => (2. * (n + 1) as f64).sqrt() * r * ((-m) as f64 * theta).sin(),
    }
}

/// Least squares Zernike decomposition of a wavefront
#[derive(Debug, Clone, PartialEq)]
pub struct ZernikeFit {
    /// Coefficients of the Noll modes `1..=K` [waves]
    pub coeffs: Vec<f64>,
    /// RMS of the fit residual [waves]
    pub residual_rms: f64,
    /// Number of fitted samples
    pub samples: usize,
}
impl ZernikeFit {
    /// Fits the first `modes` Noll modes to the masked wavefront `w` [µm] sampled on the normalized pupil coordinates `x`, `y`
    pub fn fit(
        w: &Array2<f64>,
        mask: &Array2<bool>,
        x: &[f64],
        y: &[f64],
        wavelength: f64,
        modes: usize,
    ) -> Result<Self> {
        if modes == 0 {
            return Err(Error::invalid_input("zernike", "at least one mode required"));
        }
        if !(wavelength > 0.) {
            return Err(Error::invalid_input(
                "zernike",
                format!("wavelength must be positive, found {}", wavelength),
            ));
        }
        let points: Vec<(f64, f64, f64)> = w
            .indexed_iter()
            .filter(|((i, j), v)| mask[[*i, *j]] && v.is_finite())
            .map(|((i, j), v)| (x[j], y[i], *v / wavelength))
            .filter(|(xi, eta, _)| xi.hypot(*eta) <= 1. + 1e-12)
            .collect();
        let m = points.len();
        if m < modes {
            return Err(Error::invalid_input(
                "zernike",
                format!("{} samples cannot determine {} modes", m, modes),
            ));
        }
        let b = na::DMatrix::<f64>::from_fn(m, modes, |row, col| {
            let (xi, eta, _) = points[row];
            zernike(col + 1, xi.hypot(eta), eta.atan2(xi))
        });
        let data = na::DVector::<f64>::from_iterator(m, points.iter().map(|p| p.2));
        let mut normal = b.transpose() * &b;
        for k in 0..modes {
            normal[(k, k)] += RIDGE;
        }
        let rhs = b.transpose() * &data;
        let coeffs = match normal.clone().cholesky() {
            Some(cholesky) => cholesky.solve(&rhs),
            None => {
                log::warn!("zernike: normal equations not positive definite, using LU");
                normal.lu().solve(&rhs).ok_or_else(|| {
                    Error::internal("zernike", "singular normal equations")
                })?
            }
        };
        let residual = &data - &b * &coeffs;
        let mean = residual.mean();
        let residual_rms = (residual.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / m as f64).sqrt();
        log::info!(
            "zernike: {} modes fitted on {} samples, residual {:.3e}λ RMS",
            modes,
            m,
            residual_rms
        );
        Ok(Self {
            coeffs: coeffs.iter().copied().collect(),
            residual_rms,
            samples: m,
        })
    }
    pub fn modes(&self) -> usize {
        self.coeffs.len()
    }
    /// Coefficient of the Noll mode `j`
    pub fn get(&self, j: usize) -> Option<f64> {
        j.checked_sub(1).and_then(|i| self.coeffs.get(i).copied())
    }
    fn without(&self, modes: &[usize]) -> Vec<f64> {
        let mut c = self.coeffs.clone();
        for j in modes {
            if let Some(v) = c.get_mut(j - 1) {
                *v = 0.;
            }
        }
        c
    }
    /// Coefficients for display: piston removed
    pub fn for_rendering(&self) -> Vec<f64> {
        self.without(&[1])
    }
    /// Coefficients for Strehl and RMS: piston and tilts removed
    pub fn for_strehl(&self) -> Vec<f64> {
        self.without(&[1, 2, 3])
    }
    /// Coefficients for the PSF: piston removed, tilts retained
    pub fn for_psf(&self) -> Vec<f64> {
        self.without(&[1])
    }
    /// Wavefront [waves] at the pupil point `(ξ, η)`
    pub fn evaluate(&self, xi: f64, eta: f64) -> f64 {
        evaluate(&self.coeffs, xi, eta)
    }
    /// RMS [waves] of the piston and tilt free wavefront, from the coefficients
    pub fn rms(&self) -> f64 {
        self.for_strehl().iter().map(|c| c * c).sum::<f64>().sqrt()
    }
    /// Wavefront [µm] rebuilt from `coeffs` on the masked grid, NaN outside
    pub fn reconstruct(
        coeffs: &[f64],
        mask: &Array2<bool>,
        x: &[f64],
        y: &[f64],
        wavelength: f64,
    ) -> Array2<f64> {
        Array2::from_shape_fn(mask.dim(), |(i, j)| {
            if mask[[i, j]] {
                wavelength * evaluate(coeffs, x[j], y[i])
            } else {
                f64::NAN
            }
        })
    }
}
impl fmt::Display for ZernikeFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Zernike fit ({} samples, residual {:.3e}λ RMS):", self.samples, self.residual_rms)?;
        for (k, c) in self.coeffs.iter().enumerate() {
            let (n, m) = noll_to_nm(k + 1);
            writeln!(f, " Z{:<3} (n={},m={:+}) {:+.6}λ", k + 1, n, m, c)?;
        }
        Ok(())
    }
}

/// Wavefront [waves] of the Noll coefficients `coeffs` at `(ξ, η)`
pub fn evaluate(coeffs: &[f64], xi: f64, eta: f64) -> f64 {
    let rho = xi.hypot(eta);
    let theta = eta.atan2(xi);
    coeffs
        .iter()
        .enumerate()
        .filter(|(_, c)| **c != 0.)
        .map(|(k, c)| c * zernike(k + 1, rho, theta))
        .sum()
}
