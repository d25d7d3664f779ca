//! Job files of the `optrace` command line
//!
//! A job is a JSON document with the sections `system`, `wavelengths`,
//! `field`, `pupil`, `psf`, `zernike` and `output`:
//!
//! ```json
//! {
//!   "system": {
//!     "surfaces": [
//!       { "kind": "OBJECT", "thickness": "inf" },
//!       { "kind": "STANDARD", "radius": 51.68, "thickness": 5, "semi_diameter": 2.5, "index_after": "N-BK7" },
//!       { "kind": "STANDARD", "radius": "inf", "thickness": 95, "semi_diameter": 12.5 },
//!       { "kind": "IMAGE" }
//!     ],
//!     "image": "paraxial"
//!   },
//!   "wavelengths": { "primary": 0.5876 },
//!   "field": { "type": "angle", "x": 0, "y": 0 },
//!   "pupil": { "size": 64 },
//!   "psf": { "padding": 2, "ee_radii": [2, 5, 10] },
//!   "output": { "directory": "out", "psf": true, "mtf": true }
//! }
//! ```

use crate::{
    analysis::{ImagePlacement, WavefrontReport, WavelengthSpec, ANALYSIS},
    error::{Error, Result},
    field::Field,
    glass::GlassCatalog,
    psf::{MtfResult, PsfResult, PsfSettings},
    pupil::{PupilMap, PupilSpec},
    surface::Surface,
    zernike::{noll_to_nm, ZernikeFit, DEFAULT_MODES},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    pub surfaces: Vec<Surface>,
    /// AGF catalog added to the built-in glasses
    #[serde(default)]
    pub glass_catalog: Option<PathBuf>,
    #[serde(default)]
    pub image: ImagePlacement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZernikeConfig {
    #[serde(default = "default_modes")]
    pub modes: usize,
    #[serde(default)]
    pub fit_then_evaluate: bool,
}
fn default_modes() -> usize {
    DEFAULT_MODES
}
impl Default for ZernikeConfig {
    fn default() -> Self {
        Self {
            modes: DEFAULT_MODES,
            fit_then_evaluate: false,
        }
    }
}

/// CSV tables written after a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub psf: bool,
    #[serde(default)]
    pub mtf: bool,
    #[serde(default)]
    pub pupil: bool,
    #[serde(default)]
    pub zernike: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub system: SystemConfig,
    pub wavelengths: WavelengthSpec,
    #[serde(default)]
    pub field: Field,
    #[serde(default)]
    pub pupil: PupilSpec,
    #[serde(default)]
    pub psf: PsfSettings,
    #[serde(default)]
    pub zernike: ZernikeConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub parallel: bool,
}
impl JobConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::invalid_input("config", e.to_string()))
    }
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::invalid_input("config", format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }
    /// Built-in glasses plus the optional AGF catalog
    pub fn catalog(&self) -> Result<GlassCatalog> {
        let mut catalog = GlassCatalog::builtin();
        if let Some(path) = &self.system.glass_catalog {
            let text = fs::read_to_string(path)
                .map_err(|e| Error::invalid_input("config", format!("{}: {}", path.display(), e)))?;
            let agf = GlassCatalog::parse_agf(&text)?;
            log::info!("{} glasses loaded from {}", agf.len(), path.display());
            catalog.merge(agf);
        }
        Ok(catalog)
    }
    /// Analysis request of the job
    pub fn analysis(&self) -> ANALYSIS {
        ANALYSIS::default()
            .set_wavelengths(self.wavelengths.clone())
            .set_field(self.field)
            .set_pupil(self.pupil)
            .set_image_placement(self.system.image)
            .set_zernike_modes(self.zernike.modes)
            .set_fit_then_evaluate(self.zernike.fit_then_evaluate)
            .set_psf(self.psf.clone())
            .set_parallel(self.parallel)
    }
    /// Writes the CSV tables selected in the `output` section, returns their paths
    pub fn write_outputs(&self, report: &WavefrontReport, directory: Option<&Path>) -> Result<Vec<PathBuf>> {
        let output = &self.output;
        let dir = match directory.or(output.directory.as_deref()) {
            Some(dir) => dir.to_path_buf(),
            None => return Ok(vec![]),
        };
        fs::create_dir_all(&dir)
            .map_err(|e| Error::internal("output", format!("{}: {}", dir.display(), e)))?;
        let mut written = vec![];
        if output.psf {
            let path = dir.join("psf.csv");
            write_psf_csv(&report.psf, &path)?;
            written.push(path);
        }
        if output.mtf {
            let path = dir.join("mtf.csv");
            write_mtf_csv(&report.mtf, &path)?;
            written.push(path);
        }
        if output.pupil {
            let path = dir.join("pupil.csv");
            write_pupil_csv(&report.pupil, &path)?;
            written.push(path);
        }
        if let (true, Some(fit)) = (output.zernike, report.zernike()) {
            let path = dir.join("zernike.csv");
            write_zernike_csv(fit, &path)?;
            written.push(path);
        }
        Ok(written)
    }
}

fn csv_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::internal("output", format!("{}: {}", path.display(), e))
}

#[derive(Serialize)]
struct PsfRow {
    x_um: f64,
    y_um: f64,
    intensity: f64,
}
/// PSF samples with their image plane coordinates [µm]
pub fn write_psf_csv(psf: &PsfResult, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    let c = (psf.size() / 2) as f64;
    for ((i, j), v) in psf.psf.indexed_iter() {
        wtr.serialize(PsfRow {
            x_um: (j as f64 - c) * psf.dx,
            y_um: (i as f64 - c) * psf.dx,
            intensity: *v,
        })
        .map_err(|e| csv_error(path, e))?;
    }
    wtr.flush().map_err(|e| csv_error(path, e))
}

#[derive(Serialize)]
struct MtfRow {
    freq_cycles_per_mm: f64,
    tangential: f64,
    sagittal: f64,
}
pub fn write_mtf_csv(mtf: &MtfResult, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    for ((f, t), s) in mtf
        .freq_cycles_per_mm
        .iter()
        .zip(&mtf.mtf_tangential)
        .zip(&mtf.mtf_sagittal)
    {
        wtr.serialize(MtfRow {
            freq_cycles_per_mm: *f,
            tangential: *t,
            sagittal: *s,
        })
        .map_err(|e| csv_error(path, e))?;
    }
    wtr.flush().map_err(|e| csv_error(path, e))
}

#[derive(Serialize)]
struct PupilRow {
    xi: f64,
    eta: f64,
    opd_um: Option<f64>,
}
/// Pupil OPD with piston removed, empty cells where vignetted
pub fn write_pupil_csv(pupil: &PupilMap, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    for ((i, j), v) in pupil.z_opd.indexed_iter() {
        wtr.serialize(PupilRow {
            xi: pupil.x[j],
            eta: pupil.y[i],
            opd_um: if pupil.mask[[i, j]] { Some(*v) } else { None },
        })
        .map_err(|e| csv_error(path, e))?;
    }
    wtr.flush().map_err(|e| csv_error(path, e))
}

#[derive(Serialize)]
struct ZernikeRow {
    j: usize,
    n: usize,
    m: i32,
    waves: f64,
}
pub fn write_zernike_csv(fit: &ZernikeFit, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    for (k, c) in fit.coeffs.iter().enumerate() {
        let (n, m) = noll_to_nm(k + 1);
        wtr.serialize(ZernikeRow {
            j: k + 1,
            n,
            m,
            waves: *c,
        })
        .map_err(|e| csv_error(path, e))?;
    }
    wtr.flush().map_err(|e| csv_error(path, e))
}
