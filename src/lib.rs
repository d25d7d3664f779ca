//! Sequential ray tracing and wave optical analysis of optical systems
//!
//! A surface table ([`Surface`]) is resolved at a wavelength into an
//! [`OpticalSystem`]. Rays are traced through it with [`Tracer`], aimed at the
//! stop with [`Aimer`], and sampled over the pupil into a [`PupilMap`] of
//! optical path differences on the reference sphere. The wavefront is
//! decomposed on Zernike polynomials ([`ZernikeFit`]) and propagated to the
//! far field for the PSF, the Strehl ratio and the MTF ([`psf`]).
//! [`ANALYSIS`] chains all the steps in a single request.

pub mod aim;
pub mod analysis;
pub mod config;
pub mod error;
pub mod field;
pub mod frame;
pub mod glass;
pub mod intersect;
pub mod paraxial;
pub mod progress;
pub mod psf;
pub mod pupil;
pub mod ray;
pub mod refract;
pub mod surface;
pub mod system;
pub mod trace;
pub mod units;
pub mod zernike;

pub use aim::{Aimer, ChiefRay, Edge, EdgeRays, MarginalRay};
pub use analysis::{Analysis, ImagePlacement, WavefrontReport, WavelengthSpec, ANALYSIS};
pub use error::{Error, ErrorKind, Result};
pub use field::Field;
pub use frame::Frame;
pub use glass::{Glass, GlassCatalog, IndexFn, IndexModel};
pub use paraxial::Paraxial;
pub use progress::{CancelToken, ChannelSink, Monitor, Phase, Progress, ProgressSink};
pub use psf::{MtfResult, PsfGeometry, PsfResult, PsfSettings};
pub use pupil::{PupilMap, PupilPattern, PupilSpec};
pub use ray::{Ray, RayFailure, RayStatus};
pub use surface::{Aperture, Asphere, Medium, Surface, SurfaceKind, TiltOrder, Vector};
pub use system::OpticalSystem;
pub use trace::{SurfaceRecord, TraceResult, Tracer};
pub use units::Conversion;
pub use zernike::ZernikeFit;
