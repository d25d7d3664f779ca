//! Error contract shared by every entry point
//!
//! An [`Error`] names what went wrong ([`ErrorKind`]), where it happened and why.
//! Rays blocked by an aperture are not errors: they are reported per ray with
//! [`RayStatus::Vignetted`](crate::ray::RayStatus).

use std::fmt;
use thiserror::Error;

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed surface table, wavelength ≤ 0, grid size < 4, ...
    InvalidInput,
    /// Ray blocked by an aperture or by total internal reflection
    Vignetted,
    /// Newton or Brent iterations did not converge
    NonConvergence,
    /// Aspheric sag discriminant negative inside the clear aperture
    Domain,
    /// Request cancelled through a [`CancelToken`](crate::progress::CancelToken)
    Cancelled,
    /// Unexpected numerical failure with no recovery path
    Internal,
}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::Vignetted => "VIGNETTED",
            ErrorKind::NonConvergence => "NON_CONVERGENCE",
            ErrorKind::Domain => "DOMAIN",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

/// `optrace` error: `{ kind, where, detail }`
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} in {location}: {detail}")]
pub struct Error {
    pub kind: ErrorKind,
    pub location: &'static str,
    pub detail: String,
}
impl Error {
    pub fn new<S: Into<String>>(kind: ErrorKind, location: &'static str, detail: S) -> Self {
        Self {
            kind,
            location,
            detail: detail.into(),
        }
    }
    pub fn invalid_input<S: Into<String>>(location: &'static str, detail: S) -> Self {
        Self::new(ErrorKind::InvalidInput, location, detail)
    }
    pub fn non_convergence<S: Into<String>>(location: &'static str, detail: S) -> Self {
        Self::new(ErrorKind::NonConvergence, location, detail)
    }
    pub fn domain<S: Into<String>>(location: &'static str, detail: S) -> Self {
        Self::new(ErrorKind::Domain, location, detail)
    }
    pub fn cancelled(location: &'static str) -> Self {
        Self::new(ErrorKind::Cancelled, location, "cancelled by request")
    }
    pub fn internal<S: Into<String>>(location: &'static str, detail: S) -> Self {
        Self::new(ErrorKind::Internal, location, detail)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
