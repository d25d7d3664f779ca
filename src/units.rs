//! Unit conversions
//!
//! Lengths are in millimeters, optical path differences in micrometers and
//! angles in radians internally; user facing angles are in degrees.

pub trait Conversion {
    fn mm_to_um(self) -> f64;
    fn um_to_mm(self) -> f64;
}
impl Conversion for f64 {
    /// Converts a length in millimeter to micrometer
    fn mm_to_um(self) -> f64 {
        1e3 * self
    }
    /// Converts a length in micrometer to millimeter
    fn um_to_mm(self) -> f64 {
        1e-3 * self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wavelength_in_mm() {
        assert!((0.5876f64.um_to_mm() - 5.876e-4).abs() < 1e-15);
        assert!((0.5876f64.um_to_mm().mm_to_um() - 0.5876).abs() < 1e-15);
    }
}
