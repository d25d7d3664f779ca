//! Glass catalog and refractive index models
//!
//! The tracer never evaluates dispersion itself: it asks an [`IndexModel`]
//! for `n(material, λ)`. [`GlassCatalog`] is the stock implementation, based on
//! the Sellmeier dispersion formula
//! $$n^2(\lambda) = 1 + \sum_{i=1}^3 \frac{K_i\lambda^2}{\lambda^2-L_i},$$
//! with $\lambda$ in micrometers.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Refractive index provider
pub trait IndexModel: Send + Sync {
    /// Returns the refractive index of `material` at `wavelength` [µm] or `None` if unknown
    fn index(&self, material: &str, wavelength: f64) -> Option<f64>;
}

/// Adapter turning a closure into an [`IndexModel`]
pub struct IndexFn<F>(pub F);
impl<F> IndexModel for IndexFn<F>
where
    F: Fn(&str, f64) -> Option<f64> + Send + Sync,
{
    fn index(&self, material: &str, wavelength: f64) -> Option<f64> {
        (self.0)(material, wavelength)
    }
}

/// Sellmeier glass
#[derive(Debug, Clone, PartialEq)]
pub struct Glass {
    pub name: String,
    /// Index at the d line (587.56nm)
    pub nd: f64,
    /// Abbe number
    pub vd: f64,
    /// Sellmeier coefficients `[K1, L1, K2, L2, K3, L3]`, L in µm²
    pub sellmeier: [f64; 6],
}
impl Glass {
    pub fn new(name: &str, nd: f64, vd: f64, sellmeier: [f64; 6]) -> Self {
        Self {
            name: name.to_owned(),
            nd,
            vd,
            sellmeier,
        }
    }
    /// Refractive index at `wavelength` [µm]
    pub fn index(&self, wavelength: f64) -> f64 {
        let l2 = wavelength * wavelength;
        let s = &self.sellmeier;
        let n2 = 1.0
            + s[0] * l2 / (l2 - s[1])
            + s[2] * l2 / (l2 - s[3])
            + s[4] * l2 / (l2 - s[5]);
        n2.sqrt()
    }
}

/// A set of glasses indexed by upper-case name
#[derive(Debug, Clone, Default)]
pub struct GlassCatalog {
    glasses: BTreeMap<String, Glass>,
}
impl GlassCatalog {
    /// An empty catalog
    pub fn new() -> Self {
        Self::default()
    }
    /// Catalog with a few common Schott glasses and fused silica
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.insert(Glass::new(
            "N-BK7",
            1.5168,
            64.17,
            [
                1.03961212,
                0.00600069867,
                0.231792344,
                0.0200179144,
                1.01046945,
                103.560653,
            ],
        ));
        catalog.insert(Glass::new(
            "N-SF11",
            1.78472,
            25.68,
            [
                1.73759695,
                0.013188707,
                0.313747346,
                0.0623068142,
                1.89878101,
                155.23629,
            ],
        ));
        catalog.insert(Glass::new(
            "F2",
            1.62004,
            36.37,
            [
                1.34533359,
                0.00997743871,
                0.209073176,
                0.0470450767,
                0.937357162,
                111.886764,
            ],
        ));
        catalog.insert(Glass::new(
            "N-SK16",
            1.62041,
            60.32,
            [
                1.34317774,
                0.00704687339,
                0.241144399,
                0.0229005,
                0.994317969,
                92.7508526,
            ],
        ));
        catalog.insert(Glass::new(
            "SILICA",
            1.458464,
            67.82,
            [
                0.6961663,
                0.004679148,
                0.4079426,
                0.01351206,
                0.8974794,
                97.934,
            ],
        ));
        catalog.alias("BK7", "N-BK7");
        catalog.alias("FUSED_SILICA", "SILICA");
        catalog
    }
    pub fn insert(&mut self, glass: Glass) {
        self.glasses.insert(glass.name.to_uppercase(), glass);
    }
    fn alias(&mut self, alias: &str, name: &str) {
        if let Some(glass) = self.glasses.get(name).cloned() {
            self.glasses.insert(alias.to_uppercase(), glass);
        }
    }
    /// Adds the glasses of `other`, replacing the ones with the same name
    pub fn merge(&mut self, other: GlassCatalog) {
        self.glasses.extend(other.glasses);
    }
    pub fn get(&self, name: &str) -> Option<&Glass> {
        self.glasses.get(&name.to_uppercase())
    }
    pub fn len(&self) -> usize {
        self.glasses.len()
    }
    pub fn is_empty(&self) -> bool {
        self.glasses.is_empty()
    }
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.glasses.keys().map(|k| k.as_str())
    }
    /// Parses the text of a Zemax AGF catalog
    ///
    /// Only `NM` records with dispersion formula 2 (Sellmeier 1) are kept,
    /// their `CD` record holds `K1 L1 K2 L2 K3 L3`.
    pub fn parse_agf(text: &str) -> Result<Self> {
        let mut catalog = Self::new();
        let mut current: Option<Glass> = None;
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("NM") => {
                    if let Some(glass) = current.take() {
                        catalog.insert(glass);
                    }
                    let parts: Vec<&str> = fields.collect();
                    if parts.len() < 4 {
                        return Err(Error::invalid_input(
                            "glass",
                            format!("line {}: truncated NM record", line_no + 1),
                        ));
                    }
                    let formula = parse_number(parts[1], line_no)?;
                    if formula as i32 != 2 {
                        log::warn!(
                            "glass {}: dispersion formula {} is not supported, skipped",
                            parts[0],
                            formula
                        );
                        continue;
                    }
                    current = Some(Glass {
                        name: parts[0].to_owned(),
                        nd: parse_number(parts[3], line_no)?,
                        vd: parts
                            .get(4)
                            .map(|x| parse_number(x, line_no))
                            .transpose()?
                            .unwrap_or(0.0),
                        sellmeier: [f64::NAN; 6],
                    });
                }
                Some("CD") => {
                    if let Some(glass) = current.as_mut() {
                        let coefs = fields
                            .map(|x| parse_number(x, line_no))
                            .collect::<Result<Vec<f64>>>()?;
                        if coefs.len() < 6 {
                            return Err(Error::invalid_input(
                                "glass",
                                format!("line {}: CD record needs 6 coefficients", line_no + 1),
                            ));
                        }
                        glass.sellmeier.copy_from_slice(&coefs[..6]);
                    }
                }
                _ => (),
            }
        }
        if let Some(glass) = current.take() {
            catalog.insert(glass);
        }
        catalog
            .glasses
            .retain(|_, g| g.sellmeier.iter().all(|x| x.is_finite()));
        log::info!("AGF catalog: {} glasses", catalog.len());
        Ok(catalog)
    }
}
fn parse_number(s: &str, line_no: usize) -> Result<f64> {
    s.parse::<f64>().map_err(|e| {
        Error::invalid_input("glass", format!("line {}: {} ({})", line_no + 1, s, e))
    })
}
impl IndexModel for GlassCatalog {
    fn index(&self, material: &str, wavelength: f64) -> Option<f64> {
        self.get(material).map(|g| g.index(wavelength))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bk7_d_line() {
        let catalog = GlassCatalog::builtin();
        let n = catalog.index("N-BK7", 0.5875618).unwrap();
        assert!((n - 1.5168).abs() < 1e-4, "n={}", n);
        assert_eq!(catalog.index("bk7", 0.5875618), Some(n));
        assert!(catalog.index("unobtainium", 0.5875618).is_none());
    }

    #[test]
    fn normal_dispersion() {
        let catalog = GlassCatalog::builtin();
        for name in ["N-BK7", "F2", "N-SF11", "SILICA"] {
            let blue = catalog.index(name, 0.4861).unwrap();
            let red = catalog.index(name, 0.6563).unwrap();
            assert!(blue > red, "{}: {} <= {}", name, blue, red);
        }
    }

    #[test]
    fn agf_parsing() {
        let agf = "CC Test catalog\n\
                   NM N-BK7 2 517642.251 1.5168 64.17 0 1\n\
                   GC\n\
                   CD 1.03961212 6.00069867E-03 2.31792344E-01 2.00179144E-02 1.01046945 1.03560653E+02 0 0 0 0\n\
                   NM ODD 1 0 1.6 40 0 1\n\
                   CD 1 2 3 4 5 6\n";
        let catalog = GlassCatalog::parse_agf(agf).unwrap();
        assert_eq!(catalog.len(), 1);
        let n = catalog.index("n-bk7", 0.5875618).unwrap();
        assert!((n - 1.5168).abs() < 1e-4);
    }

    #[test]
    fn agf_malformed() {
        let agf = "NM X 2 0 abc 40\n";
        assert!(GlassCatalog::parse_agf(agf).is_err());
    }

    #[test]
    fn closure_index_model() {
        let model = IndexFn(|m: &str, _l: f64| if m == "WATER" { Some(1.333) } else { None });
        assert_eq!(model.index("WATER", 0.5), Some(1.333));
    }
}
