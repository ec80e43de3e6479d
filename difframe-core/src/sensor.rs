//! Sensor materials and their X-ray attenuation.

use crate::beam::energy_ev_from_wavelength;
use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Silicon mass attenuation coefficients `(keV, cm²/g)` above the K edge.
const SILICON_MASS_ATTENUATION: [(f64, f64); 14] = [
    (2.0, 2.777e3),
    (3.0, 9.784e2),
    (4.0, 4.529e2),
    (5.0, 2.450e2),
    (6.0, 1.470e2),
    (8.0, 6.468e1),
    (10.0, 3.389e1),
    (15.0, 1.034e1),
    (20.0, 4.464),
    (30.0, 1.436),
    (40.0, 0.7012),
    (50.0, 0.4385),
    (60.0, 0.3207),
    (100.0, 0.1835),
];

const SILICON_DENSITY_G_CM3: f64 = 2.33;

/// Sensor material of a detector panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SensorMaterial {
    /// Silicon (Pilatus, Eiger and most hybrid pixel detectors).
    Si,
    /// Unspecified; attenuation must be supplied explicitly.
    #[default]
    Unknown,
}

impl SensorMaterial {
    /// Parses a material name as found in file headers.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "si" | "silicon" => Self::Si,
            _ => Self::Unknown,
        }
    }

    /// Linear attenuation coefficient in 1/mm at the given wavelength (Å).
    ///
    /// # Errors
    /// Returns `InvalidModel` for [`SensorMaterial::Unknown`] and
    /// `OutOfBounds` for energies outside the tabulated range.
    pub fn mu_per_mm(self, wavelength: f64) -> Result<f64> {
        match self {
            Self::Si => {
                let energy_kev = energy_ev_from_wavelength(wavelength) / 1000.0;
                let mass = log_log_interpolate(&SILICON_MASS_ATTENUATION, energy_kev)?;
                // cm^-1 -> mm^-1
                Ok(mass * SILICON_DENSITY_G_CM3 / 10.0)
            }
            Self::Unknown => Err(Error::InvalidModel(
                "attenuation of an unknown sensor material".to_string(),
            )),
        }
    }
}

fn log_log_interpolate(table: &[(f64, f64)], x: f64) -> Result<f64> {
    let (first, last) = (table[0].0, table[table.len() - 1].0);
    if !(first..=last).contains(&x) {
        return Err(Error::OutOfBounds(format!(
            "energy {x:.3} keV outside attenuation table [{first}, {last}] keV"
        )));
    }
    let upper = table
        .iter()
        .position(|&(e, _)| e >= x)
        .unwrap_or(table.len() - 1)
        .max(1);
    let (x0, y0) = table[upper - 1];
    let (x1, y1) = table[upper];
    let t = (x.ln() - x0.ln()) / (x1.ln() - x0.ln());
    Ok((y0.ln() + t * (y1.ln() - y0.ln())).exp())
}
