//! Polychromatic source spectra.
#![allow(clippy::cast_precision_loss)]

use crate::beam::wavelength_from_energy_ev;
use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Ordered `(energy, weight)` samples of an incident spectrum.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "SpectrumLayout"))]
pub struct Spectrum {
    energies_ev: Vec<f64>,
    weights: Vec<f64>,
}

#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct SpectrumLayout {
    energies_ev: Vec<f64>,
    weights: Vec<f64>,
}

#[cfg(feature = "serde")]
impl TryFrom<SpectrumLayout> for Spectrum {
    type Error = Error;

    fn try_from(layout: SpectrumLayout) -> Result<Self> {
        Self::new(layout.energies_ev, layout.weights)
    }
}

impl Spectrum {
    /// Creates a spectrum from matching energy and weight columns.
    ///
    /// # Errors
    /// Returns `InvalidModel` if the columns are empty, differ in length,
    /// contain non-finite values or carry no total weight.
    pub fn new(energies_ev: Vec<f64>, weights: Vec<f64>) -> Result<Self> {
        if energies_ev.is_empty() || energies_ev.len() != weights.len() {
            return Err(Error::InvalidModel(format!(
                "spectrum needs matching non-empty columns, got {} energies and {} weights",
                energies_ev.len(),
                weights.len()
            )));
        }
        if energies_ev.iter().chain(&weights).any(|v| !v.is_finite()) {
            return Err(Error::InvalidModel(
                "spectrum contains non-finite values".to_string(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(Error::InvalidModel(
                "spectrum has no positive total weight".to_string(),
            ));
        }
        Ok(Self {
            energies_ev,
            weights,
        })
    }

    /// Energies in eV.
    #[must_use]
    pub fn energies_ev(&self) -> &[f64] {
        &self.energies_ev
    }

    /// Sample weights.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.energies_ev.len()
    }

    /// Always false for a constructed spectrum.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.energies_ev.is_empty()
    }

    /// Weight-averaged energy in eV.
    #[must_use]
    pub fn weighted_energy_ev(&self) -> f64 {
        let total: f64 = self.weights.iter().sum();
        self.energies_ev
            .iter()
            .zip(&self.weights)
            .map(|(e, w)| e * w)
            .sum::<f64>()
            / total
    }

    /// Wavelength (Å) of the weighted energy.
    #[must_use]
    pub fn weighted_wavelength(&self) -> f64 {
        wavelength_from_energy_ev(self.weighted_energy_ev())
    }
}

/// Acceptance test for a measured spectrum.
///
/// The weights are box-smoothed, then the spectrum is rejected if its peak
/// is below `min_height` or its width at `intensity_threshold · peak`,
/// relative to the weighted energy, is not below `max_width`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SpectrumCheck {
    /// Smoothing box width in samples.
    pub smooth_window: usize,
    /// Maximum accepted fractional width.
    pub max_width: f64,
    /// Fraction of the peak at which the width is measured.
    pub intensity_threshold: f64,
    /// Minimum accepted peak height after smoothing.
    pub min_height: f64,
}

impl Default for SpectrumCheck {
    fn default() -> Self {
        Self {
            smooth_window: 50,
            max_width: 0.003,
            intensity_threshold: 0.2,
            min_height: 500.0,
        }
    }
}

impl SpectrumCheck {
    /// Returns true if the spectrum passes the check.
    #[must_use]
    pub fn accepts(&self, spectrum: &Spectrum) -> bool {
        let smoothed = box_smooth(spectrum.weights(), self.smooth_window);
        let peak = smoothed.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if peak < self.min_height {
            return false;
        }
        let threshold = peak * self.intensity_threshold;
        let first = smoothed.iter().position(|&y| y > threshold);
        let last = smoothed.iter().rposition(|&y| y > threshold);
        let (Some(first), Some(last)) = (first, last) else {
            return false;
        };
        let energies = spectrum.energies_ev();
        let width = energies[last] - energies[first];
        width / spectrum.weighted_energy_ev() < self.max_width
    }
}

/// Box convolution returning an array centred on the input ("same" mode).
fn box_smooth(values: &[f64], window: usize) -> Vec<f64> {
    let n = window.max(1);
    let len = values.len();
    let offset = (n - 1) / 2;
    let scale = 1.0 / n as f64;
    (0..len)
        .map(|i| {
            let k = i + offset;
            let lo = (k + 1).saturating_sub(n);
            let hi = k.min(len - 1);
            values[lo..=hi].iter().sum::<f64>() * scale
        })
        .collect()
}
