//! Reader options.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use difframe_core::{Beam, Spectrum, SpectrumCheck, Vec3, WavelengthCalibration};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Options applied by readers when building models from file metadata.
///
/// Every field is optional in JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Corrections to the wavelength recorded in headers.
    pub wavelength: WavelengthCalibration,
    /// Replaces the polarization plane normal of every beam.
    pub polarization_normal: Option<[f64; 3]>,
    /// Rejects beams whose spectrum fails this check.
    pub check_spectrum: Option<SpectrumCheck>,
}

impl FormatOptions {
    /// Load options from a JSON file.
    ///
    /// # Errors
    /// Returns I/O or JSON errors.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Load options from a JSON string.
    ///
    /// # Errors
    /// Returns JSON errors.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// # Errors
    /// Returns JSON serialization errors.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Beam for a measured wavelength (Å) and optional spectrum.
    ///
    /// A spectrum takes precedence: its weighted wavelength is used as is,
    /// after the optional spectrum check. Otherwise the calibration is
    /// applied to the measured wavelength. Returns `None` when no usable
    /// wavelength remains or the spectrum is rejected.
    ///
    /// # Errors
    /// Returns model errors for an invalid polarization normal.
    pub fn resolve_beam(
        &self,
        measured: Option<f64>,
        spectrum: Option<Spectrum>,
    ) -> Result<Option<Beam>> {
        let wavelength = match &spectrum {
            Some(spectrum) => {
                if let Some(check) = &self.check_spectrum {
                    if !check.accepts(spectrum) {
                        log::debug!("spectrum rejected by {check:?}");
                        return Ok(None);
                    }
                }
                Some(spectrum.weighted_wavelength())
            }
            None => self.wavelength.apply(measured),
        };
        let Some(wavelength) = wavelength.filter(|w| *w > 0.0) else {
            return Ok(None);
        };
        let mut beam = Beam::simple(wavelength)?;
        if let Some(normal) = self.polarization_normal {
            let fraction = beam.polarization_fraction();
            beam = beam.with_polarization(Vec3::from(normal), fraction)?;
        }
        if let Some(spectrum) = spectrum {
            beam = beam.with_spectrum(spectrum);
        }
        Ok(Some(beam))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_calibrated_wavelength() {
        let options = FormatOptions::from_json(
            r#"{"wavelength": {"scale": 2.0, "offset": 0.1}, "polarization_normal": [1, 0, 0]}"#,
        )
        .unwrap();
        let beam = options.resolve_beam(Some(0.5), None).unwrap().unwrap();
        assert_relative_eq!(beam.wavelength(), 1.1, epsilon = 1e-12);
        assert_relative_eq!(beam.polarization_normal(), Vec3::x());
    }

    #[test]
    fn test_fallback_and_missing_wavelength() {
        let options = FormatOptions::default();
        assert!(options.resolve_beam(None, None).unwrap().is_none());
        assert!(options.resolve_beam(Some(-1.0), None).unwrap().is_none());

        let options = FormatOptions::from_json(r#"{"wavelength": {"fallback": 1.3}}"#).unwrap();
        let beam = options.resolve_beam(Some(0.0), None).unwrap().unwrap();
        assert_relative_eq!(beam.wavelength(), 1.3);
    }

    #[test]
    fn test_spectrum_takes_precedence() {
        let spectrum = Spectrum::new(vec![9000.0, 9010.0], vec![1.0, 1.0]).unwrap();
        let expected = spectrum.weighted_wavelength();
        let options = FormatOptions::from_json(r#"{"wavelength": {"scale": 3.0}}"#).unwrap();
        let beam = options.resolve_beam(Some(1.0), Some(spectrum.clone())).unwrap().unwrap();
        assert_relative_eq!(beam.wavelength(), expected, epsilon = 1e-12);
        assert!(beam.spectrum().is_some());

        let strict = FormatOptions {
            check_spectrum: Some(SpectrumCheck::default()),
            ..FormatOptions::default()
        };
        // Far below the default minimum height.
        assert!(strict.resolve_beam(Some(1.0), Some(spectrum)).unwrap().is_none());
    }

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(FormatOptions::from_json("{}").unwrap(), FormatOptions::default());
        let options = FormatOptions {
            polarization_normal: Some([0.0, 1.0, 0.0]),
            ..FormatOptions::default()
        };
        assert_eq!(FormatOptions::from_json(&options.to_json().unwrap()).unwrap(), options);
    }
}
