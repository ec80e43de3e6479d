//! Incident beam model.

use crate::error::{Error, Result};
use crate::math::{normalized, Vec3};
use crate::scan_varying::Interpolate;
use crate::spectrum::Spectrum;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// `h·c` in eV·Å.
pub const HC_EV_ANGSTROM: f64 = 12_398.419_843_320_026;

/// Converts a photon energy in eV to a wavelength in Å.
#[must_use]
pub fn wavelength_from_energy_ev(energy_ev: f64) -> f64 {
    HC_EV_ANGSTROM / energy_ev
}

/// Converts a wavelength in Å to a photon energy in eV.
#[must_use]
pub fn energy_ev_from_wavelength(wavelength: f64) -> f64 {
    HC_EV_ANGSTROM / wavelength
}

/// Monochromatic incident beam.
///
/// `direction` points from the sample towards the source, so the incident
/// wave vector is `s0 = -direction / wavelength`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "BeamLayout"))]
pub struct Beam {
    direction: Vec3,
    wavelength: f64,
    divergence: f64,
    sigma_divergence: f64,
    polarization_normal: Vec3,
    polarization_fraction: f64,
    flux: f64,
    transmission: f64,
    spectrum: Option<Spectrum>,
}

#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct BeamLayout {
    direction: Vec3,
    wavelength: f64,
    divergence: f64,
    sigma_divergence: f64,
    polarization_normal: Vec3,
    polarization_fraction: f64,
    flux: f64,
    transmission: f64,
    spectrum: Option<Spectrum>,
}

#[cfg(feature = "serde")]
impl TryFrom<BeamLayout> for Beam {
    type Error = Error;

    fn try_from(layout: BeamLayout) -> Result<Self> {
        let mut beam = Self::new(layout.direction, layout.wavelength)?
            .with_polarization(layout.polarization_normal, layout.polarization_fraction)?
            .with_divergence(layout.divergence, layout.sigma_divergence)
            .with_flux(layout.flux)
            .with_transmission(layout.transmission);
        beam.spectrum = layout.spectrum;
        Ok(beam)
    }
}

impl Beam {
    /// Creates a beam from a direction (towards the source) and wavelength (Å).
    ///
    /// # Errors
    /// Returns `InvalidModel` for a zero direction or a non-positive wavelength.
    pub fn new(direction: Vec3, wavelength: f64) -> Result<Self> {
        if !wavelength.is_finite() || wavelength <= 0.0 {
            return Err(Error::InvalidModel(format!(
                "wavelength must be positive, got {wavelength}"
            )));
        }
        Ok(Self {
            direction: normalized(&direction, "beam direction")?,
            wavelength,
            divergence: 0.0,
            sigma_divergence: 0.0,
            polarization_normal: Vec3::y(),
            polarization_fraction: 0.999,
            flux: 0.0,
            transmission: 1.0,
            spectrum: None,
        })
    }

    /// Beam along the z axis with the given wavelength.
    ///
    /// # Errors
    /// Returns `InvalidModel` for a non-positive wavelength.
    pub fn simple(wavelength: f64) -> Result<Self> {
        Self::new(Vec3::z(), wavelength)
    }

    /// Creates a beam from an incident wave vector `s0`.
    ///
    /// # Errors
    /// Returns `InvalidModel` for a zero vector.
    pub fn from_s0(s0: &Vec3) -> Result<Self> {
        let norm = s0.norm();
        if !norm.is_finite() || norm <= 0.0 {
            return Err(Error::InvalidModel(format!("s0 {s0:?} has no length")));
        }
        Self::new(-s0, 1.0 / norm)
    }

    /// Sets divergence and its standard deviation (degrees).
    #[must_use]
    pub fn with_divergence(mut self, divergence: f64, sigma_divergence: f64) -> Self {
        self.divergence = divergence;
        self.sigma_divergence = sigma_divergence;
        self
    }

    /// Sets the polarization plane normal and fraction.
    ///
    /// # Errors
    /// Returns `InvalidModel` if the fraction lies outside `[0, 1]` or the
    /// normal has no length.
    pub fn with_polarization(mut self, normal: Vec3, fraction: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(Error::InvalidModel(format!(
                "polarization fraction must lie in [0, 1], got {fraction}"
            )));
        }
        self.polarization_normal = normalized(&normal, "polarization normal")?;
        self.polarization_fraction = fraction;
        Ok(self)
    }

    /// Sets the flux (photons/s).
    #[must_use]
    pub fn with_flux(mut self, flux: f64) -> Self {
        self.flux = flux;
        self
    }

    /// Sets the transmission fraction.
    #[must_use]
    pub fn with_transmission(mut self, transmission: f64) -> Self {
        self.transmission = transmission;
        self
    }

    /// Attaches a measured spectrum.
    #[must_use]
    pub fn with_spectrum(mut self, spectrum: Spectrum) -> Self {
        self.spectrum = Some(spectrum);
        self
    }

    /// Unit vector from the sample towards the source.
    #[must_use]
    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    /// Wavelength in Å.
    #[must_use]
    pub fn wavelength(&self) -> f64 {
        self.wavelength
    }

    /// Photon energy in eV.
    #[must_use]
    pub fn energy_ev(&self) -> f64 {
        energy_ev_from_wavelength(self.wavelength)
    }

    /// Incident wave vector, length `1 / wavelength`.
    #[must_use]
    pub fn s0(&self) -> Vec3 {
        -self.direction / self.wavelength
    }

    /// Unit incident direction.
    #[must_use]
    pub fn unit_s0(&self) -> Vec3 {
        -self.direction
    }

    #[must_use]
    pub fn divergence(&self) -> f64 {
        self.divergence
    }

    #[must_use]
    pub fn sigma_divergence(&self) -> f64 {
        self.sigma_divergence
    }

    #[must_use]
    pub fn polarization_normal(&self) -> Vec3 {
        self.polarization_normal
    }

    #[must_use]
    pub fn polarization_fraction(&self) -> f64 {
        self.polarization_fraction
    }

    #[must_use]
    pub fn flux(&self) -> f64 {
        self.flux
    }

    #[must_use]
    pub fn transmission(&self) -> f64 {
        self.transmission
    }

    #[must_use]
    pub fn spectrum(&self) -> Option<&Spectrum> {
        self.spectrum.as_ref()
    }
}

impl Interpolate for Beam {
    /// Interpolates `s0` and the polarization; other fields follow `self`.
    fn interpolate(&self, other: &Self, t: f64) -> Result<Self> {
        let s0 = self.s0().lerp(&other.s0(), t);
        let normal = self
            .polarization_normal
            .lerp(&other.polarization_normal, t);
        let fraction = self.polarization_fraction
            + t * (other.polarization_fraction - self.polarization_fraction);
        let mut beam = Self::from_s0(&s0)?.with_polarization(normal, fraction)?;
        beam.divergence = self.divergence;
        beam.sigma_divergence = self.sigma_divergence;
        beam.flux = self.flux;
        beam.transmission = self.transmission;
        beam.spectrum.clone_from(&self.spectrum);
        Ok(beam)
    }
}

/// Adjustments applied to a wavelength measured by a beamline.
///
/// The fallback replaces a missing or non-positive value; scale and offset
/// are then applied as `scale · λ + offset`.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WavelengthCalibration {
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub fallback: Option<f64>,
}

impl WavelengthCalibration {
    /// Applies the calibration to a measured wavelength.
    #[must_use]
    pub fn apply(&self, measured: Option<f64>) -> Option<f64> {
        let mut wavelength = match measured {
            Some(w) if w > 0.0 => Some(w),
            _ => self.fallback,
        };
        if let Some(w) = wavelength.as_mut() {
            if *w > 0.0 {
                if let Some(scale) = self.scale {
                    *w *= scale;
                }
                if let Some(offset) = self.offset {
                    *w += offset;
                }
            }
        }
        wavelength
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_simple_beam() {
        let beam = Beam::simple(1.0).unwrap();
        assert_relative_eq!(beam.s0(), Vec3::new(0.0, 0.0, -1.0));
        assert_relative_eq!(beam.energy_ev(), HC_EV_ANGSTROM);
        assert_relative_eq!(beam.polarization_fraction(), 0.999);
        assert_eq!(beam.polarization_normal(), Vec3::y());
    }

    #[test]
    fn test_invalid_beam() {
        assert!(Beam::simple(0.0).is_err());
        assert!(Beam::simple(-1.0).is_err());
        assert!(Beam::new(Vec3::zeros(), 1.0).is_err());
        assert!(Beam::simple(1.0)
            .unwrap()
            .with_polarization(Vec3::x(), 1.5)
            .is_err());
    }

    #[test]
    fn test_from_s0_round_trip() {
        let beam = Beam::new(Vec3::new(0.01, 0.0, 1.0), 0.9795).unwrap();
        let copy = Beam::from_s0(&beam.s0()).unwrap();
        assert_relative_eq!(copy.wavelength(), beam.wavelength(), epsilon = 1e-12);
        assert_relative_eq!(copy.direction(), beam.direction(), epsilon = 1e-12);
    }

    #[test]
    fn test_interpolate_wavelength() {
        let a = Beam::simple(1.0).unwrap();
        let b = Beam::simple(0.5).unwrap();
        let mid = a.interpolate(&b, 0.5).unwrap();
        // |s0| interpolates linearly: (1 + 2) / 2
        assert_relative_eq!(mid.wavelength(), 1.0 / 1.5, epsilon = 1e-12);
        assert_relative_eq!(a.interpolate(&b, 0.0).unwrap().wavelength(), 1.0);
        assert_relative_eq!(
            a.interpolate(&b, 1.0).unwrap().wavelength(),
            0.5,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_interpolate_opposed_beams_fails() {
        let a = Beam::simple(1.0).unwrap();
        let b = Beam::new(-Vec3::z(), 1.0).unwrap();
        assert!(matches!(a.interpolate(&b, 0.5), Err(Error::InvalidModel(_))));
    }

    #[test]
    fn test_wavelength_calibration() {
        let cal = WavelengthCalibration {
            scale: Some(2.0),
            offset: Some(0.1),
            fallback: Some(1.3),
        };
        assert_relative_eq!(cal.apply(Some(1.0)).unwrap(), 2.1);
        assert_relative_eq!(cal.apply(None).unwrap(), 2.7);
        assert_relative_eq!(cal.apply(Some(-1.0)).unwrap(), 2.7);
        assert_eq!(WavelengthCalibration::default().apply(None), None);
        assert_eq!(WavelengthCalibration::default().apply(Some(1.1)), Some(1.1));
    }
}
