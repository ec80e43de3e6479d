//! Values that are either fixed for a whole scan or sampled per image.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use crate::error::{Error, Result};
use crate::math::{Mat3, Vec3};
use crate::scan::Scan;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Linear interpolation between two values of the same model type.
pub trait Interpolate: Clone {
    /// Value at fraction `t` (0 → `self`, 1 → `other`).
    ///
    /// # Errors
    /// Returns `InvalidModel` if the blended value is not a valid model.
    fn interpolate(&self, other: &Self, t: f64) -> Result<Self>;
}

impl Interpolate for f64 {
    fn interpolate(&self, other: &Self, t: f64) -> Result<Self> {
        Ok(self + t * (other - self))
    }
}

impl Interpolate for Vec3 {
    fn interpolate(&self, other: &Self, t: f64) -> Result<Self> {
        Ok(self.lerp(other, t))
    }
}

impl Interpolate for Mat3 {
    fn interpolate(&self, other: &Self, t: f64) -> Result<Self> {
        Ok(self + (other - self) * t)
    }
}

/// A model value that is fixed or varies across the images of a scan.
///
/// Sample `k` belongs to image `start + k`. A scan of `n` images carries
/// either `n` samples or `n + 1` (the extra one closing the last image).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "ScanVaryingLayout<T>"))]
pub enum ScanVarying<T> {
    Fixed(T),
    Sampled(Vec<T>),
}

#[cfg(feature = "serde")]
#[derive(Deserialize)]
enum ScanVaryingLayout<T> {
    Fixed(T),
    Sampled(Vec<T>),
}

#[cfg(feature = "serde")]
impl<T> TryFrom<ScanVaryingLayout<T>> for ScanVarying<T> {
    type Error = Error;

    fn try_from(layout: ScanVaryingLayout<T>) -> Result<Self> {
        match layout {
            ScanVaryingLayout::Fixed(value) => Ok(Self::Fixed(value)),
            ScanVaryingLayout::Sampled(samples) if samples.is_empty() => Err(Error::InvalidModel(
                "scan-varying value needs at least one sample".to_string(),
            )),
            ScanVaryingLayout::Sampled(samples) => Ok(Self::Sampled(samples)),
        }
    }
}

impl<T: Interpolate> ScanVarying<T> {
    /// Sampled value list.
    ///
    /// # Errors
    /// Returns `InvalidModel` for an empty list.
    pub fn sampled(samples: Vec<T>) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::InvalidModel(
                "scan-varying value needs at least one sample".to_string(),
            ));
        }
        Ok(Self::Sampled(samples))
    }

    #[must_use]
    pub fn is_scan_varying(&self) -> bool {
        matches!(self, Self::Sampled(_))
    }

    /// Number of samples, `None` for a fixed value.
    #[must_use]
    pub fn num_samples(&self) -> Option<usize> {
        match self {
            Self::Fixed(_) => None,
            Self::Sampled(samples) => Some(samples.len()),
        }
    }

    /// The fixed value, or the first sample.
    #[must_use]
    pub fn reference(&self) -> Option<&T> {
        match self {
            Self::Fixed(value) => Some(value),
            Self::Sampled(samples) => samples.first(),
        }
    }

    /// Checks that the sample count fits the scan.
    ///
    /// # Errors
    /// Returns `InvalidModel` unless there are `n` or `n + 1` samples.
    pub fn check_against(&self, scan: &Scan) -> Result<()> {
        if let Self::Sampled(samples) = self {
            let n = scan.num_images();
            if samples.len() != n && samples.len() != n + 1 {
                return Err(Error::InvalidModel(format!(
                    "{} samples for a scan of {n} images",
                    samples.len()
                )));
            }
        }
        Ok(())
    }

    /// Value at a (possibly fractional) image index.
    ///
    /// With a scan the index must lie in `[start, end]`, even for a fixed
    /// value. Sampled values are linearly interpolated between the two
    /// bracketing samples.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` outside the scan, and `InvalidModel` for
    /// sampled values without a scan, with a mismatched sample count or
    /// whose blend is not a valid model.
    pub fn at_image(&self, scan: Option<&Scan>, index: f64) -> Result<T> {
        if let Some(scan) = scan {
            scan.check_image_index(index)?;
        }
        match self {
            Self::Fixed(value) => Ok(value.clone()),
            Self::Sampled(samples) => {
                let scan = scan.ok_or_else(|| {
                    Error::InvalidModel("sampled value requested without a scan".to_string())
                })?;
                self.check_against(scan)?;
                let position = index - f64::from(scan.image_range().0);
                let lower = (position.floor() as usize).min(samples.len() - 1);
                let fraction = position - lower as f64;
                match samples.get(lower + 1) {
                    Some(upper) if fraction > 0.0 => samples[lower].interpolate(upper, fraction),
                    _ => Ok(samples[lower].clone()),
                }
            }
        }
    }

    /// Values for `count` images starting `first` images into the scan,
    /// keeping the closing sample when there is one.
    ///
    /// # Errors
    /// Returns `InvalidModel` if the samples do not cover the images.
    pub fn slice(&self, first: usize, count: usize) -> Result<Self> {
        match self {
            Self::Fixed(value) => Ok(Self::Fixed(value.clone())),
            Self::Sampled(samples) => {
                if count == 0 || first + count > samples.len() {
                    return Err(Error::InvalidModel(format!(
                        "cannot take {count} images from {first} of {} samples",
                        samples.len()
                    )));
                }
                let end = (first + count + 1).min(samples.len());
                Ok(Self::Sampled(samples[first..end].to_vec()))
            }
        }
    }
}

impl<T> From<T> for ScanVarying<T> {
    fn from(value: T) -> Self {
        Self::Fixed(value)
    }
}
