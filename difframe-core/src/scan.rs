//! Oscillation scan model.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tolerance (degrees) when joining two scans end to start.
const CONTIGUITY_TOLERANCE_DEG: f64 = 1e-6;

/// Sequence of oscillation images with angular and temporal metadata.
///
/// Images are numbered `start..=end`. Image `i` covers the angular range
/// starting at `oscillation_start + Σ widths[start..i]`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "ScanLayout"))]
pub struct Scan {
    image_range: (i32, i32),
    oscillation: (f64, f64),
    width_overrides: Option<Vec<f64>>,
    exposure_times: Vec<f64>,
    epochs: Vec<f64>,
    batch_offset: i32,
}

#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct ScanLayout {
    image_range: (i32, i32),
    oscillation: (f64, f64),
    width_overrides: Option<Vec<f64>>,
    exposure_times: Vec<f64>,
    epochs: Vec<f64>,
    batch_offset: i32,
}

#[cfg(feature = "serde")]
impl TryFrom<ScanLayout> for Scan {
    type Error = Error;

    fn try_from(layout: ScanLayout) -> Result<Self> {
        let mut scan = Self::new(layout.image_range, layout.oscillation)?
            .with_exposure_times(layout.exposure_times)?
            .with_batch_offset(layout.batch_offset);
        if let Some(widths) = layout.width_overrides {
            scan = scan.with_width_overrides(widths)?;
        }
        if !layout.epochs.is_empty() {
            scan = scan.with_epochs(layout.epochs)?;
        }
        Ok(scan)
    }
}

impl Scan {
    /// Creates a scan with a uniform oscillation `(start, width)` in degrees.
    ///
    /// # Errors
    /// Returns `InvalidModel` if `end < start` or the width is negative.
    pub fn new(image_range: (i32, i32), oscillation: (f64, f64)) -> Result<Self> {
        if image_range.1 < image_range.0 {
            return Err(Error::InvalidModel(format!(
                "scan end {} precedes start {}",
                image_range.1, image_range.0
            )));
        }
        if !oscillation.0.is_finite() || !oscillation.1.is_finite() || oscillation.1 < 0.0 {
            return Err(Error::InvalidModel(format!(
                "invalid oscillation {oscillation:?}"
            )));
        }
        Ok(Self {
            image_range,
            oscillation,
            width_overrides: None,
            exposure_times: vec![0.0],
            epochs: Vec::new(),
            batch_offset: 0,
        })
    }

    /// Replaces the uniform width by one width per image.
    ///
    /// # Errors
    /// Returns `InvalidModel` unless there is exactly one non-negative width
    /// per image.
    pub fn with_width_overrides(mut self, widths: Vec<f64>) -> Result<Self> {
        if widths.len() != self.num_images() {
            return Err(Error::InvalidModel(format!(
                "{} oscillation widths for {} images",
                widths.len(),
                self.num_images()
            )));
        }
        if widths.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::InvalidModel(
                "oscillation widths must be non-negative".to_string(),
            ));
        }
        self.width_overrides = Some(widths);
        Ok(self)
    }

    /// Sets exposure times: either one shared value or one per image.
    ///
    /// # Errors
    /// Returns `InvalidModel` for any other length.
    pub fn with_exposure_times(mut self, times: Vec<f64>) -> Result<Self> {
        if times.len() != 1 && times.len() != self.num_images() {
            return Err(Error::InvalidModel(format!(
                "{} exposure times for {} images",
                times.len(),
                self.num_images()
            )));
        }
        self.exposure_times = times;
        Ok(self)
    }

    /// Sets one epoch (seconds) per image.
    ///
    /// # Errors
    /// Returns `InvalidModel` unless there is one epoch per image.
    pub fn with_epochs(mut self, epochs: Vec<f64>) -> Result<Self> {
        if epochs.len() != self.num_images() {
            return Err(Error::InvalidModel(format!(
                "{} epochs for {} images",
                epochs.len(),
                self.num_images()
            )));
        }
        self.epochs = epochs;
        Ok(self)
    }

    /// Sets the batch offset.
    #[must_use]
    pub fn with_batch_offset(mut self, offset: i32) -> Self {
        self.batch_offset = offset;
        self
    }

    /// Inclusive image range `(start, end)`.
    #[must_use]
    pub fn image_range(&self) -> (i32, i32) {
        self.image_range
    }

    /// Number of images, `end - start + 1`.
    #[must_use]
    pub fn num_images(&self) -> usize {
        (i64::from(self.image_range.1) - i64::from(self.image_range.0) + 1) as usize
    }

    /// Zero-based half-open array range `(start - 1, end)`.
    #[must_use]
    pub fn array_range(&self) -> (i32, i32) {
        (self.image_range.0 - 1, self.image_range.1)
    }

    /// Oscillation `(start, width)` in degrees. With per-image overrides the
    /// width is that of the first image.
    #[must_use]
    pub fn oscillation(&self) -> (f64, f64) {
        match &self.width_overrides {
            Some(widths) => (self.oscillation.0, widths[0]),
            None => self.oscillation,
        }
    }

    /// Per-image widths, if overridden.
    #[must_use]
    pub fn width_overrides(&self) -> Option<&[f64]> {
        self.width_overrides.as_deref()
    }

    #[must_use]
    pub fn exposure_times(&self) -> &[f64] {
        &self.exposure_times
    }

    #[must_use]
    pub fn epochs(&self) -> &[f64] {
        &self.epochs
    }

    #[must_use]
    pub fn batch_offset(&self) -> i32 {
        self.batch_offset
    }

    /// Batch numbers covered by the scan.
    #[must_use]
    pub fn batch_range(&self) -> (i32, i32) {
        (
            self.image_range.0 + self.batch_offset,
            self.image_range.1 + self.batch_offset,
        )
    }

    /// Batch number of an image.
    #[must_use]
    pub fn batch_for_image(&self, image: i32) -> i32 {
        image + self.batch_offset
    }

    /// True if every image has zero oscillation width.
    #[must_use]
    pub fn is_still(&self) -> bool {
        match &self.width_overrides {
            Some(widths) => widths.iter().all(|w| *w == 0.0),
            None => self.oscillation.1 == 0.0,
        }
    }

    /// Validates a (possibly fractional) image index against `[start, end]`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` outside the range.
    pub fn check_image_index(&self, index: f64) -> Result<()> {
        let (first, last) = self.image_range;
        if index.is_finite() && index >= f64::from(first) && index <= f64::from(last) {
            Ok(())
        } else {
            Err(Error::index_out_of_range(
                index,
                i64::from(first),
                i64::from(last),
            ))
        }
    }

    fn width_at(&self, offset: usize) -> f64 {
        match &self.width_overrides {
            Some(widths) => widths[offset],
            None => self.oscillation.1,
        }
    }

    fn angle_at_offset(&self, offset: usize) -> f64 {
        match &self.width_overrides {
            Some(widths) => self.oscillation.0 + widths[..offset].iter().sum::<f64>(),
            None => self.oscillation.0 + offset as f64 * self.oscillation.1,
        }
    }

    /// Oscillation `(start, width)` of a single image.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for images outside the scan.
    pub fn image_oscillation(&self, image: i32) -> Result<(f64, f64)> {
        self.check_image_index(f64::from(image))?;
        let offset = (image - self.image_range.0) as usize;
        Ok((self.angle_at_offset(offset), self.width_at(offset)))
    }

    /// Exposure time of a single image.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for images outside the scan.
    pub fn exposure_time(&self, image: i32) -> Result<f64> {
        self.check_image_index(f64::from(image))?;
        let offset = (image - self.image_range.0) as usize;
        Ok(if self.exposure_times.len() == 1 {
            self.exposure_times[0]
        } else {
            self.exposure_times[offset]
        })
    }

    /// Epoch of a single image, if epochs were recorded.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for images outside the scan.
    pub fn epoch(&self, image: i32) -> Result<Option<f64>> {
        self.check_image_index(f64::from(image))?;
        let offset = (image - self.image_range.0) as usize;
        Ok(self.epochs.get(offset).copied())
    }

    /// Rotation angle (degrees) at a fractional image index.
    ///
    /// Index `start` maps to the oscillation start; the angle advances by
    /// each image's width per unit index.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` outside `[start, end]`.
    pub fn angle_from_image_index(&self, index: f64) -> Result<f64> {
        self.check_image_index(index)?;
        let position = index - f64::from(self.image_range.0);
        let whole = (position.floor() as usize).min(self.num_images() - 1);
        let fraction = position - whole as f64;
        Ok(self.angle_at_offset(whole) + fraction * self.width_at(whole))
    }

    /// Fractional image index at a rotation angle (degrees).
    ///
    /// # Errors
    /// Returns `InvalidModel` for a still scan and `OutOfBounds` for angles
    /// outside the scanned range.
    pub fn image_index_from_angle(&self, angle: f64) -> Result<f64> {
        if self.is_still() {
            return Err(Error::InvalidModel(
                "still scan has no angle to image mapping".to_string(),
            ));
        }
        if !self.is_angle_valid(angle) {
            return Err(Error::OutOfBounds(format!(
                "angle {angle} outside scan range {:?}",
                self.oscillation_range()
            )));
        }
        let start = f64::from(self.image_range.0);
        match &self.width_overrides {
            None => Ok(start + (angle - self.oscillation.0) / self.oscillation.1),
            Some(widths) => {
                let mut lower = self.oscillation.0;
                for (offset, width) in widths.iter().enumerate() {
                    let upper = lower + width;
                    if angle <= upper && *width > 0.0 {
                        return Ok(start + offset as f64 + (angle - lower) / width);
                    }
                    lower = upper;
                }
                Ok(start + widths.len() as f64)
            }
        }
    }

    /// Angular range `(first, last)` covered by all images.
    #[must_use]
    pub fn oscillation_range(&self) -> (f64, f64) {
        (
            self.oscillation.0,
            self.angle_at_offset(self.num_images() - 1) + self.width_at(self.num_images() - 1),
        )
    }

    /// True if `angle` lies within the scanned range.
    #[must_use]
    pub fn is_angle_valid(&self, angle: f64) -> bool {
        let (first, last) = self.oscillation_range();
        angle.is_finite() && angle >= first && angle <= last
    }

    /// Sub-scan covering images `first..=last`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` if the range is not inside the scan.
    pub fn subset(&self, first: i32, last: i32) -> Result<Self> {
        self.check_image_index(f64::from(first))?;
        self.check_image_index(f64::from(last))?;
        if last < first {
            return Err(Error::InvalidModel(format!(
                "subset end {last} precedes start {first}"
            )));
        }
        let lo = (first - self.image_range.0) as usize;
        let hi = (last - self.image_range.0) as usize + 1;
        let mut scan = Self::new((first, last), (self.angle_at_offset(lo), self.oscillation.1))?;
        scan.width_overrides = self.width_overrides.as_ref().map(|w| w[lo..hi].to_vec());
        scan.exposure_times = if self.exposure_times.len() == 1 {
            self.exposure_times.clone()
        } else {
            self.exposure_times[lo..hi].to_vec()
        };
        if !self.epochs.is_empty() {
            scan.epochs = self.epochs[lo..hi].to_vec();
        }
        scan.batch_offset = self.batch_offset;
        Ok(scan)
    }

    fn widths(&self) -> Vec<f64> {
        (0..self.num_images()).map(|i| self.width_at(i)).collect()
    }

    fn exposures(&self) -> Vec<f64> {
        (0..self.num_images())
            .map(|i| {
                if self.exposure_times.len() == 1 {
                    self.exposure_times[0]
                } else {
                    self.exposure_times[i]
                }
            })
            .collect()
    }

    /// Extends the scan by a scan that continues it in both image number
    /// and rotation angle.
    ///
    /// # Errors
    /// Returns `InvalidModel` if `other` does not start at the next image and
    /// at the angle where this scan ends.
    pub fn append(&mut self, other: &Self) -> Result<()> {
        if other.image_range.0 != self.image_range.1 + 1 {
            return Err(Error::InvalidModel(format!(
                "scan starting at image {} does not follow image {}",
                other.image_range.0, self.image_range.1
            )));
        }
        let end_angle = self.oscillation_range().1;
        if (other.oscillation.0 - end_angle).abs() > CONTIGUITY_TOLERANCE_DEG {
            return Err(Error::InvalidModel(format!(
                "scan starting at {} deg does not follow {end_angle} deg",
                other.oscillation.0
            )));
        }

        let uniform = self.width_overrides.is_none()
            && other.width_overrides.is_none()
            && (self.oscillation.1 - other.oscillation.1).abs() <= CONTIGUITY_TOLERANCE_DEG;
        if !uniform {
            let mut widths = self.widths();
            widths.extend(other.widths());
            self.width_overrides = Some(widths);
        }

        let shared_exposure = self.exposure_times.len() == 1
            && other.exposure_times.len() == 1
            && self.exposure_times[0] == other.exposure_times[0];
        if !shared_exposure {
            let mut times = self.exposures();
            times.extend(other.exposures());
            self.exposure_times = times;
        }

        if self.epochs.is_empty() || other.epochs.is_empty() {
            self.epochs.clear();
        } else {
            self.epochs.extend_from_slice(&other.epochs);
        }
        self.image_range.1 = other.image_range.1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scan() -> Scan {
        Scan::new((1, 10), (0.0, 1.0)).unwrap()
    }

    #[test]
    fn test_basic_properties() {
        let s = scan();
        assert_eq!(s.num_images(), 10);
        assert_eq!(s.array_range(), (0, 10));
        assert_eq!(s.oscillation_range(), (0.0, 10.0));
        assert!(!s.is_still());
        assert!(Scan::new((5, 4), (0.0, 1.0)).is_err());
        assert_eq!(Scan::new((3, 3), (0.0, 0.0)).unwrap().num_images(), 1);
    }

    #[test]
    fn test_angle_lookups() {
        let s = scan();
        assert_relative_eq!(s.angle_from_image_index(1.0).unwrap(), 0.0);
        assert_relative_eq!(s.angle_from_image_index(5.5).unwrap(), 4.5);
        assert_relative_eq!(s.angle_from_image_index(10.0).unwrap(), 9.0);
        assert_relative_eq!(s.image_index_from_angle(4.5).unwrap(), 5.5);
        assert!(matches!(
            s.angle_from_image_index(11.0),
            Err(Error::IndexOutOfRange { .. })
        ));
        assert!(s.angle_from_image_index(0.5).is_err());
        assert!(s.image_index_from_angle(-1.0).is_err());
    }

    #[test]
    fn test_width_overrides() {
        let s = Scan::new((1, 3), (10.0, 0.0))
            .unwrap()
            .with_width_overrides(vec![1.0, 2.0, 0.5])
            .unwrap();
        assert_eq!(s.image_oscillation(2).unwrap(), (11.0, 2.0));
        assert_relative_eq!(s.angle_from_image_index(2.5).unwrap(), 12.0);
        assert_relative_eq!(s.image_index_from_angle(12.0).unwrap(), 2.5);
        assert_eq!(s.oscillation_range(), (10.0, 13.5));
        assert!(Scan::new((1, 3), (0.0, 1.0))
            .unwrap()
            .with_width_overrides(vec![1.0])
            .is_err());
    }

    #[test]
    fn test_still_scan() {
        let s = Scan::new((1, 5), (30.0, 0.0)).unwrap();
        assert!(s.is_still());
        assert_relative_eq!(s.angle_from_image_index(4.0).unwrap(), 30.0);
        assert!(s.image_index_from_angle(30.0).is_err());
    }

    #[test]
    fn test_exposures_and_epochs() {
        let s = scan()
            .with_exposure_times(vec![0.1])
            .unwrap()
            .with_epochs((0..10_i32).map(f64::from).collect())
            .unwrap();
        assert_relative_eq!(s.exposure_time(7).unwrap(), 0.1);
        assert_eq!(s.epoch(3).unwrap(), Some(2.0));
        assert!(scan().with_exposure_times(vec![0.1, 0.2]).is_err());
        assert!(scan().with_epochs(vec![1.0]).is_err());
        assert_eq!(scan().epoch(3).unwrap(), None);
    }

    #[test]
    fn test_subset() {
        let s = scan().with_epochs((0..10_i32).map(f64::from).collect()).unwrap();
        let sub = s.subset(3, 5).unwrap();
        assert_eq!(sub.image_range(), (3, 5));
        assert_relative_eq!(sub.oscillation().0, 2.0);
        assert_eq!(sub.epochs(), &[2.0, 3.0, 4.0]);
        assert!(s.subset(9, 12).is_err());
    }

    #[test]
    fn test_append() {
        let mut a = Scan::new((1, 5), (0.0, 1.0)).unwrap();
        let b = Scan::new((6, 10), (5.0, 1.0)).unwrap();
        a.append(&b).unwrap();
        assert_eq!(a, scan());

        let mut a = Scan::new((1, 5), (0.0, 1.0)).unwrap();
        let c = Scan::new((6, 7), (5.0, 0.5)).unwrap();
        a.append(&c).unwrap();
        assert_eq!(a.num_images(), 7);
        assert_eq!(a.width_overrides().unwrap()[6], 0.5);
        assert_relative_eq!(a.oscillation_range().1, 6.0);

        let mut a = Scan::new((1, 5), (0.0, 1.0)).unwrap();
        assert!(a.append(&Scan::new((7, 8), (5.0, 1.0)).unwrap()).is_err());
        assert!(a.append(&Scan::new((6, 8), (7.0, 1.0)).unwrap()).is_err());
    }

    #[test]
    fn test_batches() {
        let s = scan().with_batch_offset(100);
        assert_eq!(s.batch_range(), (101, 110));
        assert_eq!(s.batch_for_image(4), 104);
    }
}
