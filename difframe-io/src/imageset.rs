//! Lazy, index-addressable frames bound to their geometry.

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use difframe_codec::unpack;
use difframe_core::{Beam, Detector, Goniometer, Mat3, PixelGeometry, Scan, ScanVarying};
use difframe_mask::{MaskConfig, MaskEngine};
use ndarray::Array2;
use rayon::prelude::*;

use crate::options::FormatOptions;
use crate::reader::FormatReader;
use crate::registry::{open_reader, ImageSource};
use crate::{Error, Result};

/// Models resolved for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometrySnapshot {
    pub beam: Option<Beam>,
    pub detector: Arc<Detector>,
    /// Goniometer rotation at the frame's image number.
    pub setting_rotation: Option<Mat3>,
    /// Start angle and width of the frame, in degrees.
    pub oscillation: Option<(f64, f64)>,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    /// Position in the image set.
    pub index: usize,
    /// Image number (scan numbering, or one-based without a scan).
    pub image: i32,
    /// Pixel values per panel, shaped `(slow, fast)`.
    pub data: Vec<Array2<i64>>,
    /// Usable-pixel grids per panel.
    pub mask: Vec<Array2<bool>>,
    pub geometry: GeometrySnapshot,
}

/// Ordered frames of a format reader together with the models needed to
/// interpret them.
///
/// Nothing is decoded until a frame is requested; frames are independent
/// and may be requested in any order or in parallel.
#[derive(Clone)]
pub struct ImageSet {
    reader: Arc<dyn FormatReader>,
    indices: Vec<usize>,
    beam: Option<Arc<ScanVarying<Beam>>>,
    detector: Arc<Detector>,
    goniometer: Option<Arc<Goniometer>>,
    scan: Option<Arc<Scan>>,
    masks: Arc<MaskEngine>,
}

impl fmt::Debug for ImageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSet")
            .field("format", &self.reader.format_name())
            .field("indices", &self.indices)
            .field("panels", &self.detector.num_panels())
            .field("scan", &self.scan.as_ref().map(|scan| scan.image_range()))
            .finish_non_exhaustive()
    }
}

fn static_mask_engine(reader: &dyn FormatReader, config: MaskConfig) -> Result<MaskEngine> {
    let mut engine = MaskEngine::new(config)?;
    if let Some(masks) = reader.static_mask() {
        for (panel, mask) in masks.iter().enumerate() {
            engine.add_static_mask(panel, mask.clone())?;
        }
    }
    Ok(engine)
}

impl ImageSet {
    /// Image set over every frame of `reader`, using the models the reader
    /// found in its metadata and the default mask configuration.
    ///
    /// # Errors
    /// Returns a mask error if the reader's static masks do not fit its
    /// panels.
    pub fn new(reader: Arc<dyn FormatReader>) -> Result<Self> {
        let masks = static_mask_engine(reader.as_ref(), MaskConfig::default())?;
        Ok(Self {
            indices: (0..reader.frame_count()).collect(),
            beam: reader.beam().cloned().map(|beam| Arc::new(ScanVarying::Fixed(beam))),
            detector: Arc::new(reader.panel_layout().clone()),
            goniometer: reader.goniometer().cloned().map(Arc::new),
            scan: reader.scan().cloned().map(Arc::new),
            masks: Arc::new(masks),
            reader,
        })
    }

    /// Detects the format of `paths` and opens them as one image set.
    ///
    /// # Errors
    /// Returns format detection and reader errors.
    pub fn open(paths: &[PathBuf], options: &FormatOptions) -> Result<Self> {
        let reader = open_reader(paths, options)?;
        Self::new(Arc::from(reader))
    }

    #[must_use]
    pub fn with_beam(mut self, beam: Arc<ScanVarying<Beam>>) -> Self {
        self.beam = Some(beam);
        self
    }

    #[must_use]
    pub fn with_detector(mut self, detector: Arc<Detector>) -> Self {
        self.detector = detector;
        self
    }

    #[must_use]
    pub fn with_goniometer(mut self, goniometer: Arc<Goniometer>) -> Self {
        self.goniometer = Some(goniometer);
        self
    }

    #[must_use]
    pub fn with_scan(mut self, scan: Arc<Scan>) -> Self {
        self.scan = Some(scan);
        self
    }

    /// Replaces the configured mask layers, keeping the reader's static
    /// masks.
    ///
    /// # Errors
    /// Returns a mask error if the reader's static masks do not fit.
    pub fn with_mask_config(mut self, config: MaskConfig) -> Result<Self> {
        self.masks = Arc::new(static_mask_engine(self.reader.as_ref(), config)?);
        Ok(self)
    }

    /// Uses a fully built engine, ANDing the reader's static masks into it.
    ///
    /// # Errors
    /// Returns a mask error if the reader's static masks do not fit.
    pub fn with_mask_engine(mut self, mut engine: MaskEngine) -> Result<Self> {
        if let Some(masks) = self.reader.static_mask() {
            for (panel, mask) in masks.iter().enumerate() {
                engine.add_static_mask(panel, mask.clone())?;
            }
        }
        self.masks = Arc::new(engine);
        Ok(self)
    }

    /// Restricts the set to the given reader frame indices.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for indices past the reader's last frame.
    pub fn with_reader_indices(mut self, indices: Vec<usize>) -> Result<Self> {
        let len = self.reader.frame_count();
        if let Some(&index) = indices.iter().find(|&&index| index >= len) {
            return Err(Error::IndexOutOfRange { index, len });
        }
        self.indices = indices;
        Ok(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[must_use]
    pub fn format_name(&self) -> &'static str {
        self.reader.format_name()
    }

    /// Reader frame index behind each position of the set.
    #[must_use]
    pub fn reader_indices(&self) -> &[usize] {
        &self.indices
    }

    #[must_use]
    pub fn beam(&self) -> Option<&Arc<ScanVarying<Beam>>> {
        self.beam.as_ref()
    }

    #[must_use]
    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }

    #[must_use]
    pub fn goniometer(&self) -> Option<&Arc<Goniometer>> {
        self.goniometer.as_ref()
    }

    #[must_use]
    pub fn scan(&self) -> Option<&Arc<Scan>> {
        self.scan.as_ref()
    }

    #[must_use]
    pub fn mask_engine(&self) -> &MaskEngine {
        &self.masks
    }

    /// Where the frames can be re-opened from.
    #[must_use]
    pub fn source(&self) -> Option<ImageSource> {
        self.reader.source()
    }

    /// Image number of position `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` if the number does not fit an `i32`.
    pub fn image_number(&self, index: usize) -> Result<i32> {
        let offset = i32::try_from(index).map_err(|_| Error::IndexOutOfRange {
            index,
            len: self.len(),
        })?;
        let first = self.scan.as_ref().map_or(1, |scan| scan.image_range().0);
        first.checked_add(offset).ok_or(Error::IndexOutOfRange {
            index,
            len: self.len(),
        })
    }

    /// Decodes frame `index` and resolves its geometry and mask.
    ///
    /// Failures are local to the frame; the set stays usable.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` outside the set, `SourceUnavailable` if the
    /// reader fails, codec errors for undecodable pixels, and core or mask
    /// errors from geometry resolution.
    pub fn get_frame(&self, index: usize) -> Result<ImageFrame> {
        let &reader_index = self.indices.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.len(),
        })?;
        let raw = self.reader.raw(reader_index).map_err(|err| {
            if err.is_source_failure() {
                log::warn!(
                    "{} reader failed on frame {reader_index}: {err}",
                    self.reader.format_name()
                );
                Error::SourceUnavailable {
                    index,
                    reason: err.to_string(),
                }
            } else {
                err
            }
        })?;
        if raw.panels.len() != self.detector.num_panels() {
            return Err(Error::InvalidFormat(format!(
                "frame {index} has {} panels, detector has {}",
                raw.panels.len(),
                self.detector.num_panels()
            )));
        }

        let data = self
            .detector
            .panels()
            .iter()
            .zip(&raw.panels)
            .map(|(panel, stored)| {
                let (nx, ny) = panel.image_size();
                let pixels = nx.checked_mul(ny).ok_or_else(|| {
                    Error::InvalidFormat(format!("panel of {nx}x{ny} pixels is not addressable"))
                })?;
                let values = unpack(&stored.data, &stored.encoding, pixels)?;
                Array2::from_shape_vec((ny, nx), values)
                    .map_err(|err| Error::InvalidFormat(err.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let image = self.image_number(index)?;
        let geometry = self.snapshot(image)?;
        let s0 = geometry.beam.as_ref().map(Beam::s0);
        let mask = self
            .masks
            .compute_detector_mask(&self.detector, &data, s0.as_ref())?;
        log::debug!(
            "decoded frame {index} (image {image}, reader frame {reader_index}) with {} panels",
            data.len()
        );
        Ok(ImageFrame {
            index,
            image,
            data,
            mask,
            geometry,
        })
    }

    fn snapshot(&self, image: i32) -> Result<GeometrySnapshot> {
        let scan = self.scan.as_deref();
        let position = f64::from(image);
        let beam = self
            .beam
            .as_ref()
            .map(|beam| beam.at_image(scan, position))
            .transpose()?;
        let setting_rotation = self
            .goniometer
            .as_ref()
            .map(|goniometer| goniometer.setting_rotation(scan, position))
            .transpose()?;
        let oscillation = scan.map(|scan| scan.image_oscillation(image)).transpose()?;
        Ok(GeometrySnapshot {
            beam,
            detector: Arc::clone(&self.detector),
            setting_rotation,
            oscillation,
        })
    }

    /// Frame holding image number `image` of the scan.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` (core) for images outside the scan and
    /// `InvalidModel` (core) if the set has no scan.
    pub fn frame_for_image(&self, image: i32) -> Result<ImageFrame> {
        let scan = self.scan.as_ref().ok_or_else(|| {
            difframe_core::Error::InvalidModel("image set has no scan".to_string())
        })?;
        scan.check_image_index(f64::from(image))?;
        let index = usize::try_from(image - scan.image_range().0).map_err(|_| {
            Error::InvalidFormat(format!("image {image} precedes the scan"))
        })?;
        self.get_frame(index)
    }

    /// Every frame, decoded in parallel. Each entry succeeds or fails on
    /// its own.
    #[must_use]
    pub fn par_frames(&self) -> Vec<Result<ImageFrame>> {
        (0..self.len())
            .into_par_iter()
            .map(|index| self.get_frame(index))
            .collect()
    }

    /// Positions `range` of the set as a new set.
    ///
    /// The scan and any scan-varying beam are cut to the same images;
    /// fixed models stay shared.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for empty ranges or ranges past the end.
    pub fn subset(&self, range: Range<usize>) -> Result<Self> {
        if range.is_empty() || range.end > self.len() {
            return Err(Error::IndexOutOfRange {
                index: range.end,
                len: self.len(),
            });
        }
        let scan = match &self.scan {
            Some(scan) => {
                let first = self.image_number(range.start)?;
                let last = self.image_number(range.end - 1)?;
                Some(Arc::new(scan.subset(first, last)?))
            }
            None => None,
        };
        let beam = match &self.beam {
            Some(beam) if beam.is_scan_varying() => {
                Some(Arc::new(beam.slice(range.start, range.len())?))
            }
            other => other.clone(),
        };
        Ok(Self {
            reader: Arc::clone(&self.reader),
            indices: self.indices[range].to_vec(),
            beam,
            detector: Arc::clone(&self.detector),
            goniometer: self.goniometer.clone(),
            scan,
            masks: Arc::clone(&self.masks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::InMemoryReader;
    use approx::assert_relative_eq;
    use difframe_core::{DetectorFactory, Vec3};
    use difframe_mask::Region;

    fn detector() -> Detector {
        DetectorFactory::simple(
            100.0,
            (0.4, 0.3),
            "+x",
            "-y",
            (0.1, 0.1),
            (8, 6),
            (0.0, 1000.0),
        )
        .unwrap()
    }

    fn frame(value: i64) -> Array2<i64> {
        Array2::from_shape_fn((6, 8), |(y, x)| value + (y * 8 + x) as i64)
    }

    fn image_set(frames: usize) -> ImageSet {
        let mut reader = InMemoryReader::new(detector())
            .with_beam(Beam::simple(1.0).unwrap())
            .with_goniometer(Goniometer::new(Vec3::x()).unwrap())
            .with_scan(Scan::new((1, i32::try_from(frames).unwrap()), (0.0, 0.5)).unwrap());
        for k in 0..frames {
            reader.push_frame(&[frame(k as i64 * 10)]).unwrap();
        }
        ImageSet::new(Arc::new(reader)).unwrap()
    }

    #[test]
    fn test_get_frame_decodes_and_resolves_geometry() {
        let set = image_set(4);
        assert_eq!(set.len(), 4);
        let frame = set.get_frame(2).unwrap();
        assert_eq!(frame.image, 3);
        assert_eq!(frame.data[0], self::frame(20));
        assert!(frame.mask[0].iter().all(|&usable| usable));
        let (start, width) = frame.geometry.oscillation.unwrap();
        assert_relative_eq!(start, 1.0);
        assert_relative_eq!(width, 0.5);
        let rotation = frame.geometry.setting_rotation.unwrap();
        assert_relative_eq!(rotation.determinant(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(frame.geometry.beam.unwrap().wavelength(), 1.0);
    }

    #[test]
    fn test_repeated_reads_identical() {
        let set = image_set(3);
        assert_eq!(set.get_frame(1).unwrap(), set.get_frame(1).unwrap());
    }

    #[test]
    fn test_index_out_of_range() {
        let set = image_set(2);
        assert!(matches!(
            set.get_frame(2),
            Err(Error::IndexOutOfRange { index: 2, len: 2 })
        ));
        assert!(set.get_frame(1).is_ok());
    }

    #[test]
    fn test_trusted_range_masks_hot_pixels() {
        let mut hot = frame(0);
        hot[[2, 3]] = 5000;
        let mut reader = InMemoryReader::new(detector());
        reader.push_frame(&[hot]).unwrap();
        let set = ImageSet::new(Arc::new(reader)).unwrap();
        let frame = set.get_frame(0).unwrap();
        assert!(!frame.mask[0][[2, 3]]);
        assert_eq!(frame.mask[0].iter().filter(|&&usable| !usable).count(), 1);
        assert_eq!(frame.image, 1);
        assert!(frame.geometry.beam.is_none());
    }

    #[test]
    fn test_reader_static_mask_is_merged() {
        let mut bad = Array2::from_elem((6, 8), true);
        bad[[0, 0]] = false;
        let mut reader = InMemoryReader::new(detector()).with_static_mask(vec![bad]);
        reader.push_frame(&[frame(0)]).unwrap();
        let set = ImageSet::new(Arc::new(reader))
            .unwrap()
            .with_mask_config(MaskConfig::default().without_trusted_range())
            .unwrap();
        assert!(!set.get_frame(0).unwrap().mask[0][[0, 0]]);
    }

    #[test]
    fn test_mask_engine_with_closure_region() {
        let engine = MaskEngine::default()
            .with_region(Region::predicate("near edge", |_, _, mm| mm.0 < 0.4))
            .unwrap();
        let set = image_set(1).with_mask_engine(engine).unwrap();
        let mask = &set.get_frame(0).unwrap().mask[0];
        assert!(!mask[[0, 0]]);
        assert!(!mask[[5, 3]]);
        assert!(mask[[0, 7]]);
    }

    #[test]
    fn test_subset_and_image_lookup() {
        let set = image_set(6);
        let sub = set.subset(2..5).unwrap();
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.reader_indices(), &[2, 3, 4]);
        assert_eq!(sub.scan().unwrap().image_range(), (3, 5));
        assert!(Arc::ptr_eq(sub.beam().unwrap(), set.beam().unwrap()));
        assert!(Arc::ptr_eq(sub.detector(), set.detector()));

        let frame = sub.frame_for_image(4).unwrap();
        assert_eq!(frame.index, 1);
        assert_eq!(frame.data[0], self::frame(30));
        assert!(sub.frame_for_image(6).is_err());
        assert!(set.subset(4..7).is_err());
        assert!(set.subset(3..3).is_err());
    }

    #[test]
    fn test_subset_slices_scan_varying_beam() {
        let beams = (0..5)
            .map(|k| Beam::simple(1.0 + f64::from(k) * 0.1).unwrap())
            .collect();
        let set = image_set(4).with_beam(Arc::new(ScanVarying::sampled(beams).unwrap()));
        let sub = set.subset(1..3).unwrap();
        assert_eq!(sub.beam().unwrap().num_samples(), Some(3));
        let frame = sub.get_frame(0).unwrap();
        assert_relative_eq!(frame.geometry.beam.unwrap().wavelength(), 1.1, epsilon = 1e-12);
    }

    #[test]
    fn test_par_frames_matches_sequential() {
        let set = image_set(5);
        let frames = set.par_frames();
        assert_eq!(frames.len(), 5);
        for (index, frame) in frames.into_iter().enumerate() {
            assert_eq!(frame.unwrap(), set.get_frame(index).unwrap());
        }
    }

    #[test]
    fn test_reader_indices_validated() {
        let set = image_set(3);
        assert!(set.clone().with_reader_indices(vec![2, 0]).is_ok());
        assert!(matches!(
            set.with_reader_indices(vec![3]),
            Err(Error::IndexOutOfRange { index: 3, len: 3 })
        ));
    }
}
