//! Format-reader capability and the readers shared by concrete formats.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use difframe_codec::{byte_offset, PixelEncoding};
use difframe_core::{Beam, Detector, Goniometer, PixelGeometry, Scan};
use memmap2::Mmap;
use ndarray::Array2;

use crate::registry::ImageSource;
use crate::{Error, Result};

/// Stored pixels of one panel.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPanel {
    pub data: Vec<u8>,
    pub encoding: PixelEncoding,
}

/// Stored pixels of one frame, one entry per detector panel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawFrame {
    pub panels: Vec<RawPanel>,
}

/// A source of raw detector frames and the models described by its metadata.
///
/// Readers are selected once by [`crate::open_reader`] and then addressed by
/// frame index in any order, possibly from several threads.
pub trait FormatReader: Send + Sync {
    /// Short format name used in logs and persisted image sets.
    fn format_name(&self) -> &'static str;

    fn frame_count(&self) -> usize;

    /// Stored bytes and encodings of frame `index`.
    ///
    /// # Errors
    /// Returns an error if the frame cannot be read.
    fn raw(&self, index: usize) -> Result<RawFrame>;

    /// Detector template for every frame.
    fn panel_layout(&self) -> &Detector;

    fn beam(&self) -> Option<&Beam> {
        None
    }

    fn goniometer(&self) -> Option<&Goniometer> {
        None
    }

    fn scan(&self) -> Option<&Scan> {
        None
    }

    /// Per-panel bad-pixel masks recorded by the format.
    fn static_mask(&self) -> Option<&[Array2<bool>]> {
        None
    }

    /// Where the frames came from, if they can be re-opened.
    fn source(&self) -> Option<ImageSource> {
        None
    }
}

/// A memory-mapped file.
///
/// Uses memmap2 to access file contents without loading the entire file
/// into memory.
#[derive(Clone)]
pub struct MappedFile {
    mmap: Arc<Mmap>,
    path: PathBuf,
}

impl MappedFile {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap: Arc::new(mmap),
            path: path.as_ref().to_path_buf(),
        })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes `offset..offset + len`.
    ///
    /// # Errors
    /// Returns `InvalidFormat` if the range runs past the end of the file.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = offset.checked_add(len).map(|end| offset..end);
        range.and_then(|range| self.mmap.get(range)).ok_or_else(|| {
            Error::InvalidFormat(format!(
                "{} bytes at offset {offset} exceed file size {} (file: {})",
                len,
                self.len(),
                self.path.display()
            ))
        })
    }
}

/// Frames and models held in memory.
///
/// Frames pushed as values are stored byte-offset compressed or as packed
/// little-endian words, so retrieval goes through the same decode path as
/// file-backed readers.
pub struct InMemoryReader {
    detector: Detector,
    beam: Option<Beam>,
    goniometer: Option<Goniometer>,
    scan: Option<Scan>,
    static_mask: Option<Vec<Array2<bool>>>,
    compress: bool,
    frames: Vec<Option<RawFrame>>,
}

impl InMemoryReader {
    #[must_use]
    pub fn new(detector: Detector) -> Self {
        Self {
            detector,
            beam: None,
            goniometer: None,
            scan: None,
            static_mask: None,
            compress: true,
            frames: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_beam(mut self, beam: Beam) -> Self {
        self.beam = Some(beam);
        self
    }

    #[must_use]
    pub fn with_goniometer(mut self, goniometer: Goniometer) -> Self {
        self.goniometer = Some(goniometer);
        self
    }

    #[must_use]
    pub fn with_scan(mut self, scan: Scan) -> Self {
        self.scan = Some(scan);
        self
    }

    #[must_use]
    pub fn with_static_mask(mut self, masks: Vec<Array2<bool>>) -> Self {
        self.static_mask = Some(masks);
        self
    }

    /// Store subsequently pushed frames uncompressed.
    #[must_use]
    pub fn uncompressed(mut self) -> Self {
        self.compress = false;
        self
    }

    /// Appends a frame given as one `(slow, fast)` array per panel.
    ///
    /// # Errors
    /// Returns `InvalidFormat` if the panel count or a panel shape does not
    /// match the detector.
    pub fn push_frame(&mut self, panels: &[Array2<i64>]) -> Result<()> {
        if panels.len() != self.detector.num_panels() {
            return Err(Error::InvalidFormat(format!(
                "frame has {} panels, detector has {}",
                panels.len(),
                self.detector.num_panels()
            )));
        }
        let mut raw = RawFrame::default();
        for (values, panel) in panels.iter().zip(self.detector.panels()) {
            let (nx, ny) = panel.image_size();
            if values.dim() != (ny, nx) {
                return Err(Error::InvalidFormat(format!(
                    "panel '{}' expects {ny}x{nx} pixels, got {:?}",
                    panel.name(),
                    values.dim()
                )));
            }
            let flat: Vec<i64> = values.iter().copied().collect();
            raw.panels.push(if self.compress {
                RawPanel {
                    data: byte_offset::encode(&flat),
                    encoding: PixelEncoding::byte_offset(8, true)?,
                }
            } else {
                RawPanel {
                    data: flat.iter().flat_map(|v| v.to_le_bytes()).collect(),
                    encoding: PixelEncoding::new(8, true)?,
                }
            });
        }
        self.frames.push(Some(raw));
        Ok(())
    }

    /// Appends stored bytes as they are.
    pub fn push_raw_frame(&mut self, frame: RawFrame) {
        self.frames.push(Some(frame));
    }

    /// Appends a frame whose retrieval fails, as for a missing file.
    pub fn push_missing_frame(&mut self) {
        self.frames.push(None);
    }
}

impl FormatReader for InMemoryReader {
    fn format_name(&self) -> &'static str {
        "memory"
    }

    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn raw(&self, index: usize) -> Result<RawFrame> {
        match self.frames.get(index) {
            Some(Some(frame)) => Ok(frame.clone()),
            Some(None) => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("frame {index} is missing"),
            ))),
            None => Err(Error::IndexOutOfRange {
                index,
                len: self.frames.len(),
            }),
        }
    }

    fn panel_layout(&self) -> &Detector {
        &self.detector
    }

    fn beam(&self) -> Option<&Beam> {
        self.beam.as_ref()
    }

    fn goniometer(&self) -> Option<&Goniometer> {
        self.goniometer.as_ref()
    }

    fn scan(&self) -> Option<&Scan> {
        self.scan.as_ref()
    }

    fn static_mask(&self) -> Option<&[Array2<bool>]> {
        self.static_mask.as_deref()
    }
}

/// Trailing image number of a file stem, e.g. `17` for `lyso_0017.img`.
pub(crate) fn image_number_from_path(path: &Path) -> Option<i32> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// Scan over a file-per-frame sequence numbered from the first file name.
pub(crate) fn sequence_scan(
    paths: &[PathBuf],
    oscillation: (f64, f64),
    exposure_time: Option<f64>,
) -> Result<Scan> {
    let count = i32::try_from(paths.len())
        .map_err(|_| Error::InvalidFormat(format!("{} files in one sequence", paths.len())))?;
    let first = paths
        .first()
        .and_then(|path| image_number_from_path(path))
        .unwrap_or(1);
    let last = first.checked_add(count - 1).ok_or_else(|| {
        Error::InvalidFormat(format!("{count} images from image {first} overflow the numbering"))
    })?;
    let scan = Scan::new((first, last), oscillation)?;
    Ok(match exposure_time {
        Some(time) => scan.with_exposure_times(vec![time])?,
        None => scan,
    })
}
