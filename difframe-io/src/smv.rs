//! SMV (ADSC-style) image reader.
//!
//! An SMV file starts with a brace-delimited text header of `KEY=VALUE;`
//! records, padded to `HEADER_BYTES`, followed by uncompressed words.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use difframe_codec::{ByteOrder, PixelEncoding};
use difframe_core::{Beam, Detector, DetectorFactory, Goniometer, Scan, Vec3};

use crate::options::FormatOptions;
use crate::reader::{sequence_scan, FormatReader, MappedFile, RawFrame, RawPanel};
use crate::registry::{FormatKind, ImageSource};
use crate::{Error, Result};

/// Serial number of the ADSC detector recording DENZO beam centres.
const DENZO_SERIAL: i64 = 442;
const DENZO_PEDESTAL: f64 = 40.0;

/// Parsed SMV header.
#[derive(Debug, Clone, PartialEq)]
pub struct SmvHeader {
    fields: BTreeMap<String, String>,
}

impl SmvHeader {
    /// Parses the header at the start of `bytes`.
    ///
    /// # Errors
    /// Returns `InvalidFormat` if the header is not brace-delimited or lacks
    /// `HEADER_BYTES`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.first() != Some(&b'{') {
            return Err(Error::InvalidFormat("SMV header must start with '{'".to_string()));
        }
        let end = bytes
            .iter()
            .position(|&b| b == b'}')
            .ok_or_else(|| Error::InvalidFormat("unterminated SMV header".to_string()))?;
        let text = String::from_utf8_lossy(&bytes[1..end]);
        let fields = text
            .split(';')
            .filter_map(|record| {
                let (key, value) = record.split_once('=')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        let header = Self { fields };
        header.header_bytes()?;
        Ok(header)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// # Errors
    /// Returns `InvalidFormat` if the key is missing or not a number.
    pub fn number(&self, key: &str) -> Result<f64> {
        self.optional_number(key)?
            .ok_or_else(|| Error::InvalidFormat(format!("SMV header lacks {key}")))
    }

    /// # Errors
    /// Returns `InvalidFormat` if the key is present but not a number.
    pub fn optional_number(&self, key: &str) -> Result<Option<f64>> {
        self.get(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| Error::InvalidFormat(format!("SMV {key}={value} is not a number")))
            })
            .transpose()
    }

    fn integer(&self, key: &str) -> Result<usize> {
        let value = self
            .get(key)
            .ok_or_else(|| Error::InvalidFormat(format!("SMV header lacks {key}")))?;
        value
            .parse()
            .map_err(|_| Error::InvalidFormat(format!("SMV {key}={value} is not an integer")))
    }

    /// Size of the padded header in bytes.
    ///
    /// # Errors
    /// Returns `InvalidFormat` if `HEADER_BYTES` is missing.
    pub fn header_bytes(&self) -> Result<usize> {
        self.integer("HEADER_BYTES")
    }

    /// `(fast, slow)` image size.
    ///
    /// # Errors
    /// Returns `InvalidFormat` if `SIZE1` or `SIZE2` is missing.
    pub fn image_size(&self) -> Result<(usize, usize)> {
        Ok((self.integer("SIZE1")?, self.integer("SIZE2")?))
    }

    /// # Errors
    /// Returns `InvalidFormat` for unsupported `TYPE` or `BYTE_ORDER` values.
    pub fn encoding(&self) -> Result<PixelEncoding> {
        let (word_size, signed) = match self.get("TYPE").unwrap_or("unsigned_short") {
            "unsigned_short" => (2, false),
            "short" | "signed_short" => (2, true),
            "unsigned_int" | "unsigned_long" => (4, false),
            "int" | "long" | "signed_int" | "signed_long" => (4, true),
            other => return Err(Error::InvalidFormat(format!("SMV TYPE={other}"))),
        };
        let byte_order = match self.get("BYTE_ORDER").unwrap_or("little_endian") {
            "little_endian" => ByteOrder::LittleEndian,
            "big_endian" => ByteOrder::BigEndian,
            other => return Err(Error::InvalidFormat(format!("SMV BYTE_ORDER={other}"))),
        };
        Ok(PixelEncoding::new(word_size, signed)?.with_byte_order(byte_order))
    }

    /// True for the ADSC instrument recording DENZO beam centres.
    #[must_use]
    pub fn is_denzo_variant(&self) -> bool {
        self.get("DETECTOR_SN")
            .and_then(|sn| sn.parse::<i64>().ok())
            .is_some_and(|sn| sn == DENZO_SERIAL)
    }
}

/// Reader for a sequence of SMV files, one frame per file.
pub struct SmvReader {
    paths: Vec<PathBuf>,
    options: FormatOptions,
    image_size: (usize, usize),
    detector: Detector,
    beam: Option<Beam>,
    goniometer: Goniometer,
    scan: Scan,
}

impl SmvReader {
    /// Opens a sequence, building models from the first file's header.
    ///
    /// # Errors
    /// Returns I/O errors, `InvalidFormat` for malformed headers and model
    /// errors for invalid geometry.
    pub fn open(paths: &[PathBuf], options: &FormatOptions) -> Result<Self> {
        let first = paths
            .first()
            .ok_or_else(|| Error::InvalidFormat("empty SMV sequence".to_string()))?;
        let header = SmvHeader::parse(MappedFile::open(first)?.as_bytes())?;

        let detector = adsc_detector(&header)?;
        let beam = options.resolve_beam(header.optional_number("WAVELENGTH")?, None)?;
        let start = match header.optional_number("OSC_START")? {
            Some(angle) => angle,
            None => header.optional_number("PHI")?.unwrap_or(0.0),
        };
        let width = header.optional_number("OSC_RANGE")?.unwrap_or(0.0);
        let scan = sequence_scan(paths, (start, width), header.optional_number("TIME")?)?;

        log::info!(
            "opened SMV sequence of {} files starting at {}",
            paths.len(),
            first.display()
        );
        Ok(Self {
            paths: paths.to_vec(),
            options: options.clone(),
            image_size: header.image_size()?,
            detector,
            beam,
            goniometer: Goniometer::new(Vec3::x())?,
            scan,
        })
    }

    fn read_file(&self, path: &Path) -> Result<RawFrame> {
        let file = MappedFile::open(path)?;
        let header = SmvHeader::parse(file.as_bytes())?;
        if header.image_size()? != self.image_size {
            return Err(Error::InvalidFormat(format!(
                "{} has image size {:?}, sequence has {:?}",
                path.display(),
                header.image_size()?,
                self.image_size
            )));
        }
        let encoding = header.encoding()?;
        let len = self
            .image_size
            .0
            .checked_mul(self.image_size.1)
            .and_then(|pixels| pixels.checked_mul(encoding.word_size))
            .ok_or_else(|| {
                Error::InvalidFormat(format!(
                    "{} declares an image of {:?} pixels",
                    path.display(),
                    self.image_size
                ))
            })?;
        let data = file.slice(header.header_bytes()?, len)?.to_vec();
        Ok(RawFrame {
            panels: vec![RawPanel { data, encoding }],
        })
    }
}

/// Single-panel ADSC detector with the beam centre in the Mosflm frame.
fn adsc_detector(header: &SmvHeader) -> Result<Detector> {
    let (beam_x, beam_y, pedestal) = if header.is_denzo_variant() {
        (
            header.number("DENZO_X_BEAM")?,
            header.number("DENZO_Y_BEAM")?,
            DENZO_PEDESTAL,
        )
    } else {
        (
            header.number("BEAM_CENTER_X")?,
            header.number("BEAM_CENTER_Y")?,
            header.optional_number("IMAGE_PEDESTAL")?.unwrap_or(0.0),
        )
    };
    let pixel_size = header.number("PIXEL_SIZE")?;
    #[allow(clippy::cast_precision_loss)]
    let max_value = header.encoding()?.max_value() as f64;
    let detector = DetectorFactory::simple(
        header.number("DISTANCE")?,
        (beam_y, beam_x),
        "+x",
        "-y",
        (pixel_size, pixel_size),
        header.image_size()?,
        (0.0, max_value - pedestal),
    )?;
    let panel = detector
        .panel(0)?
        .clone()
        .with_type("SENSOR_CCD")
        .with_gain(header.optional_number("GAIN")?.unwrap_or(1.0))
        .with_pedestal(pedestal);
    Ok(Detector::new(panel))
}

impl FormatReader for SmvReader {
    fn format_name(&self) -> &'static str {
        "smv"
    }

    fn frame_count(&self) -> usize {
        self.paths.len()
    }

    fn raw(&self, index: usize) -> Result<RawFrame> {
        let path = self.paths.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.paths.len(),
        })?;
        self.read_file(path)
    }

    fn panel_layout(&self) -> &Detector {
        &self.detector
    }

    fn beam(&self) -> Option<&Beam> {
        self.beam.as_ref()
    }

    fn goniometer(&self) -> Option<&Goniometer> {
        Some(&self.goniometer)
    }

    fn scan(&self) -> Option<&Scan> {
        Some(&self.scan)
    }

    fn source(&self) -> Option<ImageSource> {
        Some(ImageSource {
            format: FormatKind::Smv,
            paths: self.paths.clone(),
            options: self.options.clone(),
        })
    }
}

/// Writes a little-endian `unsigned_short` SMV file with extra header
/// records.
///
/// # Errors
/// Returns I/O errors, or `InvalidFormat` if the pixel count does not match
/// the image size.
pub fn write_smv(
    path: &Path,
    records: &[(&str, String)],
    image_size: (usize, usize),
    pixels: &[u16],
) -> Result<()> {
    use std::io::Write as _;

    const HEADER_BYTES: usize = 512;
    if image_size.0.checked_mul(image_size.1) != Some(pixels.len()) {
        return Err(Error::InvalidFormat(format!(
            "{} pixels for a {}x{} image",
            pixels.len(),
            image_size.0,
            image_size.1
        )));
    }
    let mut header = format!(
        concat!(
            "{{\nHEADER_BYTES={:5};\nDIM=2;\nBYTE_ORDER=little_endian;\n",
            "TYPE=unsigned_short;\nSIZE1={};\nSIZE2={};\n",
        ),
        HEADER_BYTES, image_size.0, image_size.1
    );
    for (key, value) in records {
        header.push_str(&format!("{key}={value};\n"));
    }
    header.push_str("}\n");
    let mut bytes = header.into_bytes();
    if bytes.len() > HEADER_BYTES {
        return Err(Error::InvalidFormat("SMV header records exceed 512 bytes".to_string()));
    }
    bytes.resize(HEADER_BYTES, b' ');
    for value in pixels {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    std::fs::File::create(path)?.write_all(&bytes)?;
    Ok(())
}
