//! miniCBF image reader (Pilatus-style header, byte-offset payload).

use std::path::{Path, PathBuf};

use difframe_codec::{byte_offset, Compression, PixelEncoding};
use difframe_core::{
    Beam, Detector, DetectorFactory, Goniometer, PxMmStrategy, Scan, SensorMaterial, Vec3,
};

use crate::options::FormatOptions;
use crate::reader::{sequence_scan, FormatReader, MappedFile, RawFrame, RawPanel};
use crate::registry::{FormatKind, ImageSource};
use crate::{Error, Result};

/// Leading bytes of every CBF file.
pub const CBF_MAGIC: &[u8] = b"###CBF: VERSION";
/// Marker preceding the binary section.
const BINARY_START: [u8; 4] = [0x0c, 0x1a, 0x04, 0xd5];

/// Metadata of a Pilatus `header_contents` block. Lengths are in metres as
/// written by the detector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PilatusHeader {
    pub detector: Option<String>,
    pub pixel_size_m: Option<(f64, f64)>,
    pub sensor: Option<(SensorMaterial, f64)>,
    pub exposure_time: Option<f64>,
    pub count_cutoff: Option<f64>,
    pub wavelength: Option<f64>,
    pub distance_m: Option<f64>,
    pub beam_xy: Option<(f64, f64)>,
    pub start_angle: Option<f64>,
    pub angle_increment: Option<f64>,
}

fn first_number(text: &str) -> Option<f64> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
        .find_map(|token| token.parse().ok())
}

fn number_pair(text: &str) -> Option<(f64, f64)> {
    let mut numbers = text
        .split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
        .filter_map(|token| token.parse::<f64>().ok());
    Some((numbers.next()?, numbers.next()?))
}

impl PilatusHeader {
    /// Parses the `# key value` lines of a header block.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut header = Self::default();
        for line in text.lines() {
            let Some(line) = line.trim().strip_prefix('#') else {
                continue;
            };
            let line = line.trim();
            let (key, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            match key.trim_end_matches(':') {
                "Detector" => header.detector = Some(rest.trim().to_string()),
                "Pixel_size" => header.pixel_size_m = number_pair(rest),
                "Exposure_time" => header.exposure_time = first_number(rest),
                "Count_cutoff" => header.count_cutoff = first_number(rest),
                "Wavelength" => header.wavelength = first_number(rest),
                "Detector_distance" => header.distance_m = first_number(rest),
                "Beam_xy" => header.beam_xy = number_pair(rest),
                "Start_angle" => header.start_angle = first_number(rest),
                "Angle_increment" => header.angle_increment = first_number(rest),
                material if rest.starts_with("sensor") => {
                    if let Some((_, thickness)) = rest.split_once("thickness") {
                        let material = SensorMaterial::from_name(material);
                        header.sensor = first_number(thickness).map(|t| (material, t));
                    }
                }
                _ => {}
            }
        }
        header
    }

    fn to_text(&self) -> String {
        let mut text = String::new();
        if let Some(detector) = &self.detector {
            text.push_str(&format!("# Detector: {detector}\n"));
        }
        if let Some((x, y)) = self.pixel_size_m {
            text.push_str(&format!("# Pixel_size {x:e} m x {y:e} m\n"));
        }
        if let Some((material, thickness)) = self.sensor {
            let name = match material {
                SensorMaterial::Si => "Silicon",
                SensorMaterial::Unknown => "Unknown",
            };
            text.push_str(&format!("# {name} sensor, thickness {thickness:.6} m\n"));
        }
        let scalars = [
            ("Exposure_time", self.exposure_time, "s"),
            ("Count_cutoff", self.count_cutoff, "counts"),
            ("Wavelength", self.wavelength, "A"),
            ("Detector_distance", self.distance_m, "m"),
            ("Start_angle", self.start_angle, "deg."),
            ("Angle_increment", self.angle_increment, "deg."),
        ];
        for (key, value, unit) in scalars {
            if let Some(value) = value {
                text.push_str(&format!("# {key} {value} {unit}\n"));
            }
        }
        if let Some((x, y)) = self.beam_xy {
            text.push_str(&format!("# Beam_xy ({x}, {y}) pixels\n"));
        }
        text
    }
}

/// MIME description of the binary section.
#[derive(Debug, Clone, PartialEq)]
struct BinarySection {
    encoding: PixelEncoding,
    image_size: (usize, usize),
    size: usize,
    /// Offset of the first payload byte.
    offset: usize,
}

fn mime_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.trim().split_once(':')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"'))
    })
}

fn mime_integer(text: &str, key: &str) -> Result<usize> {
    mime_value(text, key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::InvalidFormat(format!("CBF binary section lacks {key}")))
}

fn element_encoding(element_type: &str) -> Result<PixelEncoding> {
    let signed = element_type.starts_with("signed");
    let width = element_type
        .trim_start_matches("un")
        .trim_start_matches("signed")
        .trim();
    let word_size = match width {
        "8-bit integer" => 1,
        "16-bit integer" => 2,
        "32-bit integer" => 4,
        "64-bit integer" => 8,
        other => return Err(Error::InvalidFormat(format!("CBF element type '{other}'"))),
    };
    Ok(PixelEncoding::new(word_size, signed)?)
}

/// Text header and binary section of a miniCBF file.
fn split_file(bytes: &[u8]) -> Result<(String, BinarySection)> {
    if !bytes.starts_with(CBF_MAGIC) {
        return Err(Error::InvalidFormat("missing CBF magic".to_string()));
    }
    let start = bytes
        .windows(BINARY_START.len())
        .position(|w| w == BINARY_START)
        .ok_or_else(|| Error::InvalidFormat("CBF file has no binary section".to_string()))?;
    let text = String::from_utf8_lossy(&bytes[..start]).into_owned();
    let mime = text
        .rfind("--CIF-BINARY-FORMAT-SECTION--")
        .map_or(text.as_str(), |pos| &text[pos..]);
    if !mime.contains("x-CBF_BYTE_OFFSET") {
        return Err(Error::InvalidFormat(
            "only x-CBF_BYTE_OFFSET compression is supported".to_string(),
        ));
    }
    let element_type = mime_value(mime, "X-Binary-Element-Type").unwrap_or("signed 32-bit integer");
    let encoding = element_encoding(element_type)?.with_compression(Compression::ByteOffset);
    let section = BinarySection {
        encoding,
        image_size: (
            mime_integer(mime, "X-Binary-Size-Fastest-Dimension")?,
            mime_integer(mime, "X-Binary-Size-Second-Dimension")?,
        ),
        size: mime_integer(mime, "X-Binary-Size")?,
        offset: start + BINARY_START.len(),
    };
    let elements = mime_integer(mime, "X-Binary-Number-of-Elements")?;
    let pixels = section.image_size.0.checked_mul(section.image_size.1);
    if pixels != Some(elements) {
        return Err(Error::InvalidFormat(format!(
            "{elements} elements for a {}x{} image",
            section.image_size.0, section.image_size.1
        )));
    }
    Ok((text, section))
}

/// Reader for a sequence of miniCBF files, one frame per file.
pub struct CbfReader {
    paths: Vec<PathBuf>,
    options: FormatOptions,
    image_size: (usize, usize),
    detector: Detector,
    beam: Option<Beam>,
    goniometer: Goniometer,
    scan: Scan,
}

impl CbfReader {
    /// Opens a sequence, building models from the first file's header.
    ///
    /// # Errors
    /// Returns I/O errors, `InvalidFormat` for malformed files and model
    /// errors for invalid geometry.
    pub fn open(paths: &[PathBuf], options: &FormatOptions) -> Result<Self> {
        let first = paths
            .first()
            .ok_or_else(|| Error::InvalidFormat("empty CBF sequence".to_string()))?;
        let file = MappedFile::open(first)?;
        let (text, section) = split_file(file.as_bytes())?;
        let header = PilatusHeader::parse(&text);

        let beam = options.resolve_beam(header.wavelength, None)?;
        let detector = pilatus_detector(&header, &section, beam.as_ref())?;
        let scan = sequence_scan(
            paths,
            (
                header.start_angle.unwrap_or(0.0),
                header.angle_increment.unwrap_or(0.0),
            ),
            header.exposure_time,
        )?;

        log::info!(
            "opened CBF sequence of {} files starting at {} ({})",
            paths.len(),
            first.display(),
            header.detector.as_deref().unwrap_or("unknown detector")
        );
        Ok(Self {
            paths: paths.to_vec(),
            options: options.clone(),
            image_size: section.image_size,
            detector,
            beam,
            goniometer: Goniometer::new(Vec3::x())?,
            scan,
        })
    }
}

fn pilatus_detector(
    header: &PilatusHeader,
    section: &BinarySection,
    beam: Option<&Beam>,
) -> Result<Detector> {
    let missing = |key: &str| Error::InvalidFormat(format!("CBF header lacks {key}"));
    let (px, py) = header.pixel_size_m.ok_or_else(|| missing("Pixel_size"))?;
    let (px, py) = (px * 1000.0, py * 1000.0);
    let distance = header.distance_m.ok_or_else(|| missing("Detector_distance"))? * 1000.0;
    let (bx, by) = header.beam_xy.ok_or_else(|| missing("Beam_xy"))?;
    #[allow(clippy::cast_precision_loss)]
    let cutoff = header
        .count_cutoff
        .unwrap_or(section.encoding.max_value() as f64);

    let detector = DetectorFactory::simple(
        distance,
        (bx * px, by * py),
        "+x",
        "-y",
        (px, py),
        section.image_size,
        (-1.0, cutoff),
    )?;
    let mut panel = detector.panel(0)?.clone().with_type("SENSOR_PAD");
    if let Some((material, thickness_m)) = header.sensor {
        let thickness = thickness_m * 1000.0;
        panel = match (material, beam) {
            (SensorMaterial::Si, Some(beam)) => panel
                .with_sensor_at_wavelength(material, thickness, beam.wavelength())?
                .with_px_mm_strategy(PxMmStrategy::ParallaxCorrected),
            _ => panel.with_sensor(material, thickness, 0.0)?,
        };
    }
    Ok(Detector::new(panel))
}

impl FormatReader for CbfReader {
    fn format_name(&self) -> &'static str {
        "cbf"
    }

    fn frame_count(&self) -> usize {
        self.paths.len()
    }

    fn raw(&self, index: usize) -> Result<RawFrame> {
        let path = self.paths.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.paths.len(),
        })?;
        let file = MappedFile::open(path)?;
        let (_, section) = split_file(file.as_bytes())?;
        if section.image_size != self.image_size {
            return Err(Error::InvalidFormat(format!(
                "{} has image size {:?}, sequence has {:?}",
                path.display(),
                section.image_size,
                self.image_size
            )));
        }
        // A short payload is left to the decoder to report as corrupt.
        let end = section
            .offset
            .checked_add(section.size)
            .ok_or_else(|| {
                Error::InvalidFormat(format!(
                    "{} declares a binary size of {} bytes",
                    path.display(),
                    section.size
                ))
            })?
            .min(file.len());
        Ok(RawFrame {
            panels: vec![RawPanel {
                data: file.as_bytes()[section.offset..end].to_vec(),
                encoding: section.encoding,
            }],
        })
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
            format: FormatKind::Cbf,
            paths: self.paths.clone(),
            options: self.options.clone(),
        })
    }
}

/// Writes a miniCBF file with a signed 32-bit byte-offset payload.
///
/// # Errors
/// Returns I/O errors, or `InvalidFormat` if the pixel count does not match
/// the image size.
pub fn write_minicbf(
    path: &Path,
    header: &PilatusHeader,
    image_size: (usize, usize),
    values: &[i64],
) -> Result<()> {
    use std::io::Write as _;

    if image_size.0.checked_mul(image_size.1) != Some(values.len()) {
        return Err(Error::InvalidFormat(format!(
            "{} values for a {}x{} image",
            values.len(),
            image_size.0,
            image_size.1
        )));
    }
    let payload = byte_offset::encode(values);
    let mut text = String::from("###CBF: VERSION 1.5\n\ndata_frame\n\n");
    text.push_str("_array_data.header_convention \"PILATUS_1.2\"\n");
    text.push_str("_array_data.header_contents\n;\n");
    text.push_str(&header.to_text());
    text.push_str(";\n\n_array_data.data\n;\n--CIF-BINARY-FORMAT-SECTION--\n");
    text.push_str("Content-Type: application/octet-stream;\n");
    text.push_str("     conversions=\"x-CBF_BYTE_OFFSET\"\n");
    text.push_str("Content-Transfer-Encoding: BINARY\n");
    text.push_str(&format!("X-Binary-Size: {}\n", payload.len()));
    text.push_str("X-Binary-ID: 1\n");
    text.push_str("X-Binary-Element-Type: \"signed 32-bit integer\"\n");
    text.push_str("X-Binary-Element-Byte-Order: LITTLE_ENDIAN\n");
    text.push_str(&format!("X-Binary-Number-of-Elements: {}\n", values.len()));
    text.push_str(&format!("X-Binary-Size-Fastest-Dimension: {}\n", image_size.0));
    text.push_str(&format!("X-Binary-Size-Second-Dimension: {}\n", image_size.1));
    text.push_str("X-Binary-Size-Padding: 4095\n\n");

    let mut bytes = text.into_bytes();
    bytes.extend_from_slice(&BINARY_START);
    bytes.extend_from_slice(&payload);
    bytes.extend_from_slice(b"\n--CIF-BINARY-FORMAT-SECTION----\n;\n");
    std::fs::File::create(path)?.write_all(&bytes)?;
    Ok(())
}
