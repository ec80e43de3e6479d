//! NeXus/NXmx reader for single-module detectors.

use std::path::{Path, PathBuf};

use difframe_codec::PixelEncoding;
use difframe_core::{
    Beam, Detector, DetectorFactory, Goniometer, PxMmStrategy, Scan, SensorMaterial, Vec3,
};
use hdf5::types::{VarLenAscii, VarLenUnicode};
use hdf5::{Dataset, File, Group};
use ndarray::{s, Array2};

use crate::options::FormatOptions;
use crate::reader::{FormatReader, RawFrame, RawPanel};
use crate::registry::{FormatKind, ImageSource};
use crate::{Error, Result};

const DATA_PATH: &str = "entry/data/data";
const DETECTOR_PATH: &str = "entry/instrument/detector";
const BEAM_PATHS: [&str; 2] = ["entry/instrument/beam", "entry/sample/beam"];
const OMEGA_PATH: &str = "entry/sample/transformations/omega";

/// Reader for frames stacked in `/entry/data/data`.
pub struct NexusReader {
    path: PathBuf,
    options: FormatOptions,
    frames: usize,
    image_size: (usize, usize),
    bit_depth: Option<u32>,
    detector: Detector,
    beam: Option<Beam>,
    goniometer: Goniometer,
    scan: Scan,
    static_mask: Option<Vec<Array2<bool>>>,
}

fn read_string(dataset: &Dataset) -> Option<String> {
    dataset
        .read_scalar::<VarLenUnicode>()
        .map(|s| s.to_string())
        .or_else(|_| dataset.read_scalar::<VarLenAscii>().map(|s| s.to_string()))
        .ok()
}

fn units(dataset: &Dataset) -> Option<String> {
    let attr = dataset.attr("units").ok()?;
    attr.read_scalar::<VarLenUnicode>()
        .map(|s| s.to_string())
        .or_else(|_| attr.read_scalar::<VarLenAscii>().map(|s| s.to_string()))
        .ok()
}

fn optional_f64(group: &Group, name: &str) -> Result<Option<f64>> {
    match group.dataset(name) {
        Ok(dataset) => Ok(Some(dataset.read_scalar::<f64>()?)),
        Err(_) => Ok(None),
    }
}

/// Scalar length converted to millimetres (SI metres by default).
fn length_mm(group: &Group, name: &str) -> Result<Option<f64>> {
    let Ok(dataset) = group.dataset(name) else {
        return Ok(None);
    };
    let value = dataset.read_scalar::<f64>()?;
    let scale = match units(&dataset).as_deref().map(str::trim) {
        Some("mm") => 1.0,
        Some("um" | "microns" | "micrometre" | "micrometer") => 1e-3,
        Some("m") | None => 1000.0,
        Some(other) => {
            return Err(Error::InvalidFormat(format!("unsupported length unit '{other}'")));
        }
    };
    Ok(Some(value * scale))
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| Error::InvalidFormat(format!("NeXus detector lacks {name}")))
}

/// Remaps the two largest readout values to the `-1` and `-2` sentinels.
///
/// 32-bit readouts are signed, so their top is `2^31`.
pub(crate) fn remap_sentinels(values: &mut Array2<i64>, bit_depth: u32) {
    let top = if bit_depth >= 32 { 1_i64 << 31 } else { 1_i64 << bit_depth };
    values.mapv_inplace(|v| {
        if v == top - 1 {
            -1
        } else if v == top - 2 {
            -2
        } else {
            v
        }
    });
}

impl NexusReader {
    /// Opens an NXmx file.
    ///
    /// # Errors
    /// Returns HDF5 errors and `InvalidFormat` for missing data or geometry.
    pub fn open<P: AsRef<Path>>(path: P, options: &FormatOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let data = file.dataset(DATA_PATH)?;
        let &[frames, ny, nx] = data.shape().as_slice() else {
            return Err(Error::InvalidFormat(format!(
                "{DATA_PATH} must be 3-dimensional, has shape {:?}",
                data.shape()
            )));
        };

        let mut wavelength = None;
        for beam_path in BEAM_PATHS {
            if let Ok(group) = file.group(beam_path) {
                wavelength = optional_f64(&group, "incident_wavelength")?;
                if wavelength.is_some() {
                    break;
                }
            }
        }
        let beam = options.resolve_beam(wavelength, None)?;

        let group = file.group(DETECTOR_PATH)?;
        let bit_depth = match group.dataset("bit_depth_readout") {
            Ok(dataset) => Some(dataset.read_scalar::<u32>()?),
            Err(_) => None,
        };
        let detector = nexus_detector(&group, (nx, ny), bit_depth, beam.as_ref())?;
        let static_mask = match group.dataset("pixel_mask") {
            Ok(dataset) => {
                let mask = dataset.read_2d::<u32>()?;
                Some(vec![mask.mapv(|m| m == 0)])
            }
            Err(_) => None,
        };

        let (axis, oscillation) = match file.dataset(OMEGA_PATH) {
            Ok(omega) => {
                let axis = omega
                    .attr("vector")
                    .and_then(|attr| attr.read_raw::<f64>())
                    .ok()
                    .filter(|v| v.len() == 3)
                    .map_or_else(Vec3::x, |v| Vec3::new(v[0], v[1], v[2]));
                let angles = omega.read_raw::<f64>()?;
                let start = angles.first().copied().unwrap_or(0.0);
                let width = match angles.as_slice() {
                    [a, b, ..] => b - a,
                    _ => 0.0,
                };
                (axis, (start, width))
            }
            Err(_) => (Vec3::x(), (0.0, 0.0)),
        };
        let last = i32::try_from(frames)
            .map_err(|_| Error::InvalidFormat(format!("{frames} frames")))?;
        let mut scan = Scan::new((1, last), oscillation)?;
        if let Some(time) = optional_f64(&group, "count_time")? {
            scan = scan.with_exposure_times(vec![time])?;
        }

        log::info!(
            "opened NeXus file {} with {frames} frames of {nx}x{ny}",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            options: options.clone(),
            frames,
            image_size: (nx, ny),
            bit_depth,
            detector,
            beam,
            goniometer: Goniometer::new(axis)?,
            scan,
            static_mask,
        })
    }
}

fn nexus_detector(
    group: &Group,
    image_size: (usize, usize),
    bit_depth: Option<u32>,
    beam: Option<&Beam>,
) -> Result<Detector> {
    let px = required(length_mm(group, "x_pixel_size")?, "x_pixel_size")?;
    let py = required(length_mm(group, "y_pixel_size")?, "y_pixel_size")?;
    let distance = required(length_mm(group, "distance")?, "distance")?;
    let bx = required(optional_f64(group, "beam_center_x")?, "beam_center_x")?;
    let by = required(optional_f64(group, "beam_center_y")?, "beam_center_y")?;
    #[allow(clippy::cast_precision_loss)]
    let overload = match optional_f64(group, "saturation_value")? {
        Some(value) => value,
        None => bit_depth.map_or(f64::from(i32::MAX), |bits| {
            ((1_i64 << bits.min(31)) - 3) as f64
        }),
    };

    let detector = DetectorFactory::simple(
        distance,
        (bx * px, by * py),
        "+x",
        "-y",
        (px, py),
        image_size,
        (-1.0, overload),
    )?;
    let mut panel = detector.panel(0)?.clone().with_type("SENSOR_PAD");
    if let Some(thickness) = length_mm(group, "sensor_thickness")? {
        let material = group
            .dataset("sensor_material")
            .ok()
            .and_then(|d| read_string(&d))
            .map_or(SensorMaterial::Unknown, |name| SensorMaterial::from_name(&name));
        panel = match (material, beam) {
            (SensorMaterial::Si, Some(beam)) => panel
                .with_sensor_at_wavelength(material, thickness, beam.wavelength())?
                .with_px_mm_strategy(PxMmStrategy::ParallaxCorrected),
            _ => panel.with_sensor(material, thickness, 0.0)?,
        };
    }
    Ok(Detector::new(panel))
}

impl FormatReader for NexusReader {
    fn format_name(&self) -> &'static str {
        "nexus"
    }

    fn frame_count(&self) -> usize {
        self.frames
    }

    fn raw(&self, index: usize) -> Result<RawFrame> {
        if index >= self.frames {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.frames,
            });
        }
        let file = File::open(&self.path)?;
        let mut values: Array2<i64> = file.dataset(DATA_PATH)?.read_slice_2d(s![index, .., ..])?;
        if values.dim() != (self.image_size.1, self.image_size.0) {
            return Err(Error::InvalidFormat(format!(
                "frame {index} has shape {:?}",
                values.dim()
            )));
        }
        if let Some(bits) = self.bit_depth {
            remap_sentinels(&mut values, bits);
        }
        Ok(RawFrame {
            panels: vec![RawPanel {
                data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
                encoding: PixelEncoding::new(8, true)?,
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

    fn static_mask(&self) -> Option<&[Array2<bool>]> {
        self.static_mask.as_deref()
    }

    fn source(&self) -> Option<ImageSource> {
        Some(ImageSource {
            format: FormatKind::Nexus,
            paths: vec![self.path.clone()],
            options: self.options.clone(),
        })
    }
}
