//! Format detection and reader selection.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cbf::{CbfReader, CBF_MAGIC};
use crate::options::FormatOptions;
use crate::reader::FormatReader;
use crate::smv::SmvReader;
use crate::{Error, Result};

const HDF5_SIGNATURE: &[u8] = b"\x89HDF\r\n\x1a\n";
const PROBE_BYTES: u64 = 1024;

/// Storage formats with a built-in reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Smv,
    Cbf,
    Nexus,
}

/// Everything needed to re-open the frames of an image set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    pub format: FormatKind,
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub options: FormatOptions,
}

/// Identifies the format of a file from its leading bytes.
///
/// # Errors
/// Returns I/O errors and `InvalidFormat` for unrecognised files.
pub fn detect_format<P: AsRef<Path>>(path: P) -> Result<FormatKind> {
    let path = path.as_ref();
    let mut probe = Vec::new();
    File::open(path)?.take(PROBE_BYTES).read_to_end(&mut probe)?;
    let kind = detect_bytes(&probe).ok_or_else(|| {
        Error::InvalidFormat(format!("unrecognised image format: {}", path.display()))
    })?;
    log::debug!("{} detected as {kind:?}", path.display());
    Ok(kind)
}

fn detect_bytes(probe: &[u8]) -> Option<FormatKind> {
    if probe.starts_with(HDF5_SIGNATURE) {
        return Some(FormatKind::Nexus);
    }
    if probe.starts_with(CBF_MAGIC) {
        return Some(FormatKind::Cbf);
    }
    let smv_marker = b"HEADER_BYTES=";
    if probe.first() == Some(&b'{')
        && probe.windows(smv_marker.len()).any(|w| w == smv_marker)
    {
        return Some(FormatKind::Smv);
    }
    None
}

/// Opens a reader for a file sequence, detecting the format from the
/// first file. Every file must share that format.
///
/// # Errors
/// Returns `InvalidFormat` for empty, unrecognised or mixed sequences, and
/// reader errors.
pub fn open_reader(paths: &[PathBuf], options: &FormatOptions) -> Result<Box<dyn FormatReader>> {
    let first = paths
        .first()
        .ok_or_else(|| Error::InvalidFormat("no image files given".to_string()))?;
    let format = detect_format(first)?;
    for path in &paths[1..] {
        let other = detect_format(path)?;
        if other != format {
            return Err(Error::InvalidFormat(format!(
                "{} is {other:?}, sequence is {format:?}",
                path.display()
            )));
        }
    }
    open_source(&ImageSource {
        format,
        paths: paths.to_vec(),
        options: options.clone(),
    })
}

/// Opens a reader for a known source.
///
/// # Errors
/// Returns reader errors, or `InvalidFormat` for NeXus sources when built
/// without HDF5 support.
pub fn open_source(source: &ImageSource) -> Result<Box<dyn FormatReader>> {
    match source.format {
        FormatKind::Smv => Ok(Box::new(SmvReader::open(&source.paths, &source.options)?)),
        FormatKind::Cbf => Ok(Box::new(CbfReader::open(&source.paths, &source.options)?)),
        #[cfg(feature = "hdf5")]
        FormatKind::Nexus => {
            let [path] = source.paths.as_slice() else {
                return Err(Error::InvalidFormat(
                    "a NeXus image set is read from exactly one file".to_string(),
                ));
            };
            Ok(Box::new(crate::nexus::NexusReader::open(path, &source.options)?))
        }
        #[cfg(not(feature = "hdf5"))]
        FormatKind::Nexus => Err(Error::InvalidFormat(
            "NeXus support requires the hdf5 feature".to_string(),
        )),
    }
}
