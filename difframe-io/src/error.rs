//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unrecognised file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// The format reader failed to deliver a frame.
    #[error("frame {index} unavailable: {reason}")]
    SourceUnavailable { index: usize, reason: String },

    /// Frame index outside the image set.
    #[error("frame index {index} out of range for {len} frames")]
    IndexOutOfRange { index: usize, len: usize },

    /// Experiment or experiment list failed validation.
    #[error("inconsistent experiment: {0}")]
    InconsistentExperiment(String),

    /// Geometry model error.
    #[error("core error: {0}")]
    Core(#[from] difframe_core::Error),

    /// Frame decoding error.
    #[error("codec error: {0}")]
    Codec(#[from] difframe_codec::Error),

    /// Mask computation error.
    #[error("mask error: {0}")]
    Mask(#[from] difframe_mask::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HDF5 error.
    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

impl Error {
    /// True for failures of the underlying data source.
    pub(crate) fn is_source_failure(&self) -> bool {
        match self {
            Self::Io(_) | Self::InvalidFormat(_) | Self::SourceUnavailable { .. } => true,
            #[cfg(feature = "hdf5")]
            Self::Hdf5(_) => true,
            _ => false,
        }
    }
}
