//! Error types for difframe-core.

use thiserror::Error;

/// Result type alias for geometry and calibration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for geometry and calibration operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Pixel or millimetre query outside the valid domain of a panel.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// Frame or scan-point index outside the declared range.
    #[error("index {index} outside range [{first}, {last}]")]
    IndexOutOfRange {
        /// Requested index (may be fractional for scan positions).
        index: f64,
        /// First valid index.
        first: i64,
        /// Last valid index (inclusive).
        last: i64,
    },

    /// Cyclic or otherwise malformed detector hierarchy.
    #[error("invalid detector hierarchy: {0}")]
    InvalidHierarchy(String),

    /// A model value failed validation at construction time.
    #[error("invalid model: {0}")]
    InvalidModel(String),
}

impl Error {
    pub(crate) fn index_out_of_range(index: f64, first: i64, last: i64) -> Self {
        Self::IndexOutOfRange { index, first, last }
    }
}
