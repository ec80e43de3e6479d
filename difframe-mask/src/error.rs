//! Masking error types.

use thiserror::Error;

/// Result type for masking operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Masking error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Pixel data or static mask does not match the panel shape.
    #[error("shape mismatch on panel {panel}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        panel: usize,
        /// Expected `(rows, columns)`.
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// A region definition is invalid or cannot be evaluated.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// Geometry error.
    #[error("geometry error: {0}")]
    Core(#[from] difframe_core::Error),

    /// JSON configuration error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
