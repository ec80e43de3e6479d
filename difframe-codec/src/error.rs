//! Codec error types.

use thiserror::Error;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Codec error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The byte stream cannot be decoded into the requested pixels.
    #[error("corrupt stream at byte {offset}: {reason}")]
    CorruptStream {
        /// Byte offset at which decoding failed.
        offset: usize,
        /// What went wrong.
        reason: String,
    },

    /// Word size or compression not handled by the codec.
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
}

impl Error {
    pub(crate) fn corrupt(offset: usize, reason: impl Into<String>) -> Self {
        Self::CorruptStream {
            offset,
            reason: reason.into(),
        }
    }
}
