//! difframe-codec: Decompression and unpacking of raw detector frames.
//!
//! Provides the byte-offset delta codec used by CBF-family formats and the
//! [`PixelEncoding`] description readers use to hand raw bytes to the
//! image pipeline.
//!

pub mod byte_offset;
mod encoding;
mod error;

pub use byte_offset::{decode, encode, encode_with_stats, TierCounts};
pub use encoding::{unpack, ByteOrder, Compression, PixelEncoding};
pub use error::{Error, Result};
