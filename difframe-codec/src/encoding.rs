//! Pixel storage descriptions and unpacking to integer values.
#![allow(clippy::cast_possible_truncation)]

use crate::byte_offset::{self, word_range, SUPPORTED_WORD_SIZES};
use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Byte order of uncompressed words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

/// Storage compression of a pixel stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Compression {
    /// Packed fixed-width words.
    #[default]
    None,
    /// Byte-offset deltas.
    ByteOffset,
}

/// How a format stores one panel's pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PixelEncoding {
    /// Word size in bytes: 1, 2, 4 or 8.
    pub word_size: usize,
    pub signed: bool,
    pub byte_order: ByteOrder,
    pub compression: Compression,
}

impl PixelEncoding {
    /// Uncompressed little-endian words.
    ///
    /// # Errors
    /// Returns `UnsupportedEncoding` for word sizes other than 1, 2, 4 or 8.
    pub fn new(word_size: usize, signed: bool) -> Result<Self> {
        if !SUPPORTED_WORD_SIZES.contains(&word_size) {
            return Err(Error::UnsupportedEncoding(format!(
                "word size {word_size} bytes"
            )));
        }
        Ok(Self {
            word_size,
            signed,
            byte_order: ByteOrder::LittleEndian,
            compression: Compression::None,
        })
    }

    /// Byte-offset compressed words.
    ///
    /// # Errors
    /// Same conditions as [`PixelEncoding::new`].
    pub fn byte_offset(word_size: usize, signed: bool) -> Result<Self> {
        Ok(Self::new(word_size, signed)?.with_compression(Compression::ByteOffset))
    }

    #[must_use]
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compression != Compression::None
    }

    /// Inclusive value range of one word.
    #[must_use]
    pub fn value_range(&self) -> (i128, i128) {
        word_range(self.word_size, self.signed)
    }

    /// Value of the largest word of this encoding, e.g. `65535` for `u16`.
    #[must_use]
    pub fn max_value(&self) -> i128 {
        self.value_range().1
    }
}

fn read_word(bytes: &[u8], encoding: &PixelEncoding) -> Option<i64> {
    let mut buf = [0_u8; 8];
    let n = encoding.word_size;
    match encoding.byte_order {
        ByteOrder::LittleEndian => buf[..n].copy_from_slice(bytes),
        ByteOrder::BigEndian => {
            for (dst, src) in buf[..n].iter_mut().zip(bytes.iter().rev()) {
                *dst = *src;
            }
        }
    }
    let raw = u64::from_le_bytes(buf);
    if encoding.signed {
        // Sign-extend from the word width.
        let shift = 64 - 8 * n as u32;
        #[allow(clippy::cast_possible_wrap)]
        let value = ((raw << shift) as i64) >> shift;
        Some(value)
    } else {
        i64::try_from(raw).ok()
    }
}

/// Unpacks `pixel_count` values from stored bytes.
///
/// # Errors
/// Returns `CorruptStream` if there are too few bytes or a value does not fit
/// the declared word, and `UnsupportedEncoding` for invalid word sizes.
pub fn unpack(bytes: &[u8], encoding: &PixelEncoding, pixel_count: usize) -> Result<Vec<i64>> {
    if !SUPPORTED_WORD_SIZES.contains(&encoding.word_size) {
        return Err(Error::UnsupportedEncoding(format!(
            "word size {} bytes",
            encoding.word_size
        )));
    }
    match encoding.compression {
        Compression::ByteOffset => {
            let values = byte_offset::decode(bytes, pixel_count, encoding.word_size)?;
            let (min, max) = encoding.value_range();
            if let Some(pixel) = values
                .iter()
                .position(|&v| i128::from(v) < min || i128::from(v) > max)
            {
                return Err(Error::corrupt(
                    0,
                    format!(
                        "pixel {pixel} value {} outside the range of the declared word",
                        values[pixel]
                    ),
                ));
            }
            Ok(values)
        }
        Compression::None => {
            let needed = pixel_count.checked_mul(encoding.word_size).ok_or_else(|| {
                Error::corrupt(
                    0,
                    format!(
                        "{pixel_count} pixels of {} bytes overflow the addressable size",
                        encoding.word_size
                    ),
                )
            })?;
            if bytes.len() < needed {
                return Err(Error::corrupt(
                    bytes.len(),
                    format!(
                        "{pixel_count} pixels of {} bytes need {needed} bytes, got {}",
                        encoding.word_size,
                        bytes.len()
                    ),
                ));
            }
            bytes[..needed]
                .chunks_exact(encoding.word_size)
                .enumerate()
                .map(|(pixel, word)| {
                    read_word(word, encoding).ok_or_else(|| {
                        Error::corrupt(
                            pixel * encoding.word_size,
                            format!("pixel {pixel} exceeds the 64-bit signed range"),
                        )
                    })
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_u16_le_and_be() {
        let bytes = [0x01, 0x00, 0xff, 0xff, 0x00, 0x01];
        let le = PixelEncoding::new(2, false).unwrap();
        assert_eq!(unpack(&bytes, &le, 3).unwrap(), vec![1, 65535, 256]);
        let be = le.with_byte_order(ByteOrder::BigEndian);
        assert_eq!(unpack(&bytes, &be, 3).unwrap(), vec![256, 65535, 1]);
    }

    #[test]
    fn test_unpack_signed_words() {
        let bytes = (-2_i32).to_le_bytes();
        let enc = PixelEncoding::new(4, true).unwrap();
        assert_eq!(unpack(&bytes, &enc, 1).unwrap(), vec![-2]);
        let enc = PixelEncoding::new(1, true).unwrap();
        assert_eq!(unpack(&[0xff, 0x7f], &enc, 2).unwrap(), vec![-1, 127]);
    }

    #[test]
    fn test_unpack_short_buffer() {
        let enc = PixelEncoding::new(4, false).unwrap();
        assert!(matches!(
            unpack(&[0, 0, 0], &enc, 1),
            Err(Error::CorruptStream { .. })
        ));
        let enc = PixelEncoding::new(8, false).unwrap();
        assert!(unpack(&[0xff; 8], &enc, 1).is_err());
    }

    #[test]
    fn test_unpack_byte_offset_checks_signedness() {
        let bytes = byte_offset::encode(&[10, -1]);
        let signed = PixelEncoding::byte_offset(4, true).unwrap();
        assert_eq!(unpack(&bytes, &signed, 2).unwrap(), vec![10, -1]);
        let unsigned = PixelEncoding::byte_offset(4, false).unwrap();
        assert!(matches!(
            unpack(&bytes, &unsigned, 2),
            Err(Error::CorruptStream { .. })
        ));
    }

    #[test]
    fn test_invalid_word_size() {
        assert!(PixelEncoding::new(3, false).is_err());
        let enc = PixelEncoding {
            word_size: 16,
            signed: false,
            byte_order: ByteOrder::LittleEndian,
            compression: Compression::None,
        };
        assert!(matches!(
            unpack(&[0; 32], &enc, 2),
            Err(Error::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn test_max_value() {
        assert_eq!(PixelEncoding::new(2, false).unwrap().max_value(), 65535);
        assert_eq!(PixelEncoding::new(4, true).unwrap().max_value(), i128::from(i32::MAX));
    }
}
