//! Byte-offset delta codec.
//!
//! Each pixel is stored as the difference from the previous pixel (the
//! running value starts at 0). A difference is written as one signed byte;
//! the byte `0x80` escapes to a little-endian `i16`, whose value `0x8000`
//! escapes to an `i32`, whose value `0x8000_0000` escapes to an `i64`.
#![allow(clippy::cast_possible_truncation)]

use crate::error::{Error, Result};

const ESCAPE_8: i8 = i8::MIN;
const ESCAPE_16: i16 = i16::MIN;
const ESCAPE_32: i32 = i32::MIN;

/// Word sizes (bytes) the decoder can range-check against.
pub const SUPPORTED_WORD_SIZES: [usize; 4] = [1, 2, 4, 8];

/// Counts of deltas written at each width.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCounts {
    pub bits8: usize,
    pub bits16: usize,
    pub bits32: usize,
    pub bits64: usize,
}

/// Range of values storable in a word of `word_size` bytes, signed or not.
pub(crate) fn word_range(word_size: usize, signed: bool) -> (i128, i128) {
    let bits = 8 * word_size as u32;
    if signed {
        (-(1_i128 << (bits - 1)), (1_i128 << (bits - 1)) - 1)
    } else {
        (0, (1_i128 << bits) - 1)
    }
}

fn check_word_size(word_size: usize) -> Result<()> {
    if SUPPORTED_WORD_SIZES.contains(&word_size) {
        Ok(())
    } else {
        Err(Error::UnsupportedEncoding(format!(
            "word size {word_size} bytes"
        )))
    }
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self, pixel: usize) -> Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self.raw.get(self.pos..end).ok_or_else(|| {
            Error::corrupt(
                self.pos,
                format!(
                    "pixel {pixel} needs {N} bytes but only {} remain",
                    self.raw.len() - self.pos
                ),
            )
        })?;
        self.pos = end;
        let mut out = [0_u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn next_delta(&mut self, pixel: usize, tiers: &mut TierCounts) -> Result<i64> {
        let d8 = i8::from_le_bytes(self.take::<1>(pixel)?);
        if d8 != ESCAPE_8 {
            tiers.bits8 += 1;
            return Ok(i64::from(d8));
        }
        let d16 = i16::from_le_bytes(self.take::<2>(pixel)?);
        if d16 != ESCAPE_16 {
            tiers.bits16 += 1;
            return Ok(i64::from(d16));
        }
        let d32 = i32::from_le_bytes(self.take::<4>(pixel)?);
        if d32 != ESCAPE_32 {
            tiers.bits32 += 1;
            return Ok(i64::from(d32));
        }
        tiers.bits64 += 1;
        Ok(i64::from_le_bytes(self.take::<8>(pixel)?))
    }
}

/// Decodes `pixel_count` values from a byte-offset stream.
///
/// Decoding stops after `pixel_count` values; trailing bytes (such as the
/// padding CBF writers append) are ignored. Every value must fit a word of
/// `word_size` bytes, signed or unsigned.
///
/// # Errors
/// Returns `CorruptStream` if the stream ends early or a value overflows the
/// word, and `UnsupportedEncoding` for word sizes other than 1, 2, 4 or 8.
pub fn decode(raw: &[u8], pixel_count: usize, word_size: usize) -> Result<Vec<i64>> {
    check_word_size(word_size)?;
    let (signed_min, _) = word_range(word_size, true);
    let (_, unsigned_max) = word_range(word_size, false);

    let mut cursor = Cursor { raw, pos: 0 };
    let mut tiers = TierCounts::default();
    // every pixel takes at least one byte
    let mut values = Vec::with_capacity(pixel_count.min(raw.len()));
    let mut current: i64 = 0;
    for pixel in 0..pixel_count {
        let start = cursor.pos;
        current = current.wrapping_add(cursor.next_delta(pixel, &mut tiers)?);
        let wide = i128::from(current);
        if wide < signed_min || wide > unsigned_max {
            return Err(Error::corrupt(
                start,
                format!("pixel {pixel} value {current} overflows a {word_size}-byte word"),
            ));
        }
        values.push(current);
    }
    log::trace!(
        "byte-offset decode: {} pixels from {} of {} bytes, tiers {:?}",
        pixel_count,
        cursor.pos,
        raw.len(),
        tiers
    );
    Ok(values)
}

/// Encodes values as a byte-offset stream.
#[must_use]
pub fn encode(values: &[i64]) -> Vec<u8> {
    encode_with_stats(values).0
}

/// Encodes values and reports how many deltas used each width.
#[must_use]
pub fn encode_with_stats(values: &[i64]) -> (Vec<u8>, TierCounts) {
    let mut out = Vec::with_capacity(values.len());
    let mut tiers = TierCounts::default();
    let mut previous: i64 = 0;
    for &value in values {
        let delta = value.wrapping_sub(previous);
        previous = value;

        if let Ok(d8) = i8::try_from(delta) {
            if d8 != ESCAPE_8 {
                out.extend_from_slice(&d8.to_le_bytes());
                tiers.bits8 += 1;
                continue;
            }
        }
        out.extend_from_slice(&ESCAPE_8.to_le_bytes());

        if let Ok(d16) = i16::try_from(delta) {
            if d16 != ESCAPE_16 {
                out.extend_from_slice(&d16.to_le_bytes());
                tiers.bits16 += 1;
                continue;
            }
        }
        out.extend_from_slice(&ESCAPE_16.to_le_bytes());

        if let Ok(d32) = i32::try_from(delta) {
            if d32 != ESCAPE_32 {
                out.extend_from_slice(&d32.to_le_bytes());
                tiers.bits32 += 1;
                continue;
            }
        }
        out.extend_from_slice(&ESCAPE_32.to_le_bytes());
        out.extend_from_slice(&delta.to_le_bytes());
        tiers.bits64 += 1;
    }
    (out, tiers)
}
