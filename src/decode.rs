//! Raw word decoding
//!
//! [`decode`] turns the words of one register into a typed [`Value`]. The steps
//! always run in the same order: reorder words/bytes, reassemble, reinterpret
//! (two's complement or IEEE-754), bit extraction, scale, round. [`encode`] is
//! the inverse used for writes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DecodeError, EncodeError};
use crate::register::{BitExtraction, Encoding, Format, WordOrder};

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
            Value::Int(n) => Some(n as f64),
            Value::UInt(n) => Some(n as f64),
            Value::Float(f) => Some(f),
            Value::Text(_) => None,
        }
    }

    /// Integer view of the value; floats qualify only without a fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Bool(b) => Some(i64::from(b)),
            Value::Int(n) => Some(n),
            Value::UInt(n) => i64::try_from(n).ok(),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => Some(f as i64),
            Value::Float(_) | Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::UInt(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Integer after reinterpretation and bit extraction, before scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Integer {
    Unsigned(u64),
    Signed(i64),
}

impl Integer {
    fn as_f64(self) -> f64 {
        match self {
            Integer::Unsigned(n) => n as f64,
            Integer::Signed(n) => n as f64,
        }
    }

    fn is_nonzero(self) -> bool {
        match self {
            Integer::Unsigned(n) => n != 0,
            Integer::Signed(n) => n != 0,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Integer::Unsigned(n) => Value::UInt(n),
            Integer::Signed(n) => Value::Int(n),
        }
    }
}

/// Decode the words of a member register out of a batch response.
pub fn decode_member(
    batch: &[u16],
    batch_start: u16,
    address: u16,
    format: &Format,
) -> Result<Value, DecodeError> {
    let offset = usize::from(address.wrapping_sub(batch_start));
    let count = usize::from(format.word_count);
    let words = batch
        .get(offset..offset + count)
        .ok_or(DecodeError::WordCount {
            expected: count,
            actual: batch.len().saturating_sub(offset),
        })?;
    decode(words, format)
}

/// Decode exactly `format.word_count` words.
pub fn decode(words: &[u16], format: &Format) -> Result<Value, DecodeError> {
    let expected = usize::from(format.word_count);
    if words.len() != expected {
        return Err(DecodeError::WordCount {
            expected,
            actual: words.len(),
        });
    }
    let ordered = reorder(words, format.word_order);
    let width = format.width_bits;
    match format.encoding {
        Encoding::Ascii => decode_ascii(&ordered),
        Encoding::Float => {
            let raw = assemble(&ordered);
            let value = if width == 32 {
                f64::from(f32::from_bits(raw as u32))
            } else {
                f64::from_bits(raw)
            };
            if !value.is_finite() {
                return Err(DecodeError::NotFinite);
            }
            Ok(Value::Float(finish(value, format)))
        }
        Encoding::Boolean => {
            let raw = assemble(&ordered);
            let truth = match format.bit_extraction {
                Some(extraction) => extract(raw, width, extraction, false).is_nonzero(),
                None => raw & 1 == 1,
            };
            Ok(Value::Bool(truth))
        }
        Encoding::UInt | Encoding::Int => {
            let raw = assemble(&ordered);
            let signed = format.encoding == Encoding::Int;
            let integer = match format.bit_extraction {
                Some(extraction) => extract(raw, width, extraction, signed),
                None if signed => Integer::Signed(sign_extend(raw, width)),
                None => Integer::Unsigned(raw),
            };
            if format.is_integral() {
                Ok(integer.into_value())
            } else {
                Ok(Value::Float(finish(integer.as_f64(), format)))
            }
        }
    }
}

/// Apply byte and word swapping. Applying it twice restores the input.
pub fn reorder(words: &[u16], order: WordOrder) -> Vec<u16> {
    let mut out: Vec<u16> = if order.swaps_bytes() {
        words.iter().map(|w| w.swap_bytes()).collect()
    } else {
        words.to_vec()
    };
    if order.swaps_words() {
        out.reverse();
    }
    out
}

fn assemble(words: &[u16]) -> u64 {
    words
        .iter()
        .fold(0u64, |acc, &word| (acc << 16) | u64::from(word))
}

fn split(raw: u64, word_count: u16) -> Vec<u16> {
    (0..word_count)
        .rev()
        .map(|i| (raw >> (u32::from(i) * 16)) as u16)
        .collect()
}

fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn sign_extend(raw: u64, width: u32) -> i64 {
    if width >= 64 {
        return raw as i64;
    }
    let shift = 64 - width;
    ((raw << shift) as i64) >> shift
}

fn rotate_right(raw: u64, n: u32, width: u32) -> u64 {
    if n == 0 {
        return raw;
    }
    let mask = width_mask(width);
    ((raw >> n) | (raw << (width - n))) & mask
}

fn rotate_left(raw: u64, n: u32, width: u32) -> u64 {
    if n == 0 {
        return raw;
    }
    rotate_right(raw, width - n, width)
}

fn extract(raw: u64, width: u32, extraction: BitExtraction, signed: bool) -> Integer {
    match extraction {
        BitExtraction::Mask(mask) => Integer::Unsigned(raw & mask),
        BitExtraction::Bit(index) => Integer::Unsigned((raw >> index) & 1),
        BitExtraction::Range { start, len } => {
            Integer::Unsigned((raw >> start) & width_mask(len))
        }
        BitExtraction::Shift(n) if signed => Integer::Signed(sign_extend(raw, width) >> n),
        BitExtraction::Shift(n) => Integer::Unsigned(raw >> n),
        BitExtraction::Rotate(n) => {
            let rotated = rotate_right(raw, n, width);
            if signed {
                Integer::Signed(sign_extend(rotated, width))
            } else {
                Integer::Unsigned(rotated)
            }
        }
    }
}

fn finish(value: f64, format: &Format) -> f64 {
    let scaled = value * format.scale;
    match format.effective_precision() {
        Some(decimals) => round_to(scaled, decimals),
        None => scaled,
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn decode_ascii(words: &[u16]) -> Result<Value, DecodeError> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    if let Some(&bad) = bytes.iter().find(|b| !b.is_ascii()) {
        return Err(DecodeError::NonAscii(bad));
    }
    let text: String = bytes.into_iter().map(char::from).collect();
    Ok(Value::Text(text.trim_end_matches(['\0', ' ']).to_string()))
}

/// Whether writing `format` needs the register's current words.
pub fn needs_current(format: &Format) -> bool {
    matches!(
        format.bit_extraction,
        Some(BitExtraction::Mask(_) | BitExtraction::Bit(_) | BitExtraction::Range { .. })
    )
}

/// Encode `value` into register words, undoing scale and bit extraction.
///
/// `current` holds the register's words as read from the device and is only
/// consulted when [`needs_current`] is true.
pub fn encode(
    value: &Value,
    format: &Format,
    current: Option<&[u16]>,
) -> Result<Vec<u16>, EncodeError> {
    let width = format.width_bits;
    let raw = match format.encoding {
        Encoding::Ascii => return encode_ascii(value, format),
        Encoding::Float => {
            let x = value
                .as_f64()
                .ok_or(EncodeError::WrongType { expected: "number" })?
                / format.scale;
            if !x.is_finite() {
                return Err(EncodeError::OutOfRange { value: x });
            }
            if width == 32 {
                let narrowed = x as f32;
                if !narrowed.is_finite() {
                    return Err(EncodeError::OutOfRange { value: x });
                }
                u64::from(narrowed.to_bits())
            } else {
                x.to_bits()
            }
        }
        Encoding::Boolean => {
            let truth = match value {
                Value::Bool(b) => *b,
                other => {
                    other
                        .as_f64()
                        .ok_or(EncodeError::WrongType { expected: "boolean" })?
                        != 0.0
                }
            };
            let field = match format.bit_extraction {
                Some(BitExtraction::Mask(mask)) if truth => mask,
                _ => u64::from(truth),
            };
            place(field, i128::from(truth), format, current)?
        }
        Encoding::UInt | Encoding::Int => {
            let x = value
                .as_f64()
                .ok_or(EncodeError::WrongType { expected: "number" })?;
            let n = (x / format.scale).round();
            // No register is wider than 64 bits; this also keeps the cast exact.
            if !n.is_finite() || n.abs() >= 2f64.powi(64) {
                return Err(EncodeError::OutOfRange { value: x });
            }
            let n = n as i128;
            place(n as u64, n, format, current).map_err(|e| match e {
                EncodeError::OutOfRange { .. } => EncodeError::OutOfRange { value: x },
                other => other,
            })?
        }
    };
    Ok(reorder(&split(raw, format.word_count), format.word_order))
}

/// Position an integer `n` inside the register according to the bit extraction.
fn place(
    field: u64,
    n: i128,
    format: &Format,
    current: Option<&[u16]>,
) -> Result<u64, EncodeError> {
    let width = format.width_bits;
    let signed = format.encoding == Encoding::Int;
    let out_of_range = || EncodeError::OutOfRange { value: n as f64 };
    let current_raw = || -> Result<u64, EncodeError> {
        let words = current.ok_or(EncodeError::MissingCurrent)?;
        if words.len() != usize::from(format.word_count) {
            return Err(EncodeError::MissingCurrent);
        }
        Ok(assemble(&reorder(words, format.word_order)))
    };
    let fits = |v: i128, bits: u32, signed: bool| -> bool {
        if signed {
            let half = 1i128 << (bits - 1);
            (-half..half).contains(&v)
        } else {
            (0..(1i128 << bits)).contains(&v)
        }
    };
    match format.bit_extraction {
        None => {
            if !fits(n, width, signed) {
                return Err(out_of_range());
            }
            Ok((n as u64) & width_mask(width))
        }
        Some(BitExtraction::Mask(mask)) => {
            if n < 0 || field & !mask != 0 {
                return Err(out_of_range());
            }
            Ok((current_raw()? & !mask) | field)
        }
        Some(BitExtraction::Bit(index)) => {
            if !(0..=1).contains(&n) {
                return Err(out_of_range());
            }
            let bit = 1u64 << index;
            Ok((current_raw()? & !bit) | ((n as u64) << index))
        }
        Some(BitExtraction::Range { start, len }) => {
            if !fits(n, len, false) {
                return Err(out_of_range());
            }
            let mask = width_mask(len) << start;
            Ok((current_raw()? & !mask) | ((n as u64) << start))
        }
        Some(BitExtraction::Shift(k)) => {
            if !fits(n, width - k, signed) {
                return Err(out_of_range());
            }
            Ok(((n << k) as u64) & width_mask(width))
        }
        Some(BitExtraction::Rotate(k)) => {
            if !fits(n, width, signed) {
                return Err(out_of_range());
            }
            Ok(rotate_left((n as u64) & width_mask(width), k, width))
        }
    }
}

fn encode_ascii(value: &Value, format: &Format) -> Result<Vec<u16>, EncodeError> {
    let Value::Text(text) = value else {
        return Err(EncodeError::WrongType { expected: "string" });
    };
    if !text.is_ascii() {
        return Err(EncodeError::NonAscii);
    }
    let capacity = usize::from(format.word_count) * 2;
    if text.len() > capacity {
        return Err(EncodeError::StringTooLong {
            len: text.len(),
            capacity,
        });
    }
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(capacity, 0);
    let words: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(reorder(&words, format.word_order))
}
