//! Byte window to typed value.
//!
//! Integer points go through the full pipeline: byte order, width, bit
//! calculation, sign extension, offset and multiplier, then the optional
//! expression. Floats and arrays are reinterpreted directly; strings are
//! hex-encoded. Malformed input is an error, never a silent zero.

use fieldgate_common::TelemetryValue;

use crate::error::DecodeError;
use crate::model::{BitCalculation, DataType, Endianness, Point, ScalarType};
use crate::script::ScriptEngine;

#[derive(Debug, Clone, Default)]
pub struct PointDecoder {
    scripts: ScriptEngine,
}

impl PointDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the value of `point` from `window`, which starts at the point's
    /// address inside a payload of `item_width`-byte items.
    pub fn decode(
        &self,
        point: &Point,
        window: &[u8],
        item_width: usize,
    ) -> Result<TelemetryValue, DecodeError> {
        let needed = point.byte_len(item_width);
        let window = window.get(..needed).ok_or(DecodeError::InsufficientData {
            offset: 0,
            needed,
            available: window.len(),
        })?;

        match point.data_type {
            DataType::String => Ok(TelemetryValue::Text(hex::encode(window))),
            DataType::Array(kind) => {
                let values = window
                    .chunks_exact(kind.width())
                    .map(|chunk| element(kind, read_raw(chunk, point.endianness)))
                    .collect();
                Ok(TelemetryValue::Array(values))
            }
            DataType::Bit => {
                let raw = read_raw(window, point.endianness);
                let bits = extract_bits(raw, window.len() * 8, point)?;
                Ok(TelemetryValue::Boolean(bits != 0))
            }
            DataType::Scalar(kind) if kind.is_float() => {
                let value = element(kind, read_raw(window, point.endianness));
                Ok(TelemetryValue::Float(self.transform(point, value)?))
            }
            DataType::Scalar(kind) => {
                let raw = read_raw(window, point.endianness);
                let bits = extract_bits(raw, kind.width() * 8, point)?;
                self.scale(point, kind, bits)
            }
        }
    }

    fn scale(&self, point: &Point, kind: ScalarType, bits: u64) -> Result<TelemetryValue, DecodeError> {
        let signed = kind
            .is_signed()
            .then(|| sign_extend(bits, kind.width()));

        let untouched = point.offset == 0.0
            && (point.multiplier == 1.0 || point.multiplier == 0.0)
            && point.expression.is_none();
        if untouched {
            return Ok(match signed {
                Some(v) => TelemetryValue::Integer(v),
                None => TelemetryValue::Unsigned(bits),
            });
        }

        let mut value = signed.map(|v| v as f64).unwrap_or(bits as f64) - point.offset;
        if point.multiplier != 1.0 && point.multiplier != 0.0 {
            value *= point.multiplier;
        }
        Ok(TelemetryValue::Float(self.transform(point, value)?))
    }

    fn transform(&self, point: &Point, value: f64) -> Result<f64, DecodeError> {
        match point.expression.as_deref().map(str::trim) {
            Some(expression) if !expression.is_empty() => self.scripts.eval(expression, value),
            _ => Ok(value),
        }
    }
}

/// Unsigned integer of `bytes`, in declared order. Little endian reverses the
/// whole window.
pub fn read_raw(bytes: &[u8], endianness: Endianness) -> u64 {
    let fold = |acc: u64, byte: &u8| (acc << 8) | *byte as u64;
    match endianness {
        Endianness::Big => bytes.iter().fold(0, fold),
        Endianness::Little => bytes.iter().rev().fold(0, fold),
    }
}

/// Apply the point's bit calculation to a `width_bits`-wide raw value.
/// Bit 0 is the least significant bit.
pub fn extract_bits(raw: u64, width_bits: usize, point: &Point) -> Result<u64, DecodeError> {
    let check = |bit: u8| {
        if (bit as usize) < width_bits {
            Ok(())
        } else {
            Err(DecodeError::BitOutOfRange {
                bit,
                width: width_bits,
            })
        }
    };

    match point.bit_calculation {
        BitCalculation::All => Ok(raw),
        BitCalculation::Single => {
            check(point.start_bit)?;
            Ok((raw >> point.start_bit) & 1)
        }
        BitCalculation::Multiple => {
            let (start, end) = (point.start_bit, point.end_bit);
            if start > end {
                return Err(DecodeError::InvalidBitRange { start, end });
            }
            check(end)?;
            let len = (end - start + 1) as u32;
            let mask = if len >= 64 { u64::MAX } else { (1u64 << len) - 1 };
            Ok((raw >> start) & mask)
        }
    }
}

/// Sign-extend the low `width` bytes of `raw`.
pub fn sign_extend(raw: u64, width: usize) -> i64 {
    let shift = 64 - (width.clamp(1, 8) * 8) as u32;
    ((raw << shift) as i64) >> shift
}

fn element(kind: ScalarType, raw: u64) -> f64 {
    match kind {
        ScalarType::Float32 => f32::from_bits(raw as u32) as f64,
        ScalarType::Float64 => f64::from_bits(raw),
        kind if kind.is_signed() => sign_extend(raw, kind.width()) as f64,
        _ => raw as f64,
    }
}
