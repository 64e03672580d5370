//! Binary codec for controller register contents
//!
//! Stateless conversions used by every layer above the wire:
//! - big-endian register words ↔ bytes
//! - UTF-16BE text fields
//! - word- and byte-swapped IEEE-754 singles
//! - fixed-point truncation to a number of decimal places

use crate::error::{Result, StationError};

// ============================================================================
// Register ↔ Bytes
// ============================================================================

/// Flatten registers into bytes, high byte of each register first
pub fn registers_to_bytes(regs: &[u16]) -> Vec<u8> {
    regs.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Pack bytes into registers (big-endian); a trailing odd byte is zero-padded
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
        .collect()
}

// ============================================================================
// Text
// ============================================================================

/// Decode big-endian UTF-16 code units until a zero unit or the end of input.
///
/// A dangling odd byte is ignored. Unpaired surrogates become U+FFFD.
pub fn decode_utf16_text(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0);

    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Encode text as big-endian UTF-16 into exactly `registers` registers (NUL padded)
pub fn encode_utf16_text(text: &str, registers: usize) -> Vec<u16> {
    let mut regs: Vec<u16> = text.encode_utf16().take(registers).collect();
    regs.resize(registers, 0);
    regs
}

// ============================================================================
// Floats
// ============================================================================

/// Decode a float whose bytes arrive as `[b1, b0, b3, b2]` of the IEEE-754 big-endian form
pub fn decode_swapped_float(bytes: [u8; 4]) -> f32 {
    f32::from_be_bytes([bytes[1], bytes[0], bytes[3], bytes[2]])
}

/// Inverse of [`decode_swapped_float`]
pub fn encode_swapped_float(value: f32) -> [u8; 4] {
    let be = value.to_be_bytes();
    [be[1], be[0], be[3], be[2]]
}

/// Decode the swapped float stored at `offset` in a byte buffer
pub fn swapped_float_at(bytes: &[u8], offset: usize) -> Result<f32> {
    let slot = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| short_buffer(offset + 4, bytes.len()))?;
    Ok(decode_swapped_float([slot[0], slot[1], slot[2], slot[3]]))
}

/// Truncate toward negative infinity: `floor(value × 10ⁿ) / 10ⁿ`
///
/// Computed in f64 so the float-to-decimal step does not pick up an extra
/// rounding error before the floor.
pub fn scale_to_decimal_places(value: f32, places: u32) -> f32 {
    let factor = 10f64.powi(places as i32);
    ((f64::from(value) * factor).floor() / factor) as f32
}

fn short_buffer(needed: usize, got: usize) -> StationError {
    StationError::data(format!("buffer too short: need {needed} bytes, got {got}"))
}

// ============================================================================
// Register cursor
// ============================================================================

/// Sequential reader over a register range returned by one read
///
/// Descriptor layouts are decoded field by field in register order.
#[derive(Debug)]
pub struct RegisterCursor<'a> {
    regs: &'a [u16],
    pos: usize,
}

impl<'a> RegisterCursor<'a> {
    pub fn new(regs: &'a [u16]) -> Self {
        Self { regs, pos: 0 }
    }

    pub fn take(&mut self, count: usize) -> Result<&'a [u16]> {
        let end = self.pos + count;
        let slice = self.regs.get(self.pos..end).ok_or_else(|| {
            StationError::data(format!(
                "register range too short: need {end} registers, got {}",
                self.regs.len()
            ))
        })?;
        self.pos = end;
        Ok(slice)
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(self.take(1)?[0])
    }

    pub fn flag(&mut self) -> Result<bool> {
        Ok(self.u16()? != 0)
    }

    /// Two registers, high word first
    pub fn u32(&mut self) -> Result<u32> {
        let r = self.take(2)?;
        Ok((u32::from(r[0]) << 16) | u32::from(r[1]))
    }

    pub fn swapped_f32(&mut self) -> Result<f32> {
        let r = self.take(2)?;
        let [a, b] = r[0].to_be_bytes();
        let [c, d] = r[1].to_be_bytes();
        Ok(decode_swapped_float([a, b, c, d]))
    }

    pub fn text(&mut self, registers: usize) -> Result<String> {
        let r = self.take(registers)?;
        Ok(decode_utf16_text(&registers_to_bytes(r)))
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }
}

/// Registers for a swapped float, as the controller stores it
pub fn swapped_float_registers(value: f32) -> [u16; 2] {
    let b = encode_swapped_float(value);
    [u16::from_be_bytes([b[0], b[1]]), u16::from_be_bytes([b[2], b[3]])]
}
