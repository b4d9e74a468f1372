//! Field decoding primitives shared by the per-device parsers
//!
//! All offsets are absolute within the received frame; parsers pass
//! `HEADER + field_offset`. Multi-byte values are big-endian.

use byteorder::{BigEndian, ByteOrder};
use tracing::warn;

use super::TelemetryValue;

/// Payload starts after `[unit, func, byte_count]`
pub const HEADER: usize = crate::protocol::RESPONSE_HEADER_LEN;

/// Bit position → flag name
pub type BitTable = &'static [(u8, &'static str)];

/// Round to a fixed number of decimal places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Returns `true` when `data` holds at least `HEADER + len` bytes
pub fn has_payload(data: &[u8], len: usize) -> bool {
    data.len() >= HEADER + len
}

/// Read a 1, 2 or 4 byte big-endian integer
///
/// Returns 0 (with a warning) when the field runs past the end of `data` or
/// the width is unsupported.
pub fn read_int(data: &[u8], offset: usize, length: usize, signed: bool) -> i64 {
    if offset + length > data.len() {
        warn!(
            "Data too short: offset={}, length={}, data_len={}",
            offset,
            length,
            data.len()
        );
        return 0;
    }

    let field = &data[offset..offset + length];
    match (length, signed) {
        (1, false) => field[0] as i64,
        (1, true) => field[0] as i8 as i64,
        (2, false) => BigEndian::read_u16(field) as i64,
        (2, true) => BigEndian::read_i16(field) as i64,
        (4, false) => BigEndian::read_u32(field) as i64,
        (4, true) => BigEndian::read_i32(field) as i64,
        _ => {
            warn!("Unsupported byte length: {}", length);
            0
        }
    }
}

/// Unsigned 16-bit word as an integer value
pub fn word(data: &[u8], offset: usize) -> TelemetryValue {
    TelemetryValue::Int(read_int(data, offset, 2, false))
}

/// Integer field multiplied by `scale`, rounded to 3 decimals
pub fn scaled(data: &[u8], offset: usize, length: usize, scale: f64, signed: bool) -> f64 {
    round_to(read_int(data, offset, length, signed) as f64 * scale, 3)
}

/// Fixed-width ASCII keeping printable characters only, trimmed
pub fn ascii(data: &[u8], offset: usize, length: usize) -> String {
    if offset + length > data.len() {
        return String::new();
    }
    let text: String = data[offset..offset + length]
        .iter()
        .filter(|b| (32..=126).contains(*b))
        .map(|&b| b as char)
        .collect();
    text.trim().to_string()
}

/// Sign-magnitude temperature byte: values above 127 are negative
pub fn temperature(raw: i64) -> i64 {
    if raw > 127 {
        -(raw - 128)
    } else {
        raw
    }
}

/// Names of the set bits in `word`, in table order
pub fn set_flags(word: u32, table: BitTable) -> Vec<String> {
    table
        .iter()
        .filter(|(bit, _)| word & (1u32 << bit) != 0)
        .map(|(_, name)| name.to_string())
        .collect()
}

/// Test a single bit
pub fn bit(word: u32, bit: u8) -> bool {
    word & (1u32 << bit) != 0
}

/// Decode 2-bit alarm codes at the given positions
///
/// Code 1, 2 and 3 produce `{name}{suffixes[0]}`, `{name}{suffixes[1]}` and
/// `{name}{suffixes[2]}`; code 0 produces nothing.
pub fn two_bit_codes<I>(word: u32, positions: I, suffixes: [&str; 3]) -> Vec<String>
where
    I: IntoIterator<Item = (String, u8)>,
{
    positions
        .into_iter()
        .filter_map(|(name, pos)| match (word >> pos) & 0x03 {
            0 => None,
            code => Some(format!("{}{}", name, suffixes[code as usize - 1])),
        })
        .collect()
}

/// Per-cell 2-bit codes for cells 1..=16
pub fn cell_codes(word: u32, suffixes: [&str; 3]) -> Vec<String> {
    two_bit_codes(
        word,
        (0..16u8).map(|cell| (format!("cell_{}", cell + 1), cell * 2)),
        suffixes,
    )
}

/// Look up a code in a value → name table, falling back to `"unknown"`
pub fn lookup(table: &'static [(i64, &'static str)], code: i64) -> &'static str {
    table
        .iter()
        .find(|(value, _)| *value == code)
        .map(|(_, name)| *name)
        .unwrap_or("unknown")
}

/// Convert a list of names into a telemetry list
pub fn text_list(items: Vec<String>) -> TelemetryValue {
    TelemetryValue::List(items.into_iter().map(TelemetryValue::Text).collect())
}
