//! # Word Order for Multi-Register Values
//!
//! Modbus registers are always transmitted big-endian, so the only
//! device-specific choice for a 32-bit value is which of its two registers
//! holds the high word.
//!
//! For 32-bit value `0x12345678`:
//! - `BigEndian` (ABCD): registers \[0x1234, 0x5678\]
//! - `LittleEndian` (CDAB): registers \[0x5678, 0x1234\]

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Word order of a register map's 32-bit values.
///
/// # Example
///
/// ```rust
/// use voltage_gateway::bytes::{join_words, split_words, ByteOrder};
///
/// assert_eq!(join_words([0x0001, 0x86A0], ByteOrder::BigEndian), 100_000);
/// assert_eq!(split_words(100_000, ByteOrder::LittleEndian), [0x86A0, 0x0001]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum ByteOrder {
    /// High word first: `(raw[0] << 16) | raw[1]`
    #[default]
    BigEndian,
    /// Low word first: `(raw[1] << 16) | raw[0]`
    LittleEndian,
}

impl ByteOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "big_endian",
            Self::LittleEndian => "little_endian",
        }
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    /// Accepts `big_endian`/`little_endian` plus the common ABCD/CDAB spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "BIGENDIAN" | "BE" | "ABCD" => Ok(Self::BigEndian),
            "LITTLEENDIAN" | "LE" | "CDAB" => Ok(Self::LittleEndian),
            _ => Err(format!(
                "unknown byte_order '{s}' (expected big_endian or little_endian)"
            )),
        }
    }
}

impl TryFrom<String> for ByteOrder {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assemble two registers into a 32-bit word
#[inline]
pub fn join_words(words: [u16; 2], order: ByteOrder) -> u32 {
    let (high, low) = match order {
        ByteOrder::BigEndian => (words[0], words[1]),
        ByteOrder::LittleEndian => (words[1], words[0]),
    };
    (u32::from(high) << 16) | u32::from(low)
}

/// Split a 32-bit word into two registers in transmission order
#[inline]
pub fn split_words(value: u32, order: ByteOrder) -> [u16; 2] {
    let high = (value >> 16) as u16;
    let low = (value & 0xFFFF) as u16;
    match order {
        ByteOrder::BigEndian => [high, low],
        ByteOrder::LittleEndian => [low, high],
    }
}
