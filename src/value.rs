//! # Register Value Types
//!
//! The five data types a register mapping may declare, and the typed raw
//! value assembled from (or split into) registers.
//!
//! | Type | Registers | Range |
//! |------|-----------|-------|
//! | u16 | 1 | 0 ..= 65535 |
//! | i16 | 1 | -32768 ..= 32767 |
//! | u32 | 2 | 0 ..= 4294967295 |
//! | i32 | 2 | -2147483648 ..= 2147483647 |
//! | f32 | 2 | IEEE-754 single |

use std::fmt;

use serde::Deserialize;

use crate::bytes::{join_words, split_words, ByteOrder};

/// Declared type of a register mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl DataType {
    /// Registers occupied by one value
    #[inline]
    pub fn word_count(&self) -> usize {
        match self {
            Self::U16 | Self::I16 => 1,
            Self::U32 | Self::I32 | Self::F32 => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed value as held by the device registers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl RawValue {
    /// Assemble a value from the start of `words`.
    ///
    /// Returns `None` when `words` is shorter than the type needs.
    pub fn from_words(data_type: DataType, words: &[u16], order: ByteOrder) -> Option<Self> {
        match data_type {
            DataType::U16 => words.first().map(|w| Self::U16(*w)),
            DataType::I16 => words.first().map(|w| Self::I16(*w as i16)),
            DataType::U32 | DataType::I32 | DataType::F32 => {
                let pair = words.get(..2)?;
                let word = join_words([pair[0], pair[1]], order);
                Some(match data_type {
                    DataType::U32 => Self::U32(word),
                    DataType::I32 => Self::I32(word as i32),
                    _ => Self::F32(f32::from_bits(word)),
                })
            }
        }
    }

    /// Nearest representable value of `data_type`, or `None` when `value`
    /// does not fit. Integers round half away from zero.
    pub fn from_f64(data_type: DataType, value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let rounded = value.round();
        match data_type {
            DataType::U16 => {
                (0.0..=u16::MAX as f64).contains(&rounded).then(|| Self::U16(rounded as u16))
            }
            DataType::I16 => (i16::MIN as f64..=i16::MAX as f64)
                .contains(&rounded)
                .then(|| Self::I16(rounded as i16)),
            DataType::U32 => {
                (0.0..=u32::MAX as f64).contains(&rounded).then(|| Self::U32(rounded as u32))
            }
            DataType::I32 => (i32::MIN as f64..=i32::MAX as f64)
                .contains(&rounded)
                .then(|| Self::I32(rounded as i32)),
            DataType::F32 => {
                // rounds to the nearest f32, overflow becomes infinite
                let narrowed = value as f32;
                narrowed.is_finite().then_some(Self::F32(narrowed))
            }
        }
    }

    /// Registers in transmission order
    pub fn to_words(&self, order: ByteOrder) -> Vec<u16> {
        match self {
            Self::U16(v) => vec![*v],
            Self::I16(v) => vec![*v as u16],
            Self::U32(v) => split_words(*v, order).to_vec(),
            Self::I32(v) => split_words(*v as u32, order).to_vec(),
            Self::F32(v) => split_words(v.to_bits(), order).to_vec(),
        }
    }

    #[inline]
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::U16(v) => f64::from(*v),
            Self::I16(v) => f64::from(*v),
            Self::U32(v) => f64::from(*v),
            Self::I32(v) => f64::from(*v),
            Self::F32(v) => f64::from(*v),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::U16(_) => DataType::U16,
            Self::I16(_) => DataType::I16,
            Self::U32(_) => DataType::U32,
            Self::I32(_) => DataType::I32,
            Self::F32(_) => DataType::F32,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U16(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
        }
    }
}
