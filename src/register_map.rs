//! # Register-Map Engine
//!
//! A [`RegisterMap`] describes one device model: the register block polled
//! in a single request and the named, typed measurements inside it.
//!
//! ```text
//! start_address = 100, quantity = 6
//!
//!   100     101     102     103     104     105
//! +-------+-------+-------+-------+-------+-------+
//! |  voltage (u16)|  energy (u32) |  power (f32)  |
//! +-------+-------+-------+-------+-------+-------+
//! ```
//!
//! Maps are validated once when built and immutable afterwards: every
//! mapping lies inside `[start_address, start_address + quantity)`,
//! including the second word of 32-bit types. Decoding and encoding are pure
//! functions over register slices.

use std::collections::HashSet;

use bytes::Bytes;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use tracing::debug;

use crate::bytes::ByteOrder;
use crate::codec::{BusOp, ReadFunction};
use crate::constants::MAX_READ_REGISTERS;
use crate::error::{GatewayError, GatewayResult};
use crate::snapshot::{Measurements, Snapshot, SnapshotStatus};
use crate::value::{DataType, RawValue};

/// One named measurement inside a register block
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterMapping {
    pub name: String,
    pub address: u16,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub writable: bool,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterMapping {
    pub fn new(name: impl Into<String>, address: u16, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            address,
            data_type,
            scale: 1.0,
            writable: false,
        }
    }

    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }
}

/// Register words of an encoded write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedWrite {
    pub address: u16,
    pub words: Vec<u16>,
}

impl EncodedWrite {
    /// FC06 for one word, FC16 otherwise
    pub fn into_op(self) -> BusOp {
        if self.words.len() == 1 {
            BusOp::WriteSingle {
                address: self.address,
                value: self.words[0],
            }
        } else {
            BusOp::WriteMultiple {
                address: self.address,
                values: self.words,
            }
        }
    }
}

/// Result of decoding one register block
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub values: Measurements,
    pub status: SnapshotStatus,
}

/// Validated, immutable register map of one device model
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterMap {
    model: String,
    start_address: u16,
    quantity: u16,
    function: ReadFunction,
    byte_order: ByteOrder,
    mappings: Vec<RegisterMapping>,
}

impl RegisterMap {
    /// Build and validate a map.
    ///
    /// Fails with `ConfigInvalid` when the block is empty or larger than one
    /// read, when a name repeats, when a scale is zero or not finite, or when
    /// a mapping (or the second word of a 32-bit mapping) lies outside the
    /// block.
    pub fn new(
        model: impl Into<String>,
        start_address: u16,
        quantity: u16,
        function: ReadFunction,
        byte_order: ByteOrder,
        mappings: Vec<RegisterMapping>,
    ) -> GatewayResult<Self> {
        let model = model.into();
        if quantity == 0 || quantity as usize > MAX_READ_REGISTERS {
            return Err(GatewayError::config(format!(
                "register map '{model}': quantity {quantity} outside 1..={MAX_READ_REGISTERS}"
            )));
        }
        let end = start_address as u32 + quantity as u32;
        if end > u16::MAX as u32 + 1 {
            return Err(GatewayError::config(format!(
                "register map '{model}': block {start_address}+{quantity} exceeds the address space"
            )));
        }
        if mappings.is_empty() {
            return Err(GatewayError::config(format!(
                "register map '{model}': no mappings"
            )));
        }

        let mut names = HashSet::new();
        for mapping in &mappings {
            if !names.insert(mapping.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "register map '{model}': duplicate mapping name '{}'",
                    mapping.name
                )));
            }
            if !mapping.scale.is_finite() || mapping.scale == 0.0 {
                return Err(GatewayError::config(format!(
                    "register map '{model}': mapping '{}' has invalid scale {}",
                    mapping.name, mapping.scale
                )));
            }
            let first = mapping.address as u32;
            let last = first + mapping.data_type.word_count() as u32 - 1;
            if first < start_address as u32 || last >= end {
                return Err(GatewayError::config(format!(
                    "register map '{model}': mapping '{}' ({} at {}) outside [{}, {})",
                    mapping.name, mapping.data_type, mapping.address, start_address, end
                )));
            }
        }

        Ok(Self {
            model,
            start_address,
            quantity,
            function,
            byte_order,
            mappings,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn start_address(&self) -> u16 {
        self.start_address
    }

    pub fn quantity(&self) -> u16 {
        self.quantity
    }

    pub fn function(&self) -> ReadFunction {
        self.function
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn mappings(&self) -> &[RegisterMapping] {
        &self.mappings
    }

    pub fn mapping(&self, name: &str) -> Option<&RegisterMapping> {
        self.mappings.iter().find(|m| m.name == name)
    }

    /// Whole-block read request for this map
    pub fn read_op(&self) -> BusOp {
        BusOp::read(self.function, self.start_address, self.quantity)
    }

    /// Single-register read of the first register in the block
    pub fn probe_op(&self) -> BusOp {
        BusOp::read(self.function, self.start_address, 1)
    }

    /// Decode a raw block read from `start_address`.
    ///
    /// Mappings whose words are missing from `raw` are skipped and the result
    /// is `Partial`.
    pub fn decode(&self, raw: &[u16]) -> Decoded {
        let mut values = Measurements::with_capacity(self.mappings.len());
        let mut status = SnapshotStatus::Ok;

        for mapping in &self.mappings {
            let offset = (mapping.address - self.start_address) as usize;
            let value = raw
                .get(offset..)
                .and_then(|words| RawValue::from_words(mapping.data_type, words, self.byte_order));
            match value {
                Some(value) => values.push(mapping.name.as_str(), value.as_f64() * mapping.scale),
                None => {
                    debug!(
                        model = %self.model,
                        mapping = %mapping.name,
                        offset,
                        available = raw.len(),
                        "mapping outside returned block, skipped"
                    );
                    status = SnapshotStatus::Partial;
                }
            }
        }

        Decoded { values, status }
    }

    /// Encode an engineering value for the writable mapping `name`.
    pub fn encode(&self, name: &str, value: f64) -> GatewayResult<EncodedWrite> {
        let mapping = self
            .mapping(name)
            .ok_or_else(|| GatewayError::UnknownMeasurement(name.to_string()))?;
        if !mapping.writable {
            return Err(GatewayError::NotWritable(name.to_string()));
        }
        let raw = RawValue::from_f64(mapping.data_type, value / mapping.scale).ok_or_else(|| {
            GatewayError::OutOfRange {
                name: name.to_string(),
                value,
                data_type: mapping.data_type.name(),
            }
        })?;
        Ok(EncodedWrite {
            address: mapping.address,
            words: raw.to_words(self.byte_order),
        })
    }
}

// ============================================================================
// Snapshot envelope
// ============================================================================

/// Serialize a snapshot as the canonical JSON envelope.
///
/// Field order is `timestamp, device_id, status, sequence, data`; `data`
/// keeps mapping-declaration order and numbers carry at most 6 significant
/// digits. Non-finite values are emitted as `null`.
pub fn to_json(snapshot: &Snapshot) -> GatewayResult<Bytes> {
    let envelope = Envelope {
        timestamp: snapshot.timestamp.timestamp_millis(),
        device_id: &snapshot.device_name,
        status: snapshot.status,
        sequence: snapshot.sequence,
        data: DataFields(&snapshot.values),
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

#[derive(serde::Serialize)]
struct Envelope<'a> {
    timestamp: i64,
    device_id: &'a str,
    status: SnapshotStatus,
    sequence: u64,
    data: DataFields<'a>,
}

struct DataFields<'a>(&'a Measurements);

impl Serialize for DataFields<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in self.0.iter() {
            map.serialize_entry(name, &SignificantNumber(value))?;
        }
        map.end()
    }
}

/// Number rounded to 6 significant digits
struct SignificantNumber(f64);

/// Round to 6 significant digits through decimal formatting, so the printed
/// value has no binary noise.
fn round_significant(value: f64) -> f64 {
    format!("{value:.5e}").parse().unwrap_or(value)
}

impl Serialize for SignificantNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.0.is_finite() {
            return serializer.serialize_none();
        }
        let rounded = round_significant(self.0);
        if rounded.fract() == 0.0 && rounded.abs() < 1e15 {
            serializer.serialize_i64(rounded as i64)
        } else {
            serializer.serialize_f64(rounded)
        }
    }
}
