//! Device descriptors

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::register_map::RegisterMap;

/// Kind of field device. Kinds differ only in which safety rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Meter,
    Inverter,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meter => "meter",
            Self::Inverter => "inverter",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One polled device, immutable after load
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Unique within the gateway
    pub name: String,
    /// Catalogue key of the register map
    pub model: String,
    pub slave_id: u8,
    pub kind: DeviceKind,
    pub poll_interval: Duration,
    /// Name of the bus the device is wired to
    pub bus: String,
    pub register_map: Arc<RegisterMap>,
}

impl DeviceDescriptor {
    #[inline]
    pub fn is_inverter(&self) -> bool {
        self.kind == DeviceKind::Inverter
    }

    /// Topic the device's snapshots are published on
    pub fn topic(&self) -> String {
        format!("{}{}", crate::constants::MEASUREMENT_TOPIC_PREFIX, self.name)
    }
}
