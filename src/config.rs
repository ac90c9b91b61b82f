//! # Gateway Configuration
//!
//! The parsed configuration object. It can be read from JSON with
//! [`GatewayConfig::from_json_str`] or [`GatewayConfig::from_file`];
//! [`GatewayConfig::validate`] checks cross references and builds the
//! immutable device descriptors and register maps.
//!
//! ```json
//! {
//!   "buses": [
//!     { "name": "rs485", "transport": { "type": "rtu", "path": "/dev/ttyS1", "baud_rate": 9600 } },
//!     { "name": "plant", "transport": { "type": "tcp", "host": "10.0.0.5", "port": 502 },
//!       "response_timeout_ms": 500 }
//!   ],
//!   "register_maps": {
//!     "em340": { "start_address": 0, "quantity": 4, "function_code": 4,
//!                "mapping": [{ "name": "voltage", "address": 0, "type": "u16", "scale": 0.1 }] }
//!   },
//!   "devices": [
//!     { "device_name": "meter_1", "device_model": "em340", "slave_id": 1,
//!       "kind": "meter", "bus": "rs485" }
//!   ]
//! }
//! ```
//!
//! Register addresses are protocol addresses and are used as given; no
//! 40001-style offset is subtracted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::bytes::ByteOrder;
use crate::codec::ReadFunction;
use crate::constants::*;
use crate::device::{DeviceDescriptor, DeviceKind};
use crate::error::{GatewayError, GatewayResult};
use crate::logging::LogConfig;
use crate::register_map::{RegisterMap, RegisterMapping};
use crate::safety::SafetyConfig;
use crate::transport::{SerialSettings, TransportTimeouts};

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub buses: Vec<BusConfig>,
    #[serde(default)]
    pub register_maps: BTreeMap<String, RegisterMapConfig>,
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub measurement_bus: MeasurementBusConfig,
    #[serde(default)]
    pub control_queue: ControlQueueConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BusConfig {
    pub name: String,
    pub transport: BusTransportConfig,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_inter_byte_timeout_ms")]
    pub inter_byte_timeout_ms: u64,
}

impl BusConfig {
    pub fn timeouts(&self) -> TransportTimeouts {
        TransportTimeouts {
            response: Duration::from_millis(self.response_timeout_ms),
            inter_byte: Duration::from_millis(self.inter_byte_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusTransportConfig {
    Rtu(SerialSettings),
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterMapConfig {
    pub start_address: u16,
    pub quantity: u16,
    pub function_code: ReadFunction,
    #[serde(default)]
    pub byte_order: ByteOrder,
    pub mapping: Vec<RegisterMapping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub device_name: String,
    pub device_model: String,
    pub slave_id: u8,
    pub kind: DeviceKind,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub bus: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeasurementBusConfig {
    pub subscriber_capacity: usize,
}

impl Default for MeasurementBusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlQueueConfig {
    pub capacity: usize,
}

impl Default for ControlQueueConfig {
    fn default() -> Self {
        Self {
            capacity: CONTROL_QUEUE_CAPACITY,
        }
    }
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

fn default_inter_byte_timeout_ms() -> u64 {
    DEFAULT_INTER_BYTE_TIMEOUT_MS
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Configuration after validation, ready for the supervisor
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub buses: Vec<BusConfig>,
    pub devices: Vec<Arc<DeviceDescriptor>>,
    pub safety: SafetyConfig,
    pub subscriber_capacity: usize,
    pub queue_capacity: usize,
    pub logging: LogConfig,
}

impl ValidatedConfig {
    pub fn devices_on<'a>(&'a self, bus: &'a str) -> impl Iterator<Item = &'a Arc<DeviceDescriptor>> + 'a {
        self.devices.iter().filter(move |d| d.bus == bus)
    }
}

impl GatewayConfig {
    pub fn from_json_str(text: &str) -> GatewayResult<Self> {
        serde_json::from_str(text).map_err(|e| GatewayError::config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
            .map_err(|e| GatewayError::config(format!("{}: {e}", path.display())))
    }

    /// Check every constraint and build the device descriptors.
    pub fn validate(&self) -> GatewayResult<ValidatedConfig> {
        let mut bus_names = HashSet::new();
        for bus in &self.buses {
            if !bus_names.insert(bus.name.as_str()) {
                return Err(GatewayError::config(format!("duplicate bus '{}'", bus.name)));
            }
            validate_bus(bus)?;
        }

        let mut maps: HashMap<&str, Arc<RegisterMap>> = HashMap::new();
        for (model, map) in &self.register_maps {
            let built = RegisterMap::new(
                model.as_str(),
                map.start_address,
                map.quantity,
                map.function_code,
                map.byte_order,
                map.mapping.clone(),
            )?;
            maps.insert(model.as_str(), Arc::new(built));
        }

        if self.devices.is_empty() {
            return Err(GatewayError::config("no devices configured"));
        }
        let mut device_names = HashSet::new();
        let mut devices = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            let name = &device.device_name;
            if name.is_empty() || !device_names.insert(name.as_str()) {
                return Err(GatewayError::config(format!("duplicate or empty device name '{name}'")));
            }
            if !bus_names.contains(device.bus.as_str()) {
                return Err(GatewayError::config(format!(
                    "device '{name}' references unknown bus '{}'",
                    device.bus
                )));
            }
            let register_map = maps.get(device.device_model.as_str()).ok_or_else(|| {
                GatewayError::config(format!(
                    "device '{name}' references unknown model '{}'",
                    device.device_model
                ))
            })?;
            if !(MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&device.slave_id) {
                return Err(GatewayError::config(format!(
                    "device '{name}': slave_id {} outside {MIN_SLAVE_ID}..={MAX_SLAVE_ID}",
                    device.slave_id
                )));
            }
            if device.poll_interval_ms < MIN_POLL_INTERVAL_MS {
                return Err(GatewayError::config(format!(
                    "device '{name}': poll_interval_ms {} below {MIN_POLL_INTERVAL_MS}",
                    device.poll_interval_ms
                )));
            }
            devices.push(Arc::new(DeviceDescriptor {
                name: name.clone(),
                model: device.device_model.clone(),
                slave_id: device.slave_id,
                kind: device.kind,
                poll_interval: Duration::from_millis(device.poll_interval_ms),
                bus: device.bus.clone(),
                register_map: Arc::clone(register_map),
            }));
        }

        let safety = &self.safety;
        if safety.period_ms == 0 {
            return Err(GatewayError::config("safety.period_ms must be positive"));
        }
        if safety.min_voltage_v >= safety.max_voltage_v {
            return Err(GatewayError::config(format!(
                "safety voltage window {}..{} is empty",
                safety.min_voltage_v, safety.max_voltage_v
            )));
        }
        if self.measurement_bus.subscriber_capacity == 0 || self.control_queue.capacity == 0 {
            return Err(GatewayError::config("queue capacities must be positive"));
        }

        Ok(ValidatedConfig {
            buses: self.buses.clone(),
            devices,
            safety: self.safety.clone(),
            subscriber_capacity: self.measurement_bus.subscriber_capacity,
            queue_capacity: self.control_queue.capacity,
            logging: self.logging.clone(),
        })
    }
}

fn validate_bus(bus: &BusConfig) -> GatewayResult<()> {
    if bus.response_timeout_ms == 0 || bus.inter_byte_timeout_ms == 0 {
        return Err(GatewayError::config(format!(
            "bus '{}': timeouts must be positive",
            bus.name
        )));
    }
    match &bus.transport {
        BusTransportConfig::Rtu(serial) => {
            if serial.path.is_empty() || serial.baud_rate == 0 {
                return Err(GatewayError::config(format!(
                    "bus '{}': serial path and baud rate are required",
                    bus.name
                )));
            }
            if !matches!(serial.data_bits, 7 | 8) || !matches!(serial.stop_bits, 1 | 2) {
                return Err(GatewayError::config(format!(
                    "bus '{}': unsupported framing {} data bits, {} stop bits",
                    bus.name, serial.data_bits, serial.stop_bits
                )));
            }
        }
        BusTransportConfig::Tcp { host, .. } => {
            if host.is_empty() {
                return Err(GatewayError::config(format!("bus '{}': empty host", bus.name)));
            }
        }
    }
    Ok(())
}
