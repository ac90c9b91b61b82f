//! # Voltage Gateway - Supervised Modbus Energy-Monitoring Gateway
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Polls electricity meters and solar inverters over shared Modbus RTU/TCP
//! lines, turns their register blocks into named measurements, publishes them
//! to downstream consumers and writes control commands back under a set of
//! safety rules.
//!
//! ## Architecture
//!
//! ```text
//! PollingWorker --> BusArbiter --> RTU / TCP transport --> devices
//!      |                ^
//!      v                |
//! RegisterMap      ControlQueue <-- SafetyEngine <--+
//!      |                                           |
//!      v                                           |
//! MeasurementBus --(snapshot cache)----------------+
//!      |
//!      +--> transport bridge --> TransportSink
//! ```
//!
//! - **Bus arbiter**: one per physical line; serializes transactions in FIFO
//!   order, keeps inter-frame silence, retries transient errors
//! - **Register maps**: declarative, validated mapping of register blocks to
//!   typed, scaled, byte-order-aware values, with reverse encoding for writes
//! - **Pipeline**: per-device workers with quarantine, drop-oldest publish,
//!   per-device priority command queues, a 500 ms safety loop and a
//!   supervisor with graceful shutdown and a stall watchdog
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x06 | Write Single Register |
//! | 0x10 | Write Multiple Registers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_gateway::{GatewayConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> voltage_gateway::GatewayResult<()> {
//!     let config = GatewayConfig::from_file("gateway.json")?.validate()?;
//!     let exit = Supervisor::new(config)
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//!     std::process::exit(exit.code);
//! }
//! ```

// ============================================================================
// Protocol
// ============================================================================

/// Protocol limits, function codes and gateway timing constants
pub mod constants;

/// Transaction and gateway error types
pub mod error;

/// Stack-allocated PDU buffer
pub mod pdu;

/// Request/response PDU codec for FC 03/04/06/16
pub mod codec;

/// RTU and MBAP framing
pub mod frame;

/// RTU and TCP transports
pub mod transport;

/// Scripted transport and connector for tests and simulation
#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Bus arbiter: one serialized, retrying owner per physical line
pub mod arbiter;

// ============================================================================
// Register maps
// ============================================================================

/// Word order for 32-bit values
pub mod bytes;

/// Register data types and raw values
pub mod value;

/// Register-map engine
pub mod register_map;

/// Device descriptors
pub mod device;

/// Snapshots of decoded measurements
pub mod snapshot;

// ============================================================================
// Pipeline
// ============================================================================

/// Per-device session with quarantine
pub mod session;

/// In-process measurement topic bus
pub mod measurement_bus;

/// Control commands and the per-device command queue
pub mod control;

/// Per-device polling worker
pub mod worker;

/// Safety rules and loop
pub mod safety;

/// Supervisor, stop flag and exit status
pub mod supervisor;

/// Gateway configuration
pub mod config;

/// Subscriber setup and frame formatting
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_gateway::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{ExceptionKind, GatewayError, GatewayResult, ModbusError, ModbusResult};

// === Bus ===
pub use arbiter::{BusArbiter, BusStats, RetryPolicy};
pub use codec::{BusOp, BusReply, ModbusCodec, ReadFunction};
pub use transport::{
    AnyTransport, ModbusTransport, RtuTransport, SerialSettings, TcpTransport, TransportStats,
    TransportTimeouts,
};

#[cfg(feature = "rtu")]
pub use transport::open_serial;

// === Register maps ===
pub use crate::bytes::ByteOrder;
pub use register_map::{RegisterMap, RegisterMapping};
pub use value::{DataType, RawValue};

// === Pipeline ===
pub use config::{GatewayConfig, ValidatedConfig};
pub use control::{CommandKind, ControlCommand, ControlQueue, Priority};
pub use device::{DeviceDescriptor, DeviceKind};
pub use measurement_bus::{ChannelSink, MeasurementBus, TracingSink, TransportSink};
pub use safety::{SafetyConfig, SafetyEngine, SafetyRule};
pub use snapshot::{Snapshot, SnapshotStatus};
pub use supervisor::{GatewayExit, StopFlag, Supervisor};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Gateway v{} - Supervised Modbus energy-monitoring gateway by Evan Liu",
        VERSION
    )
}
