//! Error types for the gateway
//!
//! Two layers:
//!
//! | Type | Scope | Examples |
//! |------|-------|----------|
//! | [`ModbusError`] | one bus transaction | timeout, CRC mismatch, exception response |
//! | [`GatewayError`] | gateway operations | invalid config, queue full, not writable |
//!
//! Bus errors are plain values (`Clone + PartialEq`) so they can be scripted
//! in tests and compared directly.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::constants::*;

/// Result type for bus transactions
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

// ============================================================================
// Exception kinds
// ============================================================================

/// Standard Modbus exception codes carried by an exception response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    /// Vendor-specific or reserved code
    Other(u8),
}

impl ExceptionKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Self::IllegalFunction,
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Self::IllegalDataAddress,
            EXCEPTION_ILLEGAL_DATA_VALUE => Self::IllegalDataValue,
            EXCEPTION_SERVER_DEVICE_FAILURE => Self::ServerDeviceFailure,
            EXCEPTION_ACKNOWLEDGE => Self::Acknowledge,
            EXCEPTION_SERVER_DEVICE_BUSY => Self::ServerDeviceBusy,
            EXCEPTION_MEMORY_PARITY_ERROR => Self::MemoryParityError,
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => Self::GatewayPathUnavailable,
            EXCEPTION_GATEWAY_TARGET_FAILED => Self::GatewayTargetFailed,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::IllegalFunction => EXCEPTION_ILLEGAL_FUNCTION,
            Self::IllegalDataAddress => EXCEPTION_ILLEGAL_DATA_ADDRESS,
            Self::IllegalDataValue => EXCEPTION_ILLEGAL_DATA_VALUE,
            Self::ServerDeviceFailure => EXCEPTION_SERVER_DEVICE_FAILURE,
            Self::Acknowledge => EXCEPTION_ACKNOWLEDGE,
            Self::ServerDeviceBusy => EXCEPTION_SERVER_DEVICE_BUSY,
            Self::MemoryParityError => EXCEPTION_MEMORY_PARITY_ERROR,
            Self::GatewayPathUnavailable => EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
            Self::GatewayTargetFailed => EXCEPTION_GATEWAY_TARGET_FAILED,
            Self::Other(code) => *code,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "server device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerDeviceBusy => "server device busy",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetFailed => "gateway target device failed to respond",
            Self::Other(_) => "unknown exception",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} ({})", self.code(), self.description())
    }
}

// ============================================================================
// Bus transaction errors
// ============================================================================

/// Failure of a single Modbus transaction
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// No (complete) reply within the configured timeout
    #[error("Timeout after {timeout_ms} ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Reply does not parse as a frame for the request that was sent
    #[error("Framing error: {message}")]
    Framing { message: String },

    /// RTU checksum mismatch
    #[error("CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    Crc { computed: u16, received: u16 },

    /// Device answered with an exception response
    #[error("Modbus exception {kind} for function {function:#04x}")]
    Exception { function: u8, kind: ExceptionKind },

    /// Reply stopped before the expected length
    #[error("Short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    /// The transport is gone; nothing further will succeed on this bus
    #[error("Transport closed")]
    TransportClosed,

    #[error("I/O error: {message}")]
    Io { message: String },

    /// Request rejected locally before reaching the wire
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function: function & !EXCEPTION_FLAG,
            kind: ExceptionKind::from_code(code),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Transient line errors are retried by the arbiter; everything else is
    /// surfaced on the first occurrence.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Crc { .. } | Self::Framing { .. } | Self::ShortRead { .. }
        )
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception { .. })
    }

    /// Exception code when this is an exception response
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Self::Exception { kind, .. } => Some(kind.code()),
            _ => None,
        }
    }
}

impl From<io::Error> for ModbusError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => Self::TransportClosed,
            io::ErrorKind::TimedOut => Self::timeout(err.to_string(), 0),
            _ => Self::io(err.to_string()),
        }
    }
}

// ============================================================================
// Gateway errors
// ============================================================================

/// Errors raised by configuration, control and supervision
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Failed to open bus '{bus}': {message}")]
    TransportOpenFailed { bus: String, message: String },

    #[error("Control queue full for device '{device}'")]
    QueueFull { device: String },

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Unknown measurement '{0}'")]
    UnknownMeasurement(String),

    #[error("Measurement '{0}' is not writable")]
    NotWritable(String),

    #[error("Value {value} out of range for '{name}' ({data_type})")]
    OutOfRange {
        name: String,
        value: f64,
        data_type: &'static str,
    },

    #[error("Invalid topic pattern '{0}'")]
    InvalidPattern(String),

    #[error("Malformed control message: {0}")]
    MalformedCommand(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    #[error(transparent)]
    Bus(#[from] ModbusError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid(message.into())
    }

    pub fn open_failed(bus: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportOpenFailed {
            bus: bus.into(),
            message: message.into(),
        }
    }

    /// Process exit status for this error
    ///
    /// | Code | Meaning |
    /// |------|---------|
    /// | 1 | configuration error |
    /// | 2 | unrecoverable transport error |
    /// | 3 | queue/bus deadlock |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::TransportOpenFailed { .. } | Self::Bus(_) => 2,
            Self::Deadlock(_) => 3,
            _ => 1,
        }
    }
}
