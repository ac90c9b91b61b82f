//! Modbus protocol constants and gateway timing defaults
//!
//! Protocol limits are derived from the official Modbus specification:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register limits are calculated to fit within the PDU size constraint
//!
//! Gateway defaults (retry policy, quarantine, safety cadence) live in the
//! second half of this file so every component reads them from one place.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP, including the unit id
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Maximum RTU frame: slave(1) + PDU(253) + CRC(2)
pub const MAX_RTU_FRAME: usize = 1 + MAX_PDU_SIZE + 2;

/// Shortest valid RTU response (exception): slave + fc + code + CRC
pub const MIN_RTU_RESPONSE: usize = 5;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04
///
/// Response PDU: FC(1) + byte count(1) + N × 2 ≤ 253, so N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16
///
/// Request PDU: FC(1) + addr(2) + qty(2) + byte count(1) + N × 2 ≤ 253, so N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Addressing
// ============================================================================

/// Lowest unicast slave id
pub const MIN_SLAVE_ID: u8 = 1;

/// Highest unicast slave id
pub const MAX_SLAVE_ID: u8 = 247;

// ============================================================================
// Bus Arbiter Defaults
// ============================================================================

/// Response timeout (first byte of the reply)
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1000;

/// Gap allowed between two bytes of the same reply
pub const DEFAULT_INTER_BYTE_TIMEOUT_MS: u64 = 500;

/// Retries after the first attempt on timeout, CRC, framing or short read
pub const MAX_RETRIES: u32 = 3;

/// Linear retry backoff: `BASE + retry × STEP`
pub const RETRY_BACKOFF_BASE_MS: u64 = 20;

/// See [`RETRY_BACKOFF_BASE_MS`]
pub const RETRY_BACKOFF_STEP_MS: u64 = 30;

/// Fixed 3.5 character silence used above 19200 baud
pub const RTU_FIXED_SILENCE_US: u64 = 1750;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

// ============================================================================
// Device Session / Worker Defaults
// ============================================================================

/// Consecutive failures before a session is quarantined
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// First quarantine cooldown
pub const QUARANTINE_INITIAL_COOLDOWN_MS: u64 = 2_000;

/// Cooldown ceiling; doubling stops here
pub const QUARANTINE_MAX_COOLDOWN_MS: u64 = 60_000;

/// Lowest accepted poll interval
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Default poll interval when a device does not set one
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

// ============================================================================
// Pipeline Defaults
// ============================================================================

/// Control queue capacity per device shard
pub const CONTROL_QUEUE_CAPACITY: usize = 1024;

/// Messages buffered per measurement bus subscriber before drop-oldest
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Topic prefix for published snapshots
pub const MEASUREMENT_TOPIC_PREFIX: &str = "measurements/";

/// Safety loop cadence
pub const SAFETY_PERIOD_MS: u64 = 500;

/// Per (device, rule) suppression window
pub const SAFETY_HYSTERESIS_MS: u64 = 5_000;

/// Snapshot age after which a device counts as offline
pub const STALE_AFTER_MS: u64 = 10_000;

/// Period of the supervisor's status report and watchdog check
pub const STATUS_REPORT_INTERVAL_MS: u64 = 5_000;
