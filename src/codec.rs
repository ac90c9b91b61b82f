//! # Modbus Codec
//!
//! Turns a [`BusOp`] into a request PDU and checks the response PDU against
//! the request that produced it.
//!
//! | Operation | FC | Normal response |
//! |-----------|----|-----------------|
//! | `ReadRegisters` | 0x03 / 0x04 | fc, byte count, N × 2 bytes |
//! | `WriteSingle` | 0x06 | echo of address and value |
//! | `WriteMultiple` | 0x10 | address and quantity |
//!
//! Validation here is strict: a response for the wrong function, a byte count
//! that does not match the requested quantity, or a write echo that differs
//! from the request is a framing error and will be retried by the arbiter.

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{ModbusPdu, PduBuilder};

/// Register read function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ReadFunction {
    /// FC03
    Holding,
    /// FC04
    Input,
}

impl ReadFunction {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            Self::Holding => FC_READ_HOLDING_REGISTERS,
            Self::Input => FC_READ_INPUT_REGISTERS,
        }
    }
}

impl TryFrom<u8> for ReadFunction {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            FC_READ_HOLDING_REGISTERS => Ok(Self::Holding),
            FC_READ_INPUT_REGISTERS => Ok(Self::Input),
            other => Err(format!(
                "function_code {other} is not supported (expected 3 or 4)"
            )),
        }
    }
}

impl From<ReadFunction> for u8 {
    fn from(function: ReadFunction) -> Self {
        function.code()
    }
}

/// One bus transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    ReadRegisters {
        address: u16,
        quantity: u16,
        function: ReadFunction,
    },
    WriteSingle {
        address: u16,
        value: u16,
    },
    WriteMultiple {
        address: u16,
        values: Vec<u16>,
    },
}

impl BusOp {
    pub fn read(function: ReadFunction, address: u16, quantity: u16) -> Self {
        Self::ReadRegisters {
            address,
            quantity,
            function,
        }
    }

    #[inline]
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadRegisters { function, .. } => function.code(),
            Self::WriteSingle { .. } => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultiple { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    #[inline]
    pub fn address(&self) -> u16 {
        match self {
            Self::ReadRegisters { address, .. }
            | Self::WriteSingle { address, .. }
            | Self::WriteMultiple { address, .. } => *address,
        }
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::ReadRegisters { .. })
    }

    /// Reject operations that could never be valid on the wire
    pub fn validate(&self) -> ModbusResult<()> {
        match self {
            Self::ReadRegisters {
                address, quantity, ..
            } => {
                if *quantity == 0 || *quantity as usize > MAX_READ_REGISTERS {
                    return Err(ModbusError::invalid_data(format!(
                        "read quantity {quantity} outside 1..={MAX_READ_REGISTERS}"
                    )));
                }
                check_address_span(*address, *quantity as usize)
            }
            Self::WriteSingle { .. } => Ok(()),
            Self::WriteMultiple { address, values } => {
                if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
                    return Err(ModbusError::invalid_data(format!(
                        "write quantity {} outside 1..={MAX_WRITE_REGISTERS}",
                        values.len()
                    )));
                }
                check_address_span(*address, values.len())
            }
        }
    }
}

fn check_address_span(address: u16, count: usize) -> ModbusResult<()> {
    if address as usize + count > u16::MAX as usize + 1 {
        return Err(ModbusError::invalid_data(format!(
            "register span {address}+{count} exceeds the address space"
        )));
    }
    Ok(())
}

/// Result of a successful transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusReply {
    Registers(Vec<u16>),
    Written,
}

impl BusReply {
    pub fn into_registers(self) -> ModbusResult<Vec<u16>> {
        match self {
            Self::Registers(regs) => Ok(regs),
            Self::Written => Err(ModbusError::invalid_data("write reply carries no registers")),
        }
    }
}

/// Request/response PDU codec.
pub struct ModbusCodec;

impl ModbusCodec {
    /// Build the request PDU for `op`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use voltage_gateway::codec::{BusOp, ModbusCodec, ReadFunction};
    ///
    /// let pdu = ModbusCodec::encode_request(&BusOp::read(ReadFunction::Holding, 0, 10)).unwrap();
    /// assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x00, 0x00, 0x0A]);
    /// ```
    pub fn encode_request(op: &BusOp) -> ModbusResult<ModbusPdu> {
        op.validate()?;
        match op {
            BusOp::ReadRegisters {
                address,
                quantity,
                function,
            } => PduBuilder::build_read_request(function.code(), *address, *quantity),
            BusOp::WriteSingle { address, value } => {
                PduBuilder::build_write_single_register(*address, *value)
            }
            BusOp::WriteMultiple { address, values } => {
                PduBuilder::build_write_multiple_registers(*address, values)
            }
        }
    }

    /// Length of the normal (non-exception) response PDU for `op`
    pub fn response_pdu_len(op: &BusOp) -> usize {
        match op {
            BusOp::ReadRegisters { quantity, .. } => 2 + 2 * *quantity as usize,
            BusOp::WriteSingle { .. } | BusOp::WriteMultiple { .. } => 5,
        }
    }

    /// Check a response PDU against the request and extract its payload.
    pub fn decode_response(op: &BusOp, pdu: &[u8]) -> ModbusResult<BusReply> {
        let expected_len = Self::response_pdu_len(op);
        let Some(&fc) = pdu.first() else {
            return Err(ModbusError::ShortRead {
                expected: expected_len,
                got: 0,
            });
        };

        let request_fc = op.function_code();
        if fc & EXCEPTION_FLAG != 0 {
            if fc & !EXCEPTION_FLAG != request_fc {
                return Err(ModbusError::framing(format!(
                    "exception for function {:#04x}, request was {:#04x}",
                    fc & !EXCEPTION_FLAG,
                    request_fc
                )));
            }
            let code = pdu.get(1).copied().ok_or(ModbusError::ShortRead {
                expected: 2,
                got: pdu.len(),
            })?;
            return Err(ModbusError::exception(fc, code));
        }

        if fc != request_fc {
            return Err(ModbusError::framing(format!(
                "function code mismatch: expected {request_fc:#04x}, got {fc:#04x}"
            )));
        }

        match op {
            BusOp::ReadRegisters { quantity, .. } => {
                let Some(&byte_count) = pdu.get(1) else {
                    return Err(ModbusError::ShortRead {
                        expected: expected_len,
                        got: pdu.len(),
                    });
                };
                if byte_count as usize != 2 * *quantity as usize {
                    return Err(ModbusError::framing(format!(
                        "byte count {} does not match {} requested registers",
                        byte_count, quantity
                    )));
                }
                if pdu.len() < expected_len {
                    return Err(ModbusError::ShortRead {
                        expected: expected_len,
                        got: pdu.len(),
                    });
                }
                let registers = pdu[2..expected_len]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(BusReply::Registers(registers))
            }
            BusOp::WriteSingle { address, value } => {
                Self::check_echo(pdu, *address, *value)?;
                Ok(BusReply::Written)
            }
            BusOp::WriteMultiple { address, values } => {
                Self::check_echo(pdu, *address, values.len() as u16)?;
                Ok(BusReply::Written)
            }
        }
    }

    fn check_echo(pdu: &[u8], address: u16, second: u16) -> ModbusResult<()> {
        if pdu.len() < 5 {
            return Err(ModbusError::ShortRead {
                expected: 5,
                got: pdu.len(),
            });
        }
        let echo_address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let echo_second = u16::from_be_bytes([pdu[3], pdu[4]]);
        if echo_address != address || echo_second != second {
            return Err(ModbusError::framing(format!(
                "write echo {echo_address}/{echo_second} does not match request {address}/{second}"
            )));
        }
        Ok(())
    }
}
