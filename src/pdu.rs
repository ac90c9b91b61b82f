//! Stack-allocated Modbus PDU
//!
//! A PDU never exceeds 253 bytes, so requests are built in a fixed array
//! instead of a heap buffer. The codec builds the PDU and transports frame it
//! for the wire (RTU: slave + PDU + CRC, TCP: MBAP + PDU).

use crate::constants::{
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE,
};
use crate::error::{ModbusError, ModbusResult};

/// PDU buffer: function code followed by payload
#[derive(Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::invalid_data("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        if self.len + 2 > MAX_PDU_SIZE {
            return Err(ModbusError::invalid_data("PDU buffer full"));
        }
        self.data[self.len..self.len + 2].copy_from_slice(&value.to_be_bytes());
        self.len += 2;
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusPdu")
            .field("data", &self.as_slice())
            .finish()
    }
}

/// PDU builder - fluent API
#[derive(Default)]
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn words(mut self, values: &[u16]) -> ModbusResult<Self> {
        for &value in values {
            self.pdu.push_u16(value)?;
        }
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }

    /// FC03/FC04 request
    ///
    /// # Arguments
    /// * `fc` - 3 (holding) or 4 (input)
    /// * `start_address` - First register
    /// * `quantity` - Register count
    pub fn build_read_request(
        fc: u8,
        start_address: u16,
        quantity: u16,
    ) -> ModbusResult<ModbusPdu> {
        if fc != FC_READ_HOLDING_REGISTERS && fc != FC_READ_INPUT_REGISTERS {
            return Err(ModbusError::invalid_data(format!(
                "function code {fc:#04x} is not a register read"
            )));
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .word(start_address)?
            .word(quantity)?
            .build())
    }

    /// FC06 request
    pub fn build_write_single_register(address: u16, value: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .word(address)?
            .word(value)?
            .build())
    }

    /// FC16 request: address, quantity, byte count, then the words
    pub fn build_write_multiple_registers(address: u16, values: &[u16]) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .word(address)?
            .word(values.len() as u16)?
            .byte((values.len() * 2) as u8)?
            .words(values)?
            .build())
    }
}
