//! Wire framing for RTU and TCP
//!
//! - **RTU**: `slave | PDU | CRC16 (low byte first)`
//! - **TCP**: `transaction id | protocol id (0) | length | unit id | PDU`

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC16/Modbus of `data`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

// ============================================================================
// RTU
// ============================================================================

/// Build an RTU request frame.
///
/// ```rust
/// use voltage_gateway::frame::rtu_frame;
///
/// let frame = rtu_frame(0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
/// assert_eq!(&frame[..], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
/// ```
pub fn rtu_frame(slave_id: u8, pdu: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(pdu.len() + 3);
    frame.put_u8(slave_id);
    frame.put_slice(pdu);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame.freeze()
}

/// Total RTU response length, given its first three bytes.
///
/// The third byte is the exception code, the byte count of a read reply,
/// or the high address byte of a write echo.
pub fn rtu_response_len(header: [u8; 3]) -> usize {
    let fc = header[1];
    if fc & EXCEPTION_FLAG != 0 {
        MIN_RTU_RESPONSE
    } else if fc == FC_READ_HOLDING_REGISTERS || fc == FC_READ_INPUT_REGISTERS {
        3 + header[2] as usize + 2
    } else {
        // write echo: slave + fc + addr(2) + value/qty(2) + crc(2)
        8
    }
}

/// Verify CRC and slave id of a complete RTU response; returns its PDU.
pub fn rtu_unframe(frame: &[u8], expected_slave: u8) -> ModbusResult<&[u8]> {
    if frame.len() < MIN_RTU_RESPONSE {
        return Err(ModbusError::ShortRead {
            expected: MIN_RTU_RESPONSE,
            got: frame.len(),
        });
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(ModbusError::Crc { computed, received });
    }
    if body[0] != expected_slave {
        return Err(ModbusError::framing(format!(
            "reply from slave {}, expected {}",
            body[0], expected_slave
        )));
    }
    Ok(&body[1..])
}

// ============================================================================
// TCP (MBAP)
// ============================================================================

/// Build an MBAP request frame
pub fn mbap_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16(pdu.len() as u16 + 1);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    frame.freeze()
}

/// Parsed MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(header: &[u8; MBAP_HEADER_LEN]) -> ModbusResult<Self> {
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        if protocol_id != 0 {
            return Err(ModbusError::framing(format!(
                "MBAP protocol id {protocol_id}, expected 0"
            )));
        }
        let length = u16::from_be_bytes([header[4], header[5]]);
        if length < 2 || length as usize > MAX_MBAP_LENGTH {
            return Err(ModbusError::framing(format!("MBAP length {length} out of range")));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([header[0], header[1]]),
            length,
            unit_id: header[6],
        })
    }

    /// Bytes of PDU following the header
    #[inline]
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_known_frame() {
        // 01 03 00 00 00 0A -> CRC C5 CD on the wire
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
    }

    #[test]
    fn test_rtu_unframe_checks_crc_and_slave() {
        let frame = rtu_frame(0x11, &[0x03, 0x02, 0x00, 0x2A]);
        assert_eq!(rtu_unframe(&frame, 0x11).unwrap(), &[0x03, 0x02, 0x00, 0x2A]);

        assert!(matches!(
            rtu_unframe(&frame, 0x12),
            Err(ModbusError::Framing { .. })
        ));

        let mut corrupted = frame.to_vec();
        corrupted[3] ^= 0xFF;
        assert!(matches!(
            rtu_unframe(&corrupted, 0x11),
            Err(ModbusError::Crc { .. })
        ));
    }

    #[test]
    fn test_rtu_response_len() {
        assert_eq!(rtu_response_len([0x01, 0x83, 0x02]), 5);
        assert_eq!(rtu_response_len([0x01, 0x03, 0x04]), 9);
        assert_eq!(rtu_response_len([0x01, 0x06, 0x03]), 8);
        assert_eq!(rtu_response_len([0x01, 0x10, 0x03]), 8);
    }

    #[test]
    fn test_mbap_frame_and_header() {
        let frame = mbap_frame(0x0102, 7, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(
            &frame[..],
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x07, 0x03, 0x00, 0x00, 0x00, 0x01]
        );

        let mut header = [0u8; MBAP_HEADER_LEN];
        header.copy_from_slice(&frame[..MBAP_HEADER_LEN]);
        let parsed = MbapHeader::parse(&header).unwrap();
        assert_eq!(parsed.transaction_id, 0x0102);
        assert_eq!(parsed.unit_id, 7);
        assert_eq!(parsed.pdu_len(), 5);
    }

    #[test]
    fn test_mbap_rejects_bad_protocol() {
        let header = [0, 1, 0, 1, 0, 6, 1];
        assert!(MbapHeader::parse(&header).is_err());
        let header = [0, 1, 0, 0, 0x01, 0x00, 1];
        assert!(MbapHeader::parse(&header).is_err());
    }
}
