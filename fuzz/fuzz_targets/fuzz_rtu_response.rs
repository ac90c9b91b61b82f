//! Arbitrary bytes as an RTU response to an arbitrary request.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_gateway::codec::{BusOp, ModbusCodec, ReadFunction};
use voltage_gateway::frame::{rtu_response_len, rtu_unframe};

#[derive(Debug, Arbitrary)]
struct Input {
    slave_id: u8,
    input_registers: bool,
    address: u16,
    quantity: u8,
    frame: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let function = if input.input_registers {
        ReadFunction::Input
    } else {
        ReadFunction::Holding
    };
    let op = BusOp::read(function, input.address, u16::from(input.quantity));

    if let [a, b, c, ..] = input.frame[..] {
        let _ = rtu_response_len([a, b, c]);
    }
    if let Ok(pdu) = rtu_unframe(&input.frame, input.slave_id) {
        if let Ok(reply) = ModbusCodec::decode_response(&op, pdu) {
            if let Ok(registers) = reply.into_registers() {
                assert_eq!(registers.len(), usize::from(input.quantity));
            }
        }
    }
});
