//! Control intake payloads either parse into a command or are rejected.

#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_gateway::control::parse_control_envelope;

fuzz_target!(|data: &[u8]| {
    let _ = parse_control_envelope(data);
});
