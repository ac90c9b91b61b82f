//! Decoding never panics, whatever the block contents or length.

#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_gateway::snapshot::SnapshotStatus;
use voltage_gateway::{ByteOrder, DataType, ReadFunction, RegisterMap, RegisterMapping};

fuzz_target!(|raw: Vec<u16>| {
    let Ok(map) = RegisterMap::new(
        "fuzz",
        0,
        8,
        ReadFunction::Holding,
        ByteOrder::LittleEndian,
        vec![
            RegisterMapping::new("a", 0, DataType::U16),
            RegisterMapping::new("b", 1, DataType::I16).scaled(0.1),
            RegisterMapping::new("c", 2, DataType::U32),
            RegisterMapping::new("d", 4, DataType::I32).scaled(-2.0),
            RegisterMapping::new("e", 6, DataType::F32),
        ],
    ) else {
        return;
    };

    let decoded = map.decode(&raw);
    if raw.len() >= 8 {
        assert_eq!(decoded.status, SnapshotStatus::Ok);
        assert_eq!(decoded.values.len(), 5);
    }
});
