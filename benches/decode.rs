//! Register decoding throughput
//!
//! Covers the per-poll hot path: decoding a register block into named
//! measurements and serializing the snapshot envelope.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use voltage_gateway::snapshot::{Snapshot, SnapshotStatus};
use voltage_gateway::{ByteOrder, DataType, ReadFunction, RegisterMap, RegisterMapping};

/// Alternating u16/i32/f32 mappings filling `quantity` registers
fn map_with(quantity: u16) -> RegisterMap {
    let mut mappings = Vec::new();
    let mut address = 0u16;
    let mut index = 0usize;
    while address < quantity {
        let data_type = match index % 3 {
            0 => DataType::U16,
            1 => DataType::I32,
            _ => DataType::F32,
        };
        if address as usize + data_type.word_count() > quantity as usize {
            break;
        }
        mappings.push(RegisterMapping::new(format!("m{index}"), address, data_type).scaled(0.1));
        address += data_type.word_count() as u16;
        index += 1;
    }
    RegisterMap::new(
        "bench",
        0,
        quantity,
        ReadFunction::Holding,
        ByteOrder::BigEndian,
        mappings,
    )
    .unwrap()
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for quantity in [10u16, 60, 125] {
        let map = map_with(quantity);
        let raw: Vec<u16> = (0..quantity).map(|i| i.wrapping_mul(257)).collect();
        group.throughput(Throughput::Elements(quantity as u64));
        group.bench_with_input(BenchmarkId::from_parameter(quantity), &raw, |b, raw| {
            b.iter(|| map.decode(black_box(raw)))
        });
    }
    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let map = map_with(125);
    let raw: Vec<u16> = (0..125u16).collect();
    let decoded = map.decode(&raw);
    let snapshot = Snapshot::new("meter_1", 42, decoded.values, SnapshotStatus::Ok);

    c.bench_function("envelope_125_registers", |b| {
        b.iter(|| black_box(&snapshot).to_json().unwrap())
    });
}

criterion_group!(benches, bench_decode, bench_envelope);
criterion_main!(benches);
