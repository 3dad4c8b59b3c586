//! Benchmark for device selection and quantity parsing
//!
//! Selection is a linear first-fit scan, so the interesting case is a large
//! pool where the only fitting device sits at the end.

use blockdevice_claim_operator::controller::{select_device, SelectionCriteria};
use blockdevice_claim_operator::crd::{
    parse_quantity, BlockDevice, BlockDeviceSpec, BlockDeviceStatus, ClaimState, DeviceCapacity,
    DeviceDetails, DeviceState, HOSTNAME_LABEL, RESOURCE_CAPACITY,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;

fn device(index: usize, capacity: u64) -> BlockDevice {
    let mut device = BlockDevice::new(
        &format!("bd-{:05}", index),
        BlockDeviceSpec {
            path: format!("/dev/sd{}", index),
            capacity: DeviceCapacity {
                storage: capacity,
                logical_sector_size: Some(512),
            },
            details: DeviceDetails::default(),
            claim_ref: None,
        },
    );
    let mut labels = BTreeMap::new();
    labels.insert(HOSTNAME_LABEL.to_string(), format!("node-{}", index % 16));
    device.metadata.labels = Some(labels);
    device.status = Some(BlockDeviceStatus {
        state: DeviceState::Active,
        claim_state: ClaimState::Unclaimed,
    });
    device
}

fn bench_select_device(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector");

    for size in [100usize, 1_000, 10_000] {
        // Only the last device is large enough
        let mut pool: Vec<BlockDevice> = (0..size - 1).map(|i| device(i, 1 << 20)).collect();
        pool.push(device(size - 1, 1 << 40));

        let mut requests = BTreeMap::new();
        requests.insert(RESOURCE_CAPACITY.to_string(), 1i128 << 30);
        let criteria = SelectionCriteria {
            requests,
            ..Default::default()
        };

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("worst_case", size), &pool, |b, pool| {
            b.iter(|| select_device(black_box(pool), black_box(&criteria)));
        });
    }

    group.finish();
}

fn bench_parse_quantity(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantity");
    group.throughput(Throughput::Elements(1));

    for input in ["102400", "10Gi", "1.5T", "12e6"] {
        group.bench_with_input(BenchmarkId::new("parse", input), input, |b, input| {
            b.iter(|| parse_quantity(black_box(input)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_select_device, bench_parse_quantity);
criterion_main!(benches);
