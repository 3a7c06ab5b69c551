//! `PdoMap` lookup and process-image codec benchmarks.
//!
//! Both are on the Cyclic Worker's hot path (read statusword / write
//! controlword once per slave per cycle) so their cost has to stay
//! negligible next to the cycle budget.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use ethercat_common::pdo::{read_i32, read_u16, write_i32, write_u16, PdoMap};

fn populated_map() -> PdoMap {
    let mut map = PdoMap::new();
    map.register_rx(0x6040, 0, 0, 16);
    map.register_rx(0x6060, 0, 2, 8);
    map.register_rx(0x607A, 0, 3, 32);
    map.register_rx(0x60FF, 0, 7, 32);
    map.register_tx(0x6041, 0, 0, 16);
    map.register_tx(0x6061, 0, 2, 8);
    map.register_tx(0x6064, 0, 3, 32);
    map.register_tx(0x606C, 0, 7, 32);
    map
}

fn bench_offset_lookup(c: &mut Criterion) {
    let map = populated_map();

    c.bench_function("pdo_map_rx_offset_hit", |b| {
        b.iter(|| black_box(map.rx_offset(black_box(0x607A), black_box(0))));
    });

    c.bench_function("pdo_map_tx_offset_miss", |b| {
        b.iter(|| black_box(map.tx_offset(black_box(0x2000), black_box(0))));
    });
}

fn bench_codec(c: &mut Criterion) {
    let mut image = [0u8; 16];

    c.bench_function("pdo_write_u16", |b| {
        b.iter(|| write_u16(&mut image, black_box(0), black_box(0x002F)));
    });

    c.bench_function("pdo_read_u16", |b| {
        b.iter(|| black_box(read_u16(&image, black_box(0))));
    });

    c.bench_function("pdo_write_i32", |b| {
        b.iter(|| write_i32(&mut image, black_box(3), black_box(-123_456)));
    });

    c.bench_function("pdo_read_i32", |b| {
        b.iter(|| black_box(read_i32(&image, black_box(3))));
    });
}

criterion_group!(benches, bench_offset_lookup, bench_codec);
criterion_main!(benches);
