// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Background-fill throughput benchmarks.
//
// Run with:
//   cargo bench --bench fill
//
// Groups:
//   fill_u8    — byte fill at 1/4/8 threads
//   fill_u64   — 64-bit word fill at 1/4/8 threads
//   dispatch   — the dtype dispatch entry point on a worker-sized buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use voxbroker::dtype::DType;
use voxbroker::fill::{fill_background, fill_u64, fill_u8};

/// A typical worker result buffer: 256 x 256 x 16 voxels.
const BUF_BYTES: usize = 256 * 256 * 16;

const THREADS: &[usize] = &[1, 4, 8];

fn bench_fill_u8(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_u8");
    group.throughput(Throughput::Bytes(BUF_BYTES as u64));

    let mut buf = vec![0u8; BUF_BYTES];
    for &threads in THREADS {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &t| {
            b.iter(|| {
                fill_u8(black_box(&mut buf), 0xAB, t);
            });
        });
    }
    group.finish();
}

fn bench_fill_u64(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_u64");
    group.throughput(Throughput::Bytes(BUF_BYTES as u64));

    let mut words = vec![0u64; BUF_BYTES / 8];
    for &threads in THREADS {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &t| {
            b.iter(|| {
                fill_u64(black_box(&mut words), 0xDEAD_BEEF_0000_0001, t);
            });
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Bytes(BUF_BYTES as u64));

    let mut buf = vec![0u8; BUF_BYTES];
    let cases: &[(&str, DType, u64)] = &[
        ("zero_u8", DType::U8, 0),
        ("nonzero_u8", DType::U8, 7),
        ("nonzero_u64", DType::U64, 7),
        ("nonzero_u16_scalar", DType::U16, 7),
    ];
    for &(label, dtype, value) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(label), &value, |b, &v| {
            b.iter(|| {
                fill_background(black_box(&mut buf), dtype, v, 8);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fill_u8, bench_fill_u64, bench_dispatch);
criterion_main!(benches);
