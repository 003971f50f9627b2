//! Throughput benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use linkterm_core::core::codec::{self, DisplayMode};
use linkterm_core::core::logger::{EntryKind, LogBuffer};

fn log_buffer_benchmark(c: &mut Criterion) {
    let chunk = Bytes::from(vec![b'x'; 64]);

    let mut group = c.benchmark_group("log_buffer");
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    group.bench_function("append_under_count_limit", |b| {
        let log = LogBuffer::new(usize::MAX);
        b.iter(|| {
            let entry = log.append(EntryKind::Received, black_box(chunk.clone()), "x");
            black_box(entry)
        })
    });

    group.bench_function("append_with_byte_eviction", |b| {
        let log = LogBuffer::new(16 * 1024);
        b.iter(|| {
            let entry = log.append(EntryKind::Received, black_box(chunk.clone()), "x");
            black_box(entry)
        })
    });

    group.finish();
}

fn codec_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("hex_encode", |b| {
        b.iter(|| black_box(codec::encode(black_box(&data), DisplayMode::Hex)))
    });

    group.bench_function("hex_decode", |b| {
        let text = codec::encode(&data, DisplayMode::Hex);
        b.iter(|| black_box(codec::decode(black_box(&text), DisplayMode::Hex)))
    });

    group.finish();
}

criterion_group!(benches, log_buffer_benchmark, codec_benchmark);
criterion_main!(benches);
