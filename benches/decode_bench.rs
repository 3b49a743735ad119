//! Throughput of the decode pipeline on synthetic COPY payloads.
//!
//! Run with:  `cargo bench`

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pg_gpu_core::testing::{encode_numeric, CopyWriter};
use pg_gpu_decode::{oid, Decoder, DecoderConfig, StreamDecoder};

const ROWS: usize = 100_000;

fn config() -> DecoderConfig {
    let mut config = DecoderConfig::default();
    config.memory.budget_bytes = Some(1 << 30);
    config.decode.rows_per_chunk = 16_384;
    config
}

fn payload(rows: usize) -> Bytes {
    let mut writer = CopyWriter::new();
    for i in 0..rows {
        let id = (i as i64).to_be_bytes();
        let amount = encode_numeric(&format!("{}.{:02}", i * 13, i % 100));
        let memo = format!("order #{} for customer {}", i, i % 977);
        writer.row(&[Some(&id[..]), Some(&amount[..]), Some(memo.as_bytes())]);
    }
    writer.finish()
}

fn decoder() -> Decoder {
    Decoder::for_wire_types(
        config(),
        &[
            ("id", oid::INT8, -1),
            ("amount", oid::NUMERIC, ((18 << 16) | 2) + 4),
            ("memo", oid::TEXT, -1),
        ],
    )
    .unwrap()
}

fn bench_decode_copy(c: &mut Criterion) {
    let decoder = decoder();
    let data = payload(ROWS);

    let mut group = c.benchmark_group("decode_copy");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("sync", |b| {
        b.iter(|| {
            let rows: usize = decoder
                .decode_iter(black_box(data.clone()))
                .unwrap()
                .map(|batch| batch.unwrap().num_rows())
                .sum();
            black_box(rows);
        })
    });

    let runtime = tokio::runtime::Runtime::new().unwrap();
    for inflight in [1, 2, 4] {
        let mut config = config();
        config.decode.max_inflight_chunks = inflight;
        let stream = StreamDecoder::new(
            Decoder::with_memory(config, decoder.columns().to_vec(), decoder.memory().clone())
                .unwrap(),
        );
        group.bench_with_input(BenchmarkId::new("stream", inflight), &data, |b, data| {
            b.iter(|| {
                let rows = runtime.block_on(async {
                    let mut rx = stream.decode_copy(data.clone()).unwrap();
                    let mut rows = 0;
                    while let Some(batch) = rx.recv().await {
                        rows += batch.unwrap().num_rows();
                    }
                    rows
                });
                black_box(rows);
            })
        });
    }
    group.finish();
}

fn bench_numeric_only(c: &mut Criterion) {
    let decoder = Decoder::for_wire_types(config(), &[("n", oid::NUMERIC, -1)]).unwrap();
    let mut writer = CopyWriter::new();
    for i in 0..ROWS {
        writer.row(&[Some(&encode_numeric(&format!("-{}.{:09}", i, i * 7))[..])]);
    }
    let data = writer.finish();

    let mut group = c.benchmark_group("numeric");
    group.throughput(Throughput::Elements(ROWS as u64));
    group.bench_function("decimal128", |b| {
        b.iter(|| black_box(decoder.decode_copy(data.clone()).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_decode_copy, bench_numeric_only);
criterion_main!(benches);
