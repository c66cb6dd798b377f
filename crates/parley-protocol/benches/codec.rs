//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, ClientFrame};

fn message_frame(len: usize) -> ClientFrame {
    ClientFrame::SendMessage {
        exchange_id: 42,
        text: "a".repeat(len),
    }
}

fn bench_encode(c: &mut Criterion) {
    let frame = message_frame(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("msgpack_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode_json(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = message_frame(64);
    let encoded = codec::encode(&frame).unwrap();
    let json = codec::encode_json(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::decode::<ClientFrame>(black_box(&encoded)))
    });
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::decode_json::<ClientFrame>(black_box(&json)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let frame = message_frame(1000);

    c.bench_function("roundtrip_max_message", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode::<ClientFrame>(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_roundtrip);
criterion_main!(benches);
