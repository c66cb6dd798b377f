//! Message cipher benchmarks for parley-core.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_core::cipher::{AssociatedData, MessageCipher};

fn bench_seal_open(c: &mut Criterion) {
    let cipher = MessageCipher::generate();
    let aad = AssociatedData::new(1, 42);

    let mut group = c.benchmark_group("cipher");
    for len in [64usize, 1000] {
        let text = "a".repeat(len);
        let sealed = cipher.encrypt(&text, &aad).unwrap();

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("encrypt_{len}"), |b| {
            b.iter(|| cipher.encrypt(black_box(&text), black_box(&aad)))
        });
        group.bench_function(format!("decrypt_{len}"), |b| {
            b.iter(|| cipher.decrypt(black_box(&sealed), black_box(&aad)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_seal_open);
criterion_main!(benches);
