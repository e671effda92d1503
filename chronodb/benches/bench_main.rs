use chronodb::codec::temporal_key;
use chronodb::TIMESTAMP_MAX;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

/// Performance benchmarks for the temporal key codec: encoding, decoding,
/// and raw ordered comparison, across key sizes.

fn generate_key(size: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| char::from(rng.gen_range(b'a'..=b'z'))).collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("temporal_key_encode");

    for size in [8, 32, 128, 512, 2048] {
        let key = generate_key(size);
        group.throughput(Throughput::Bytes((size + 8 + 2 + 8) as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &key, |b, key| {
            b.iter(|| {
                temporal_key::encode(black_box("keyspace"), black_box(key), black_box(42))
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("temporal_key_decode");

    for size in [8, 32, 128, 512, 2048] {
        let key = generate_key(size);
        let encoded = temporal_key::encode("keyspace", &key, TIMESTAMP_MAX).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| temporal_key::decode(black_box(encoded)).unwrap());
        });
    }
    group.finish();
}

fn bench_compare(c: &mut Criterion) {
    let mut group = c.benchmark_group("temporal_key_compare");

    for size in [8, 128, 2048] {
        let key = generate_key(size);
        let lhs = temporal_key::encode("keyspace", &key, 41).unwrap();
        let rhs = temporal_key::encode("keyspace", &key, 42).unwrap();
        group.bench_with_input(
            BenchmarkId::new("compare_adjacent_versions", size),
            &(lhs, rhs),
            |b, (lhs, rhs)| {
                b.iter(|| black_box(lhs).cmp(black_box(rhs)));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_compare);
criterion_main!(benches);
