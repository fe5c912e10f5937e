use criterion::{BenchmarkId, Criterion, Throughput};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use roundmpc::{bloom::BloomFilter, field::Field, shamir};

pub fn primitives_benchmark(c: &mut Criterion) {
    let field = Field::default();
    let mut g = c.benchmark_group("primitives");

    for size in [1 << 10, 1 << 14] {
        g.throughput(Throughput::Elements(size as u64));
        let filter = BloomFilter::with_items(size, 4, &items(size / 8)).unwrap();
        g.bench_with_input(
            BenchmarkId::new("share filter for 5 privacy peers", size),
            &filter,
            |b, filter| {
                let mut rng = ChaCha20Rng::seed_from_u64(42);
                b.iter(|| shamir::share_all(field, filter.entries(), 2, 5, &mut rng))
            },
        );
    }

    let items = items(1000);
    g.throughput(Throughput::Elements(items.len() as u64));
    g.bench_function("insert 1000 items", |b| {
        b.iter(|| BloomFilter::with_items(1 << 14, 4, &items).unwrap())
    });
}

fn items(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect()
}
