use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use stashcache::{Cache, EvictionPolicy, FanoutCache, Settings, DEFAULT_SHARDS};
use tempfile::TempDir;

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_1kb_inline", |b| {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let data = vec![b'x'; 1024];

        for i in 0..100 {
            cache.set(i, data.clone()).unwrap();
        }

        let mut counter = 0i64;
        b.iter(|| {
            black_box(cache.get(counter % 100).unwrap());
            counter += 1;
        });
    });

    group.bench_function("get_64kb_blob", |b| {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let data = vec![b'x'; 64 * 1024];

        for i in 0..100 {
            cache.set(i, data.clone()).unwrap();
        }

        let mut counter = 0i64;
        b.iter(|| {
            black_box(cache.get(counter % 100).unwrap());
            counter += 1;
        });
    });

    group.bench_function("get_miss", |b| {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(dir.path()).unwrap();

        let mut counter = 0i64;
        b.iter(|| {
            black_box(cache.get(counter).unwrap());
            counter += 1;
        });
    });

    group.finish();
}

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_1kb_evicting", |b| {
        let dir = TempDir::new().unwrap();
        let settings = Settings::default()
            .with_size_limit(100 * 1024)
            .with_eviction_policy(EvictionPolicy::LeastRecentlyUsed);
        let cache = Cache::open_with(dir.path(), settings).unwrap();
        let data = vec![b'x'; 1024];

        let mut counter = 0i64;
        b.iter(|| {
            black_box(cache.set(counter, data.clone()).unwrap());
            counter += 1;
        });
    });

    group.finish();
}

fn bench_mixed_50_50(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("50_read_50_write_fanout", |b| {
        let dir = TempDir::new().unwrap();
        let cache = FanoutCache::open(dir.path(), DEFAULT_SHARDS).unwrap();
        let data = vec![b'x'; 1024];

        for i in 0..100 {
            cache.set(i, data.clone()).unwrap();
        }

        let mut counter = 0i64;
        b.iter(|| {
            if counter % 2 == 0 {
                black_box(cache.get(counter % 100).ok());
            } else {
                black_box(cache.set(counter % 100, data.clone()).ok());
            }
            counter += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_get, bench_set, bench_mixed_50_50);
criterion_main!(benches);
