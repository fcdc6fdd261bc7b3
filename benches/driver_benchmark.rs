use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::collections::BTreeMap;
use std::hint::black_box;
use tagkv::backend::{Driver, FileConfig, FileDriver, MemoryDriver};
use tagkv::config::FileLayout;
use tagkv::serialization::Format;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn batch(n: usize) -> BTreeMap<String, serde_json::Value> {
    (0..n)
        .map(|i| (format!("key_{}", i), json!({"id": i, "name": "entry"})))
        .collect()
}

fn bench_memory(c: &mut Criterion) {
    let rt = runtime();
    let driver = MemoryDriver::new();
    rt.block_on(driver.write_all(batch(1_000), &["bench"], true));

    c.bench_function("memory/read_tagged", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(driver.read(black_box("key_500")).await) });
    });
    c.bench_function("memory/write_tagged", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(driver.write("key_hot", json!(1), &["bench", "hot"]).await)
        });
    });
}

fn bench_files(c: &mut Criterion) {
    let rt = runtime();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut group = c.benchmark_group("file/read");

    for (name, config) in [
        (
            "compact_native",
            FileConfig::new(dir.path().join("compact.bin"), FileLayout::Compact),
        ),
        (
            "compact_json",
            FileConfig::new(dir.path().join("compact.json"), FileLayout::Compact)
                .with_format(Format::Json),
        ),
        (
            "distributed_spread2",
            FileConfig::new(dir.path().join("distributed"), FileLayout::Distributed)
                .with_spread(2),
        ),
    ] {
        let driver = FileDriver::new(config).expect("driver");
        rt.block_on(driver.write_all(batch(200), &["bench"], true));
        group.bench_with_input(BenchmarkId::from_parameter(name), &driver, |b, driver| {
            b.to_async(&rt)
                .iter(|| async { black_box(driver.read(black_box("key_100")).await) });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_memory, bench_files);
criterion_main!(benches);
