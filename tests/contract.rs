//! Behaviour every driver must share, run against each locally available backend.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tagkv::backend::{
    ClearScope, CompactFileDriver, Driver, DistributedFileDriver, FileConfig, MemoryDriver,
    Session, SessionDriver,
};
use tagkv::config::FileLayout;
use tagkv::observability::NoOpSink;
use tagkv::serialization::Format;
use tagkv::{ManualClock, Value};
use tempfile::TempDir;

const START: u64 = 1_700_000_000_000_000;

struct Fixture<D> {
    driver: D,
    clock: Arc<ManualClock>,
    _dir: Option<TempDir>,
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START))
}

async fn memory(ttl: Option<Duration>) -> Fixture<MemoryDriver> {
    let clock = clock();
    Fixture {
        driver: MemoryDriver::with_clock(ttl, clock.clone()).with_sink(Arc::new(NoOpSink)),
        clock,
        _dir: None,
    }
}

async fn session(ttl: Option<Duration>) -> Fixture<SessionDriver> {
    let clock = clock();
    Fixture {
        driver: SessionDriver::with_clock(Session::new(), "contract", ttl, clock.clone())
            .with_sink(Arc::new(NoOpSink)),
        clock,
        _dir: None,
    }
}

async fn compact(format: Format, ttl: Option<Duration>) -> Fixture<CompactFileDriver> {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = clock();
    let config = FileConfig::new(dir.path().join("store"), FileLayout::Compact)
        .with_format(format)
        .with_ttl(ttl);
    Fixture {
        driver: CompactFileDriver::with_clock(config, clock.clone())
            .expect("driver")
            .with_sink(Arc::new(NoOpSink)),
        clock,
        _dir: Some(dir),
    }
}

async fn compact_native(ttl: Option<Duration>) -> Fixture<CompactFileDriver> {
    compact(Format::Native, ttl).await
}

async fn compact_json(ttl: Option<Duration>) -> Fixture<CompactFileDriver> {
    compact(Format::Json, ttl).await
}

async fn compact_xml(ttl: Option<Duration>) -> Fixture<CompactFileDriver> {
    compact(Format::Xml, ttl).await
}

async fn distributed(ttl: Option<Duration>) -> Fixture<DistributedFileDriver> {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = clock();
    let config = FileConfig::new(dir.path().join("store"), FileLayout::Distributed)
        .with_spread(2)
        .with_ttl(ttl);
    Fixture {
        driver: DistributedFileDriver::with_clock(config, clock.clone())
            .expect("driver")
            .with_sink(Arc::new(NoOpSink)),
        clock,
        _dir: Some(dir),
    }
}

async fn distributed_hashed_yaml(ttl: Option<Duration>) -> Fixture<DistributedFileDriver> {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = clock();
    let config = FileConfig::new(dir.path().join("store"), FileLayout::Distributed)
        .with_spread(3)
        .with_hash_file_name(true)
        .with_format(Format::Yaml)
        .with_ttl(ttl);
    Fixture {
        driver: DistributedFileDriver::with_clock(config, clock.clone())
            .expect("driver")
            .with_sink(Arc::new(NoOpSink)),
        clock,
        _dir: Some(dir),
    }
}

#[cfg(feature = "database")]
async fn database(ttl: Option<Duration>) -> Fixture<tagkv::backend::DatabaseDriver> {
    use tagkv::backend::{DatabaseConfig, DatabaseDriver};

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("sqlite");
    let clock = clock();
    let config = DatabaseConfig::new("kv")
        .with_tag_table("kv_tags")
        .with_ttl(ttl);
    let driver = DatabaseDriver::with_clock(pool, config, clock.clone())
        .expect("driver")
        .with_sink(Arc::new(NoOpSink));
    driver.ensure_schema().await.expect("schema");
    Fixture {
        driver,
        clock,
        _dir: None,
    }
}

/// A value of the richest shape the driver accepts.
fn sample<D: Driver>(driver: &D, n: u64) -> Value {
    if driver.capabilities().multi_value {
        json!({"n": n, "list": [1, "two", 3.5, null, true], "nested": {"k": "v"}})
    } else {
        json!(format!("value-{}", n))
    }
}

fn text(s: &str) -> Value {
    json!(s)
}

async fn round_trip<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    for (i, key) in ["a", "user_42", "mail@host.example", "x-y+z~w=v"].iter().enumerate() {
        let value = sample(d, i as u64);
        assert!(d.write(key, value.clone(), &[]).await, "write {}", key);
        assert_eq!(d.read(key).await, Some(value), "read {}", key);
        assert!(d.exist(key).await);
    }
    assert_eq!(d.read("never_written").await, None);
    assert!(!d.exist("never_written").await);
}

async fn tag_invalidation<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    assert!(d.write("a", text("1"), &["T"]).await);
    assert_eq!(d.read("a").await, Some(text("1")));
    d.clear(ClearScope::Tags(&["T"])).await;
    assert_eq!(d.read("a").await, None);
    assert!(!d.exist("a").await);

    f.clock.advance(Duration::from_micros(1));
    assert!(d.write("a", text("2"), &["T"]).await);
    assert_eq!(d.read("a").await, Some(text("2")));
}

async fn tag_isolation<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    d.write("a", text("1"), &["T1"]).await;
    d.write("b", text("2"), &["T2"]).await;
    d.write("c", text("3"), &[]).await;
    d.write("both", text("4"), &["T1", "T2"]).await;
    d.clear(ClearScope::parse(&["T1"])).await;
    assert_eq!(d.read("a").await, None);
    assert_eq!(d.read("both").await, None);
    assert_eq!(d.read("b").await, Some(text("2")));
    assert_eq!(d.read("c").await, Some(text("3")));
}

async fn sibling_writes<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    d.write("first", text("1"), &["shared"]).await;
    f.clock.advance(Duration::from_secs(3));
    d.write("second", text("2"), &["shared"]).await;
    assert_eq!(d.read("first").await, Some(text("1")));
    assert_eq!(d.read("second").await, Some(text("2")));
}

async fn ttl_expiry<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    d.write("a", text("1"), &[]).await;
    f.clock.advance(Duration::from_millis(500));
    assert_eq!(d.read("a").await, Some(text("1")));
    f.clock.advance(Duration::from_millis(501));
    assert_eq!(d.read("a").await, None);
    assert!(!d.exist("a").await);
}

async fn batch_ordering<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    let values: BTreeMap<String, Value> = (0..1_000)
        .map(|i| (format!("k{}", i), text("v")))
        .collect();
    assert!(d.write_all(values, &["fresh_tag"], false).await);
    for i in [0, 1, 499, 998, 999] {
        assert_eq!(d.read(&format!("k{}", i)).await, Some(text("v")), "k{}", i);
    }
    if d.capabilities().enumerable {
        assert_eq!(d.read_all().await.len(), 1_000);
    }
}

async fn overwrite_whole_storage<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    let first = BTreeMap::from([("a".to_string(), text("1")), ("b".to_string(), text("2"))]);
    assert!(d.write_all(first, &[], true).await);
    let second = BTreeMap::from([("a".to_string(), text("9"))]);
    assert!(d.write_all(second.clone(), &[], true).await);
    assert_eq!(d.read("a").await, Some(text("9")));
    assert_eq!(d.read("b").await, None);
    if d.capabilities().enumerable {
        assert_eq!(d.read_all().await, second);
    }
}

async fn wildcard_clear<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    for i in 0..10 {
        let tag = format!("t{}", i % 3);
        d.write(&format!("k{}", i), text("v"), &[tag.as_str()]).await;
    }
    d.clear(ClearScope::parse(&["*"])).await;
    assert!(d.read_all().await.is_empty());
    for i in 0..10 {
        assert_eq!(d.read(&format!("k{}", i)).await, None);
    }
    assert!(d.write("after", text("v"), &["t0"]).await);
    assert_eq!(d.read("after").await, Some(text("v")));
}

async fn idempotent_delete<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    assert!(d.delete("missing-key").await);
    d.write("k", text("v"), &[]).await;
    assert!(d.delete("k").await);
    assert!(d.delete("k").await);
    assert_eq!(d.read("k").await, None);
}

async fn key_validation<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    let long = "k".repeat(300);
    let values = BTreeMap::from([
        ("good".to_string(), text("ok")),
        ("bad/key".to_string(), text("x")),
        ("ctl\u{7}".to_string(), text("x")),
        ("..".to_string(), text("x")),
        (long.clone(), text("x")),
    ]);
    assert!(!d.write_all(values, &[], false).await);
    assert_eq!(d.read("good").await, Some(text("ok")));
    assert_eq!(d.read("bad/key").await, None);
    assert_eq!(d.read(&long).await, None);
    assert!(!d.exist("bad/key").await);
    if d.capabilities().enumerable {
        assert_eq!(d.read_all().await.len(), 1);
    }
    assert!(!d.write("k", text("v"), &["bad tag"]).await);
    assert_eq!(d.read("k").await, None);
}

async fn garbage_collection<D: Driver>(f: Fixture<D>) {
    let d = &f.driver;
    d.write("old", text("1"), &["gone"]).await;
    d.write("kept", text("2"), &["stays"]).await;
    d.clear(ClearScope::Tags(&["gone"])).await;
    d.garbage_collection().await;
    assert_eq!(d.read("old").await, None);
    assert_eq!(d.read("kept").await, Some(text("2")));
}

macro_rules! contract_tests {
    ($($driver:ident),* $(,)?) => {
        $(
            mod $driver {
                use super::*;

                #[tokio::test]
                async fn round_trip() {
                    super::round_trip(super::$driver(None).await).await;
                }

                #[tokio::test]
                async fn tag_invalidation() {
                    super::tag_invalidation(super::$driver(None).await).await;
                }

                #[tokio::test]
                async fn tag_isolation() {
                    super::tag_isolation(super::$driver(None).await).await;
                }

                #[tokio::test]
                async fn sibling_writes() {
                    super::sibling_writes(super::$driver(None).await).await;
                }

                #[tokio::test]
                async fn ttl_expiry() {
                    super::ttl_expiry(super::$driver(Some(Duration::from_secs(1))).await).await;
                }

                #[tokio::test]
                async fn batch_ordering() {
                    super::batch_ordering(super::$driver(None).await).await;
                }

                #[tokio::test]
                async fn overwrite_whole_storage() {
                    super::overwrite_whole_storage(super::$driver(None).await).await;
                }

                #[tokio::test]
                async fn wildcard_clear() {
                    super::wildcard_clear(super::$driver(None).await).await;
                }

                #[tokio::test]
                async fn idempotent_delete() {
                    super::idempotent_delete(super::$driver(None).await).await;
                }

                #[tokio::test]
                async fn key_validation() {
                    super::key_validation(super::$driver(None).await).await;
                }

                #[tokio::test]
                async fn garbage_collection() {
                    super::garbage_collection(super::$driver(None).await).await;
                }
            }
        )*
    };
}

contract_tests!(
    memory,
    session,
    compact_native,
    compact_json,
    compact_xml,
    distributed,
    distributed_hashed_yaml,
);

#[cfg(feature = "database")]
contract_tests!(database);
