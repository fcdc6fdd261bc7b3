//! Basic usage of the storage drivers.

use serde_json::json;
use std::collections::BTreeMap;
use tagkv::backend::{
    ClearScope, Driver, FileConfig, FileDriver, MemoryDriver, Session, SessionDriver,
};
use tagkv::config::{FileLayout, Options};
use tagkv::error::Result;

/// Walk one driver through writes, tag invalidation and a wildcard clear.
async fn tour<D: Driver>(driver: &D) {
    let caps = driver.capabilities();
    println!(
        "   driver: {} (multi value: {}, non volatile: {}, enumerable: {})",
        driver.name(),
        caps.multi_value,
        caps.non_volatile,
        caps.enumerable
    );

    let profile = if caps.multi_value {
        json!({"name": "Ada", "langs": ["en", "fr"]})
    } else {
        json!("Ada")
    };
    driver.write("user_1", profile, &["users"]).await;
    driver.write("post_7", json!("First post"), &["posts"]).await;
    println!("   ✓ user_1 cached: {:?}", driver.read("user_1").await);

    driver.clear(ClearScope::parse(&["users"])).await;
    println!(
        "   ✓ after clearing tag users: user_1 = {:?}, post_7 = {:?}",
        driver.read("user_1").await,
        driver.read("post_7").await
    );

    let warmup = BTreeMap::from([
        ("a".to_string(), json!("1")),
        ("b".to_string(), json!("2")),
    ]);
    driver.write_all(warmup, &["warmup"], true).await;
    println!("   ✓ after warm-up: {:?}", driver.read_all().await);

    driver.clear(ClearScope::parse(&["*"])).await;
    driver.garbage_collection().await;
    println!("   ✓ after wildcard clear: {} entries\n", driver.read_all().await.len());
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== tagkv - Basic Example ===\n");

    println!("1. In-process driver:");
    tour(&MemoryDriver::new()).await;

    println!("2. Session driver:");
    let session = Session::new();
    session.start();
    tour(&SessionDriver::new(session.clone(), "demo")).await;

    let dir = std::env::temp_dir().join(format!("tagkv-demo-{}", std::process::id()));

    println!("3. Compact file driver (JSON):");
    let options = Options::from_json(&format!(
        r#"{{"Path": {:?}, "Format": "json", "Expire": 60}}"#,
        dir.join("compact.json")
    ))?;
    tour(&FileDriver::from_options(&options)?).await;

    println!("4. Distributed file driver (YAML, sharded, hashed names):");
    let config = FileConfig::new(dir.join("distributed"), FileLayout::Distributed)
        .with_format(tagkv::serialization::Format::Yaml)
        .with_spread(2)
        .with_hash_file_name(true);
    tour(&FileDriver::new(config)?).await;

    std::fs::remove_dir_all(&dir).ok();
    println!("=== Example Complete ===\n");

    Ok(())
}
