//! # tagkv
//!
//! A tag-invalidated key/value storage engine with interchangeable backends.
//!
//! ## Features
//!
//! - **One contract:** every backend implements [`Driver`] with the same
//!   `exist / read / read_all / write / write_all / delete / clear /
//!   garbage_collection` operations and advertises its [`Capabilities`]
//! - **Lazy tag invalidation:** clearing a tag deletes one registry row; every
//!   entry written with that tag becomes invalid on its next read
//! - **Backends:** in-process and session maps, compact and distributed file
//!   layouts, SQLite, Redis and Memcached (behind cargo features)
//! - **Never breaks the caller:** failures become misses or `false` and are
//!   reported to an [`ErrorSink`](observability::ErrorSink)
//!
//! ## Quick Start
//!
//! ```
//! use tagkv::backend::{ClearScope, Driver, MemoryDriver};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let driver = MemoryDriver::new();
//!
//! driver.write("user_1", json!({"name": "Ada"}), &["users"]).await;
//! driver.write("post_9", json!("hello"), &["posts"]).await;
//!
//! driver.clear(ClearScope::parse(&["users"])).await;
//! assert_eq!(driver.read("user_1").await, None);
//! assert_eq!(driver.read("post_9").await, Some(json!("hello")));
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod observability;
pub mod serialization;
pub mod timestamp;

// Re-exports for convenience
pub use backend::{Capabilities, ClearScope, Driver};
pub use config::Options;
pub use entry::{EntryMode, Value};
pub use error::{Error, Result};
pub use timestamp::{Clock, ManualClock, SystemClock, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
