//! Durable local storage
//!
//! A small key/value contract backs queue persistence; retrieved files live
//! on disk in the artifact store.

pub mod artifacts;
pub mod error;
pub mod kv;
pub mod sqlite;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use error::{StoreError, StoreResult};
pub use kv::{load_json, save_json, KeyValueStore, MemoryStore};
pub use sqlite::SqliteStore;

use std::sync::Arc;

/// Open the store named by a config `store_path`: ":memory:" selects the
/// in-process map, anything else is treated as a SQLite URL.
pub async fn open(store_path: &str) -> StoreResult<Arc<dyn KeyValueStore>> {
    if store_path == ":memory:" {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Ok(Arc::new(SqliteStore::new(store_path).await?))
    }
}
