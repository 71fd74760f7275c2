//! Persistent local store for offline support.
//!
//! This module provides per-origin key-value databases that:
//! - Split records into named partitions, each with a key path
//! - Create partitions and secondary indexes lazily, gated by a schema version
//! - Run every operation as a transaction scoped to one partition
//! - Degrade to a no-op store when a database cannot be opened

mod schema;
mod sqlite;
mod traits;

pub use schema::{
  DatabaseSpec, IndexSpec, PartitionSpec, DEAD_LETTERS, HISTORY_DB, LOCATIONS, MUTATIONS,
  OFFLINE_DB, PROFILE, SCANS, USER_DB,
};
pub use sqlite::SqliteStore;
pub use traits::{from_record, to_record, Key, LocalStore, NoopStore};

use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Open a database, falling back to a [`NoopStore`] when that fails.
///
/// The failure is logged; callers keep working without offline support.
pub fn open_or_degrade(dir: &Path, spec: &'static DatabaseSpec) -> Arc<dyn LocalStore> {
  match SqliteStore::open(dir, spec) {
    Ok(store) => Arc::new(store),
    Err(e) => {
      warn!(database = spec.name, error = %e, "Local store unavailable, running without offline support");
      Arc::new(NoopStore::new(spec.name))
    }
  }
}
