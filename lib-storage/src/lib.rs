//! Boson DHT storage layer.
//!
//! The DHT engine consumes the [`DataStorage`] contract; this crate ships
//! the contract plus the default heap-backed implementation selected by the
//! `in-memory://` database URI.

pub mod memory;
pub mod storage;

use std::sync::Arc;

use lib_core::DhtError;

pub use memory::MemoryStorage;
pub use storage::{DataStorage, StorageResult, StorageStats};

/// URI scheme selecting the in-memory backend.
pub const IN_MEMORY_URI: &str = "in-memory://";

/// Open a storage backend for `database_uri`.
///
/// Only the in-memory backend ships with the core; relational backends plug
/// in behind the same trait.
pub fn open(database_uri: &str) -> Result<Arc<dyn DataStorage>, DhtError> {
    if database_uri.starts_with(IN_MEMORY_URI) {
        return Ok(Arc::new(MemoryStorage::new()));
    }
    Err(DhtError::Generic(format!(
        "unsupported database uri: {}",
        database_uri
    )))
}
