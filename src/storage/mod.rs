//! Persistent storage for file versions and conflict records using Sled.
//!
//! Records are bincode-encoded and keyed so that a prefix scan over a
//! (project, path) pair yields its versions in ascending order.

mod sled_store;

pub use sled_store::{StorageError, StorageResult, StorageStats, VersionStore};

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
    /// Throw the database away when the last handle drops
    pub temporary: bool,
    /// How many times an append re-reads the head before giving up
    pub max_insert_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/collab.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
            temporary: false,
            max_insert_attempts: 8,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// In-memory database, used by tests
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            flush_interval_ms: 0,
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }

    pub fn with_max_insert_attempts(mut self, attempts: u32) -> Self {
        self.max_insert_attempts = attempts.max(1);
        self
    }
}
