//! # fleet-store
//!
//! The shared key-value store every agent reads and writes.
//!
//! - [`ResourceStore`]: list-by-prefix, get, put, delete, and a per-key lock.
//! - [`MemoryStore`]: in-process backend for tests and single-process runs.
//! - [`SqliteStore`]: single-file backend.
//! - [`Resources`]: typed repository over any backend, one generic method
//!   per operation instead of one hand-written method per kind.
//!
//! Reads are never locked. Writes through [`Resources`] hold the key's lock
//! for the read-modify-write, which is the only atomicity the system has.

mod error;
mod lock;
mod memory;
mod repository;
mod sqlite;

use async_trait::async_trait;

pub use error::StoreError;
pub use lock::{KeyGuard, LockTable};
pub use memory::MemoryStore;
pub use repository::Resources;
pub use sqlite::SqliteStore;

/// A raw key-value backend.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// All entries whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// The value at `key`, or [`StoreError::NotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Insert or overwrite the value at `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Acquire the lock for `key`. Dropping the guard unlocks.
    async fn lock(&self, key: &str) -> KeyGuard;
}
