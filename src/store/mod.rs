//! Pluggable inventory stores for warm pool entries.
//!
//! The pool coordinator tracks its warm inventory through this trait so the
//! backing store can be swapped: the in-memory default for single-process
//! use, or a durable external store shared across processes. A shared store
//! must provide cross-process exclusivity for `pop` itself; the pool actor
//! only serializes within its own process.

mod memory;

pub use memory::MemoryStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// One warm sandbox held in reserve.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    /// Backend-specific sandbox id.
    pub id: String,
    /// Partition this entry was stocked for.
    pub partition: String,
    /// Adapter metadata needed to resume the sandbox.
    pub data: HashMap<String, String>,
    /// When the sandbox was created.
    pub created_at: DateTime<Utc>,
}

impl PoolEntry {
    /// Age of this entry relative to now.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }
}

/// Inventory store contract consumed by the pool.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Adds a warm entry to its partition.
    async fn push(&self, entry: PoolEntry) -> Result<()>;

    /// Removes and returns the oldest entry for `partition`.
    ///
    /// The age check applies to the one entry this call would return: if it
    /// is older than `max_age` it is discarded and `None` is returned even
    /// if younger entries exist, so at most one entry is discarded per call.
    async fn pop(&self, partition: &str, max_age: Duration) -> Result<Option<PoolEntry>>;

    /// Number of warm entries for `partition`.
    async fn count(&self, partition: &str) -> Result<usize>;

    /// Warm entry counts for every partition that has any state.
    async fn counts_by_partition(&self) -> Result<HashMap<String, usize>>;

    /// Whether a creation is pending for `partition`.
    async fn pending(&self, partition: &str) -> Result<bool>;

    /// Sets or clears the pending-creation flag for `partition`.
    async fn set_pending(&self, partition: &str, pending: bool) -> Result<()>;

    /// Number of partitions with a pending creation.
    async fn pending_count(&self) -> Result<usize>;
}
