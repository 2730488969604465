//! Revert history persistence
//!
//! The store keeps one [`Snapshot`] per mutated node per batch, keyed by
//! (batch id, path), plus one [`BatchRecord`] per batch. History is append
//! only: a later batch on the same path adds rows, it never replaces the
//! earlier ones. The one exception is [`MetadataStore::rollback_snapshot`],
//! which withdraws the snapshot of a mutation that did not happen.

use std::path::Path;

use crate::error::StoreResult;
use crate::{BatchId, BatchRecord, Snapshot};

pub mod database;
pub mod memory;

pub use database::SqliteStore;
pub use memory::MemoryStore;

pub trait MetadataStore: Send + Sync {
    /// Record a newly created batch
    fn begin_batch(&self, record: &BatchRecord) -> StoreResult<()>;

    /// Persist the final state, counts and end time of a batch
    fn finish_batch(&self, record: &BatchRecord) -> StoreResult<()>;

    fn insert_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()>;

    /// Withdraw the snapshot of a mutation that failed
    fn rollback_snapshot(&self, batch_id: BatchId, path: &Path) -> StoreResult<()>;

    /// Every snapshot of a batch, ordered by path
    fn snapshots_for_batch(&self, batch_id: BatchId) -> StoreResult<Vec<Snapshot>>;

    fn has_snapshots(&self, batch_id: BatchId) -> StoreResult<bool>;

    fn snapshot_for(&self, batch_id: BatchId, path: &Path) -> StoreResult<Option<Snapshot>>;

    /// Every snapshot ever taken of `path`, oldest first
    fn history_for_path(&self, path: &Path) -> StoreResult<Vec<Snapshot>>;

    /// All batches, newest first
    fn list_batches(&self) -> StoreResult<Vec<BatchRecord>>;

    /// Look a batch up by full id or unique id prefix
    fn find_batch(&self, id_or_prefix: &str) -> StoreResult<Option<BatchRecord>>;
}
