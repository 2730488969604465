//! Volatile [`MetadataStore`] used by tests and dry runs

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{StoreError, StoreResult};
use crate::store::MetadataStore;
use crate::{BatchId, BatchRecord, Snapshot};

#[derive(Default)]
struct Tables {
    batches: Vec<BatchRecord>,
    snapshots: Vec<Snapshot>,
}

/// Store that keeps everything in process memory.
///
/// [`MemoryStore::set_unavailable`] makes every call fail, which is how
/// engine-fault handling is exercised without a broken database file.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn snapshot_count(&self) -> usize {
        self.tables
            .lock()
            .map(|t| t.snapshots.len())
            .unwrap_or_default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }
}

impl MetadataStore for MemoryStore {
    fn begin_batch(&self, record: &BatchRecord) -> StoreResult<()> {
        self.tables()?.batches.push(record.clone());
        Ok(())
    }

    fn finish_batch(&self, record: &BatchRecord) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let stored = tables
            .batches
            .iter_mut()
            .find(|b| b.id == record.id)
            .ok_or(StoreError::MissingBatch(record.id))?;
        *stored = record.clone();
        Ok(())
    }

    fn insert_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let duplicate = tables
            .snapshots
            .iter()
            .any(|s| s.batch_id == snapshot.batch_id && s.path == snapshot.path);
        if duplicate {
            return Err(StoreError::Corrupt(format!(
                "snapshot for {} already recorded in batch {}",
                snapshot.path.display(),
                snapshot.batch_id
            )));
        }
        tables.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn rollback_snapshot(&self, batch_id: BatchId, path: &Path) -> StoreResult<()> {
        self.tables()?
            .snapshots
            .retain(|s| !(s.batch_id == batch_id && s.path == path));
        Ok(())
    }

    fn snapshots_for_batch(&self, batch_id: BatchId) -> StoreResult<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self
            .tables()?
            .snapshots
            .iter()
            .filter(|s| s.batch_id == batch_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(snapshots)
    }

    fn has_snapshots(&self, batch_id: BatchId) -> StoreResult<bool> {
        Ok(self.tables()?.snapshots.iter().any(|s| s.batch_id == batch_id))
    }

    fn snapshot_for(&self, batch_id: BatchId, path: &Path) -> StoreResult<Option<Snapshot>> {
        Ok(self
            .tables()?
            .snapshots
            .iter()
            .find(|s| s.batch_id == batch_id && s.path == path)
            .cloned())
    }

    fn history_for_path(&self, path: &Path) -> StoreResult<Vec<Snapshot>> {
        // Insertion order is capture order
        Ok(self
            .tables()?
            .snapshots
            .iter()
            .filter(|s| s.path == path)
            .cloned()
            .collect())
    }

    fn list_batches(&self) -> StoreResult<Vec<BatchRecord>> {
        let mut batches = self.tables()?.batches.clone();
        batches.reverse();
        batches.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(batches)
    }

    fn find_batch(&self, id_or_prefix: &str) -> StoreResult<Option<BatchRecord>> {
        let prefix = id_or_prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() {
            return Ok(None);
        }

        let tables = self.tables()?;
        if let Some(exact) = tables.batches.iter().find(|b| b.id.to_string() == prefix) {
            return Ok(Some(exact.clone()));
        }

        let mut matches = tables
            .batches
            .iter()
            .filter(|b| b.id.to_string().starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (None, _) => Ok(None),
            (Some(only), None) => Ok(Some(only.clone())),
            (Some(_), Some(_)) => Err(StoreError::AmbiguousBatch(id_or_prefix.to_string())),
        }
    }
}
