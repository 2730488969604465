//! Replaying snapshots to undo a batch

use std::path::PathBuf;
use tracing::info;

use crate::engine::ChangeEngine;
use crate::error::{EngineError, Result};
use crate::pool::Task;
use crate::report::BatchReport;
use crate::{BatchId, BatchKind, Node, NodeTarget};

/// Undoes change batches by restoring each node's captured state.
///
/// A revert is an ordinary batch whose tasks carry per-node targets, so it
/// gets its own id, report and snapshots (and can itself be reverted).
#[derive(Clone)]
pub struct RevertEngine {
    engine: ChangeEngine,
}

impl RevertEngine {
    pub fn new(engine: ChangeEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &ChangeEngine {
        &self.engine
    }

    /// Start reverting every snapshot of `batch_id`
    pub fn revert(&self, batch_id: BatchId) -> Result<BatchId> {
        self.start(batch_id, None)
    }

    /// Start reverting only the snapshots of `paths`
    pub fn revert_paths(&self, batch_id: BatchId, paths: &[PathBuf]) -> Result<BatchId> {
        self.start(batch_id, Some(paths))
    }

    /// Revert `batch_id` and block until done
    pub fn run(&self, batch_id: BatchId) -> Result<BatchReport> {
        let id = self.revert(batch_id)?;
        self.engine.wait(id)
    }

    fn start(&self, batch_id: BatchId, only: Option<&[PathBuf]>) -> Result<BatchId> {
        let store = self.engine.store();
        if !store.has_snapshots(batch_id)? {
            return Err(EngineError::RevertNotFound(batch_id));
        }

        let tasks: Vec<Task> = store
            .snapshots_for_batch(batch_id)?
            .into_iter()
            .filter(|s| only.map_or(true, |paths| paths.contains(&s.path)))
            .map(|s| Task {
                node: Node::new(s.path, s.kind, 0),
                target: NodeTarget::Restore(s.before),
            })
            .collect();

        if tasks.is_empty() {
            return Err(EngineError::RevertNotFound(batch_id));
        }

        let count = tasks.len();
        let id = self
            .engine
            .submit(BatchKind::Revert { of: batch_id }, tasks)?;
        self.engine.launch(id)?;

        info!(batch = %id, reverts = %batch_id, snapshots = count, "Revert started");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ops::MemoryOps;
    use crate::store::{MemoryStore, MetadataStore};
    use crate::{BatchRecord, Mode, NodeKind, NodeState, Outcome, Ownership, Snapshot};
    use chrono::Utc;
    use std::path::Path;
    use std::sync::Arc;

    fn state(user: &str) -> NodeState {
        NodeState::new(Ownership::new(user, "staff"), Mode::from_bits(0o644))
    }

    /// Store holding one change batch that moved /a and /b from alice to carol
    fn recorded_change(ops: &MemoryOps, store: &MemoryStore) -> BatchId {
        let batch = BatchRecord::new(BatchKind::Change);
        store.begin_batch(&batch).unwrap();
        for path in ["/a", "/b"] {
            ops.insert(path, state("carol"));
            store
                .insert_snapshot(&Snapshot {
                    batch_id: batch.id,
                    path: PathBuf::from(path),
                    kind: NodeKind::File,
                    before: state("alice"),
                    captured_at: Utc::now(),
                })
                .unwrap();
        }
        batch.id
    }

    fn reverter(ops: Arc<MemoryOps>, store: Arc<MemoryStore>) -> RevertEngine {
        let engine = ChangeEngine::new(ops, store, EngineConfig::default()).unwrap();
        RevertEngine::new(engine)
    }

    #[test]
    fn test_revert_restores_and_is_idempotent() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let batch_id = recorded_change(&ops, &store);
        let reverter = reverter(ops.clone(), store.clone());

        let first = reverter.run(batch_id).unwrap();
        assert_eq!(first.batch.kind, BatchKind::Revert { of: batch_id });
        assert_eq!(first.counts().changed, 2);
        assert_eq!(ops.state(Path::new("/a")).unwrap(), state("alice"));

        let second = reverter.run(batch_id).unwrap();
        assert_eq!(second.counts().unchanged, 2);
        assert_eq!(second.counts().changed, 0);
        assert!(!store.has_snapshots(second.batch.id).unwrap());
    }

    #[test]
    fn test_revert_unknown_batch() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let reverter = reverter(ops.clone(), store);

        let missing = uuid::Uuid::new_v4();
        assert!(matches!(
            reverter.revert(missing),
            Err(EngineError::RevertNotFound(id)) if id == missing
        ));
        assert_eq!(ops.mutations(), 0);
    }

    #[test]
    fn test_revert_paths_subset() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let batch_id = recorded_change(&ops, &store);
        let reverter = reverter(ops.clone(), store);

        let id = reverter
            .revert_paths(batch_id, &[PathBuf::from("/b")])
            .unwrap();
        let report = reverter.engine().wait(id).unwrap();

        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].outcome, Outcome::Changed);
        assert_eq!(ops.state(Path::new("/a")).unwrap(), state("carol"));
        assert_eq!(ops.state(Path::new("/b")).unwrap(), state("alice"));

        assert!(matches!(
            reverter.revert_paths(batch_id, &[PathBuf::from("/elsewhere")]),
            Err(EngineError::RevertNotFound(_))
        ));
    }
}
