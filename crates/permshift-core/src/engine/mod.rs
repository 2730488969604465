//! Batch orchestration
//!
//! A batch runs on its own thread: the batch thread is the producer of the
//! [`WorkerPool`] pipeline, and the caller keeps a cheap [`ChangeEngine`]
//! handle to poll progress, cancel, or wait for the final report.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, Result};
use crate::ops::PermissionOps;
use crate::pool::{BatchControl, Task, WorkerPool};
use crate::report::{BatchReport, Counts, ReportAggregator};
use crate::store::MetadataStore;
use crate::walker::PathEnumerator;
use crate::{BatchId, BatchKind, BatchRecord, BatchState, NodeTarget, Target};

pub mod revert;

pub use revert::RevertEngine;

/// What a change batch should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    pub root: PathBuf,
    pub target: Target,
    /// Overrides the engine's configured depth limit when set
    pub max_depth: Option<usize>,
    /// Overrides the engine's configured worker count when set
    pub concurrency: Option<usize>,
}

impl ChangeRequest {
    pub fn new(root: impl Into<PathBuf>, target: Target) -> Self {
        Self {
            root: root.into(),
            target,
            max_depth: None,
            concurrency: None,
        }
    }

    pub fn max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

/// Point-in-time view of a running or finished batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub batch_id: BatchId,
    pub state: BatchState,
    pub changed: u64,
    pub unchanged: u64,
    pub errored: u64,
    pub not_attempted: u64,
    /// Nodes handed to the pipeline so far
    pub seen: u64,
    pub in_flight: u64,
}

impl Progress {
    fn new(batch_id: BatchId, state: BatchState, counts: Counts) -> Self {
        Self {
            batch_id,
            state,
            changed: counts.changed,
            unchanged: counts.unchanged,
            errored: counts.errored,
            not_attempted: counts.not_attempted,
            seen: counts.seen,
            in_flight: counts.in_flight(),
        }
    }
}

type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

enum Plan {
    Walk {
        root: PathBuf,
        target: Target,
        max_depth: Option<usize>,
        concurrency: usize,
    },
    Replay(Vec<Task>),
}

struct BatchHandle {
    record: BatchRecord,
    control: Arc<BatchControl>,
    report: ReportAggregator,
    plan: Mutex<Option<Plan>>,
    launched: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    result: Mutex<Option<BatchReport>>,
    finished: Condvar,
}

struct EngineInner {
    ops: Arc<dyn PermissionOps>,
    store: Arc<dyn MetadataStore>,
    config: EngineConfig,
    batches: Mutex<HashMap<BatchId, Arc<BatchHandle>>>,
    on_progress: Arc<Mutex<Option<ProgressCallback>>>,
}

/// Runs change batches against an injected OS capability and store.
///
/// Cloning is cheap; clones share the same batch registry.
#[derive(Clone)]
pub struct ChangeEngine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChangeEngine {
    pub fn new(
        ops: Arc<dyn PermissionOps>,
        store: Arc<dyn MetadataStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                ops,
                store,
                config,
                batches: Mutex::new(HashMap::new()),
                on_progress: Arc::new(Mutex::new(None)),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn ops(&self) -> &Arc<dyn PermissionOps> {
        &self.inner.ops
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.inner.store
    }

    /// Push progress every `progress_every` outcomes and once at batch end.
    /// Replaces any previous callback, for running batches too.
    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_progress) = Some(Arc::new(callback));
    }

    /// Register a change batch without starting it
    pub fn create(&self, request: ChangeRequest) -> Result<BatchId> {
        let concurrency = request.concurrency.unwrap_or(self.inner.config.concurrency);
        if concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency.into());
        }

        let mut record = BatchRecord::new(BatchKind::Change);
        let max_depth = request.max_depth.or(self.inner.config.max_depth);
        record.root = Some(request.root.clone());
        record.target = Some(request.target.clone());
        record.max_depth = max_depth;

        self.register(
            record,
            Plan::Walk {
                root: request.root,
                target: request.target,
                max_depth,
                concurrency,
            },
        )
    }

    /// Register a batch that replays explicit per-node tasks
    pub(crate) fn submit(&self, kind: BatchKind, tasks: Vec<Task>) -> Result<BatchId> {
        self.register(BatchRecord::new(kind), Plan::Replay(tasks))
    }

    fn register(&self, record: BatchRecord, plan: Plan) -> Result<BatchId> {
        self.inner.store.begin_batch(&record)?;
        self.evict_finished();

        let id = record.id;
        let control = Arc::new(BatchControl::new());
        let report = {
            let control = Arc::clone(&control);
            let slot = Arc::clone(&self.inner.on_progress);
            ReportAggregator::new().with_progress(self.inner.config.progress_every, move |counts| {
                let callback = lock(&slot).clone();
                if let Some(callback) = callback {
                    callback(&Progress::new(id, control.state(), *counts));
                }
            })
        };

        let handle = Arc::new(BatchHandle {
            record,
            control,
            report,
            plan: Mutex::new(Some(plan)),
            launched: AtomicBool::new(false),
            thread: Mutex::new(None),
            result: Mutex::new(None),
            finished: Condvar::new(),
        });
        lock(&self.inner.batches).insert(id, handle);
        Ok(id)
    }

    /// Start a registered batch on its own thread
    pub fn launch(&self, id: BatchId) -> Result<()> {
        let handle = self.handle(id)?;
        let plan = lock(&handle.plan)
            .take()
            .ok_or(EngineError::AlreadyLaunched(id))?;
        handle.launched.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let batch = Arc::clone(&handle);
        let spawned = thread::Builder::new()
            .name(format!("permshift-batch-{}", &id.to_string()[..8]))
            .spawn(move || execute(&inner, &batch, plan));

        match spawned {
            Ok(thread) => {
                *lock(&handle.thread) = Some(thread);
                Ok(())
            }
            Err(e) => {
                error!(batch = %id, error = %e, "Failed to start batch thread");
                handle.control.fault(format!("failed to start batch thread: {}", e));
                finalize(&self.inner, &handle);
                Err(EngineError::Spawn(e))
            }
        }
    }

    /// Create and launch a change batch
    pub fn start(&self, request: ChangeRequest) -> Result<BatchId> {
        let id = self.create(request)?;
        self.launch(id)?;
        Ok(id)
    }

    /// Start a change batch and block until it ends
    pub fn run(&self, request: ChangeRequest) -> Result<BatchReport> {
        let id = self.start(request)?;
        self.wait(id)
    }

    /// Request cooperative cancellation
    pub fn cancel(&self, id: BatchId) -> Result<()> {
        let handle = self.handle(id)?;
        if !handle.control.state().is_terminal() {
            warn!(batch = %id, "Cancellation requested");
        }
        handle.control.cancel();
        Ok(())
    }

    pub fn progress(&self, id: BatchId) -> Result<Progress> {
        let handle = self.handle(id)?;
        Ok(Progress::new(
            id,
            handle.control.state(),
            handle.report.counts(),
        ))
    }

    /// Final report, once the batch has reached a terminal state
    pub fn result(&self, id: BatchId) -> Result<Option<BatchReport>> {
        let handle = self.handle(id)?;
        let result = lock(&handle.result).clone();
        Ok(result)
    }

    /// Block until the batch ends and return its report
    pub fn wait(&self, id: BatchId) -> Result<BatchReport> {
        let handle = self.handle(id)?;
        if !handle.launched.load(Ordering::SeqCst) {
            return Err(EngineError::Incomplete(id));
        }

        let thread = lock(&handle.thread).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(batch = %id, "Batch thread panicked");
                return Err(EngineError::Incomplete(id));
            }
        }

        let mut result = lock(&handle.result);
        while result.is_none() {
            result = handle
                .finished
                .wait(result)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        result.clone().ok_or(EngineError::Incomplete(id))
    }

    /// Resolve a full batch id or unique prefix through the store
    pub fn find_batch(&self, id_or_prefix: &str) -> Result<BatchRecord> {
        self.inner
            .store
            .find_batch(id_or_prefix)?
            .ok_or_else(|| EngineError::UnknownBatch(id_or_prefix.to_string()))
    }

    /// Drop the oldest finished batches beyond `retain_finished`. Their
    /// records stay in the store.
    fn evict_finished(&self) {
        let mut batches = lock(&self.inner.batches);
        let mut finished: Vec<_> = batches
            .values()
            .filter(|handle| lock(&handle.result).is_some())
            .map(|handle| (handle.record.started_at, handle.record.id))
            .collect();
        let excess = finished
            .len()
            .saturating_sub(self.inner.config.retain_finished);
        if excess == 0 {
            return;
        }

        finished.sort();
        for (_, id) in finished.into_iter().take(excess) {
            batches.remove(&id);
        }
        debug!(evicted = excess, "Released finished batches");
    }

    fn handle(&self, id: BatchId) -> Result<Arc<BatchHandle>> {
        lock(&self.inner.batches)
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownBatch(id.to_string()))
    }
}

/// Body of the batch thread
fn execute(inner: &EngineInner, handle: &BatchHandle, plan: Plan) {
    let id = handle.record.id;
    info!(batch = %id, kind = %handle.record.kind, "Batch started");

    let outcome = match plan {
        Plan::Walk {
            root,
            target,
            max_depth,
            concurrency,
        } => {
            let target = match inner.ops.canonical_target(&target) {
                Ok(canonical) => canonical,
                Err(e) => {
                    warn!(batch = %id, %target, error = %e, "Could not resolve target owner");
                    target
                }
            };
            let target = NodeTarget::Uniform(target);
            let walker = PathEnumerator::new(root)
                .max_depth(max_depth)
                .follow_links(inner.config.follow_links);
            worker_pool(inner, handle, concurrency).run(walker.map(move |item| {
                item.map(|node| Task {
                    node,
                    target: target.clone(),
                })
            }))
        }
        Plan::Replay(tasks) => {
            worker_pool(inner, handle, inner.config.concurrency).run(tasks.into_iter().map(Ok))
        }
    };

    if let Err(e) = outcome {
        error!(batch = %id, error = %e, "Batch aborted");
        handle.control.fault(e.to_string());
    }

    finalize(inner, handle);
}

fn worker_pool<'a>(
    inner: &'a EngineInner,
    handle: &'a BatchHandle,
    concurrency: usize,
) -> WorkerPool<'a> {
    WorkerPool::new(
        handle.record.id,
        inner.ops.as_ref(),
        inner.store.as_ref(),
        &handle.report,
        &handle.control,
    )
    .concurrency(concurrency)
    .queue_capacity(inner.config.queue_capacity)
}

/// Close the batch: persist the record, publish the report, wake waiters
fn finalize(inner: &EngineInner, handle: &BatchHandle) {
    let control = &handle.control;
    let mut record = handle.record.clone();
    record.state = control.terminal_state();
    record.fault = control.fault_message();
    record.ended_at = Some(Utc::now());
    record.counts = handle.report.counts();

    if let Err(e) = inner.store.finish_batch(&record) {
        error!(batch = %record.id, error = %e, "Failed to record batch result");
        if record.fault.is_none() {
            control.fault(format!("failed to record batch result: {}", e));
            record.state = BatchState::Failed;
            record.fault = control.fault_message();
        }
    }
    control.set_state(record.state);
    handle.report.notify();

    let counts = record.counts;
    match record.state {
        BatchState::Failed => error!(
            batch = %record.id,
            fault = record.fault.as_deref().unwrap_or("unknown"),
            "Batch failed"
        ),
        state => info!(
            batch = %record.id,
            %state,
            changed = counts.changed,
            unchanged = counts.unchanged,
            errored = counts.errored,
            not_attempted = counts.not_attempted,
            "Batch finished"
        ),
    }

    let report = BatchReport {
        batch: record,
        entries: handle.report.entries(),
    };
    *lock(&handle.result) = Some(report);
    handle.finished.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::MemoryOps;
    use crate::store::MemoryStore;
    use crate::{Mode, NodeState, Ownership, Outcome};
    use std::fs;
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;

    /// Tree with a.txt, sub/ and sub/b.txt, all registered in `ops`
    fn seed_tree(ops: &MemoryOps) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("b.txt"), b"b").unwrap();

        let state = |user: &str| NodeState::new(Ownership::new(user, "staff"), Mode::from_bits(0o644));
        ops.insert(root, state("root"));
        ops.insert(root.join("a.txt"), state("alice"));
        ops.insert(root.join("sub"), state("alice"));
        ops.insert(root.join("sub").join("b.txt"), state("bob"));
        temp_dir
    }

    fn engine(ops: Arc<MemoryOps>, store: Arc<MemoryStore>) -> ChangeEngine {
        let config = EngineConfig::default().with_concurrency(2);
        ChangeEngine::new(ops, store, config).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig::default().with_concurrency(0);
        let result = ChangeEngine::new(
            Arc::new(MemoryOps::new()),
            Arc::new(MemoryStore::new()),
            config,
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_run_reaches_completed() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let tree = seed_tree(&ops);
        let engine = engine(ops.clone(), store.clone());

        let report = engine
            .run(ChangeRequest::new(tree.path(), Target::owner("carol")))
            .unwrap();

        assert_eq!(report.batch.state, BatchState::Completed);
        let counts = report.counts();
        assert_eq!(counts.changed, 4);
        assert_eq!(counts.seen, 4);
        assert_eq!(report.entries.len(), 4);

        let stored = store.find_batch(&report.batch.id.to_string()).unwrap().unwrap();
        assert_eq!(stored.state, BatchState::Completed);
        assert_eq!(stored.counts, counts);
        assert!(stored.ended_at.is_some());

        let progress = engine.progress(report.batch.id).unwrap();
        assert_eq!(progress.state, BatchState::Completed);
        assert_eq!(progress.in_flight, 0);
    }

    #[test]
    fn test_create_then_launch_once() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let tree = seed_tree(&ops);
        let engine = engine(ops, store);

        let id = engine
            .create(ChangeRequest::new(tree.path(), Target::owner("carol")))
            .unwrap();
        assert_eq!(engine.progress(id).unwrap().state, BatchState::Created);
        assert!(engine.result(id).unwrap().is_none());
        assert!(matches!(engine.wait(id), Err(EngineError::Incomplete(_))));

        engine.launch(id).unwrap();
        assert!(matches!(
            engine.launch(id),
            Err(EngineError::AlreadyLaunched(_))
        ));
        let report = engine.wait(id).unwrap();
        assert_eq!(report.batch.id, id);
        assert!(engine.result(id).unwrap().is_some());
    }

    #[test]
    fn test_unknown_batch() {
        let engine = engine(Arc::new(MemoryOps::new()), Arc::new(MemoryStore::new()));
        let id = uuid::Uuid::new_v4();
        assert!(matches!(engine.progress(id), Err(EngineError::UnknownBatch(_))));
        assert!(matches!(engine.cancel(id), Err(EngineError::UnknownBatch(_))));
        assert!(matches!(
            engine.find_batch("deadbeef"),
            Err(EngineError::UnknownBatch(_))
        ));
    }

    #[test]
    fn test_store_unavailable_at_create() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let tree = seed_tree(&ops);
        let engine = engine(ops, store.clone());
        store.set_unavailable(true);

        let result = engine.start(ChangeRequest::new(tree.path(), Target::owner("carol")));
        assert!(matches!(result, Err(ref e) if e.is_fault()));
    }

    #[test]
    fn test_progress_callback_pushes_final_counts() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let tree = seed_tree(&ops);
        let config = EngineConfig::default()
            .with_concurrency(1)
            .with_progress_every(1);
        let engine = ChangeEngine::new(ops, store, config).unwrap();

        let calls = Arc::new(AtomicU64::new(0));
        let last = Arc::new(Mutex::new(None));
        {
            let calls = calls.clone();
            let last = last.clone();
            engine.set_progress_callback(move |progress| {
                calls.fetch_add(1, Ordering::SeqCst);
                *last.lock().unwrap() = Some(*progress);
            });
        }

        let report = engine
            .run(ChangeRequest::new(tree.path(), Target::owner("carol")))
            .unwrap();

        // One per outcome plus the closing notification
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let last = last.lock().unwrap().unwrap();
        assert_eq!(last.state, BatchState::Completed);
        assert_eq!(last.changed, report.counts().changed);
    }

    #[test]
    fn test_max_depth_override() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let tree = seed_tree(&ops);
        let engine = engine(ops, store);

        let report = engine
            .run(ChangeRequest::new(tree.path(), Target::owner("carol")).max_depth(Some(1)))
            .unwrap();

        assert_eq!(report.batch.max_depth, Some(1));
        assert_eq!(report.counts().seen, 3);
        assert!(report
            .entry(&tree.path().join("sub").join("b.txt"))
            .is_none());
        assert!(report
            .entries
            .iter()
            .all(|e| e.outcome == Outcome::Changed));
    }

    #[test]
    fn test_request_concurrency_overrides_config() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let temp_dir = TempDir::new().unwrap();
        for i in 0..40 {
            fs::write(temp_dir.path().join(format!("f{:02}", i)), b"x").unwrap();
        }
        for node in PathEnumerator::new(temp_dir.path()).flatten() {
            ops.insert(
                node.path,
                NodeState::new(Ownership::new("alice", "staff"), Mode::from_bits(0o644)),
            );
        }

        let workers = Arc::new(Mutex::new(std::collections::HashSet::new()));
        {
            let workers = workers.clone();
            ops.set_hook(move |_, _| {
                let name = thread::current().name().map(str::to_string);
                workers.lock().unwrap().insert(name);
            });
        }
        let config = EngineConfig::default().with_concurrency(4);
        let engine = ChangeEngine::new(ops, store, config).unwrap();

        let report = engine
            .run(ChangeRequest::new(temp_dir.path(), Target::owner("carol")).concurrency(1))
            .unwrap();

        assert_eq!(report.counts().changed, 41);
        let workers = workers.lock().unwrap();
        assert_eq!(workers.len(), 1);
        assert!(workers.contains(&Some("permshift-worker-0".to_string())));

        assert!(matches!(
            engine.create(ChangeRequest::new(temp_dir.path(), Target::owner("carol")).concurrency(0)),
            Err(EngineError::Config(ConfigError::ZeroConcurrency))
        ));
    }

    #[test]
    fn test_finished_batches_are_evicted() {
        let ops = Arc::new(MemoryOps::new());
        let store = Arc::new(MemoryStore::new());
        let tree = seed_tree(&ops);
        let config = EngineConfig::default().with_retain_finished(2);
        let engine = ChangeEngine::new(ops, store.clone(), config).unwrap();

        let ids: Vec<BatchId> = (0..4)
            .map(|_| {
                engine
                    .run(ChangeRequest::new(tree.path(), Target::owner("carol")))
                    .unwrap()
                    .batch
                    .id
            })
            .collect();

        // The fourth registration dropped the first finished batch
        assert!(matches!(
            engine.progress(ids[0]),
            Err(EngineError::UnknownBatch(_))
        ));
        for id in &ids[1..] {
            assert!(engine.result(*id).unwrap().is_some());
        }
        assert!(store.find_batch(&ids[0].to_string()).unwrap().is_some());
    }
}
