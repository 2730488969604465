//! Bounded producer/worker pipeline
//!
//! One producer (the batch thread) feeds [`Task`]s into a bounded channel and
//! `concurrency` scoped workers drain it. A full channel blocks the producer,
//! so memory stays flat however large the tree is.
//!
//! Per node the order is fixed: read state, write snapshot, mutate, emit
//! outcome. Once the batch is cancelled or faulted the producer stops and
//! workers drain whatever is still queued as [`Outcome::NotAttempted`].

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, error, warn};

use crate::error::{EngineError, NodeError};
use crate::ops::PermissionOps;
use crate::report::ReportAggregator;
use crate::store::MetadataStore;
use crate::walker::WalkFailure;
use crate::{BatchId, BatchState, Node, NodeState, NodeTarget, Outcome, Snapshot, Target};

/// One node and the state it should end up in
#[derive(Debug, Clone)]
pub struct Task {
    pub node: Node,
    pub target: NodeTarget,
}

/// Shared lifecycle flags of a running batch
#[derive(Debug)]
pub struct BatchControl {
    cancelled: AtomicBool,
    state: Mutex<BatchState>,
    fault: Mutex<Option<String>>,
}

impl Default for BatchControl {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            state: Mutex::new(BatchState::Created),
            fault: Mutex::new(None),
        }
    }
}

impl BatchControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask producer and workers to stop; in-flight nodes still finish
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BatchState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_state(&self, state: BatchState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// First dequeued node moves the batch from enumerating to processing
    fn mark_processing(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == BatchState::Enumerating {
            *state = BatchState::Processing;
        }
    }

    /// Record an engine fault and stop the batch. Only the first fault is kept.
    pub fn fault(&self, message: impl Into<String>) {
        {
            let mut fault = self
                .fault
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if fault.is_none() {
                *fault = Some(message.into());
            }
        }
        self.cancel();
    }

    pub fn fault_message(&self) -> Option<String> {
        self.fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Terminal state implied by the flags
    pub fn terminal_state(&self) -> BatchState {
        if self.fault_message().is_some() {
            BatchState::Failed
        } else if self.is_cancelled() {
            BatchState::Cancelled
        } else {
            BatchState::Completed
        }
    }
}

/// Workers applying one batch's tasks
pub struct WorkerPool<'a> {
    batch_id: BatchId,
    ops: &'a dyn PermissionOps,
    store: &'a dyn MetadataStore,
    report: &'a ReportAggregator,
    control: &'a BatchControl,
    concurrency: usize,
    queue_capacity: usize,
}

impl<'a> WorkerPool<'a> {
    pub fn new(
        batch_id: BatchId,
        ops: &'a dyn PermissionOps,
        store: &'a dyn MetadataStore,
        report: &'a ReportAggregator,
        control: &'a BatchControl,
    ) -> Self {
        Self {
            batch_id,
            ops,
            store,
            report,
            control,
            concurrency: 1,
            queue_capacity: 1,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Feed `tasks` through the workers and return once every dequeued task
    /// has an outcome.
    ///
    /// Enumeration failures are recorded as errors without reaching a worker.
    /// The only error returned is a failure to start a worker thread, which
    /// happens before any task is dequeued.
    pub fn run<I>(&self, tasks: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = Result<Task, WalkFailure>>,
    {
        self.control.set_state(BatchState::Enumerating);
        let (tx, rx) = bounded::<Task>(self.queue_capacity);

        thread::scope(|scope| {
            for id in 0..self.concurrency {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("permshift-worker-{}", id))
                    .spawn_scoped(scope, move || self.worker_loop(id, rx))
                    .map_err(EngineError::Spawn)?;
            }
            drop(rx);

            for item in tasks {
                if self.control.is_cancelled() {
                    debug!(batch = %self.batch_id, "Producer stopping after cancellation");
                    break;
                }
                self.report.note_seen();

                match item {
                    Ok(task) => {
                        // All workers gone means nothing will drain the queue
                        if tx.send(task).is_err() {
                            break;
                        }
                    }
                    Err(WalkFailure { node, error }) => {
                        warn!(path = %node.path.display(), error = %error, "Enumeration failed");
                        let reason = error.to_string();
                        self.report
                            .record(&node, Outcome::Error(reason.clone()), Some(reason));
                    }
                }
            }
            drop(tx);
            Ok(())
        })
    }

    fn worker_loop(&self, id: usize, rx: Receiver<Task>) {
        debug!(worker = id, "Worker starting");
        let mut handled = 0u64;

        for task in rx.iter() {
            self.control.mark_processing();
            handled += 1;

            if self.control.is_cancelled() {
                self.report.record(&task.node, Outcome::NotAttempted, None);
                continue;
            }

            let (outcome, detail) = self.process(&task);
            match &outcome {
                Outcome::Changed => {
                    debug!(worker = id, path = %task.node.path.display(), "Changed")
                }
                Outcome::Unchanged => {
                    debug!(worker = id, path = %task.node.path.display(), "Unchanged")
                }
                Outcome::Error(reason) => {
                    warn!(worker = id, path = %task.node.path.display(), error = %reason, "Node failed")
                }
                Outcome::NotAttempted => {}
            }
            self.report.record(&task.node, outcome, detail);
        }

        debug!(worker = id, handled, "Worker finished");
    }

    /// Outcome of one node. Error details carry the attempted change once
    /// the current state is known, the failure reason before that.
    fn process(&self, task: &Task) -> (Outcome, Option<String>) {
        let path = &task.node.path;

        let before = match self.ops.read_state(path) {
            Ok(state) => state,
            Err(e) => {
                let reason = e.to_string();
                return (Outcome::Error(reason.clone()), Some(reason));
            }
        };

        if task.target.is_satisfied_by(&before) {
            return (Outcome::Unchanged, None);
        }

        let snapshot = Snapshot {
            batch_id: self.batch_id,
            path: path.clone(),
            kind: task.node.kind,
            before: before.clone(),
            captured_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_snapshot(&snapshot) {
            error!(batch = %self.batch_id, path = %path.display(), error = %e, "Snapshot write failed");
            self.control.fault(format!("snapshot write failed: {}", e));
            let err = NodeError::StoreUnavailable {
                reason: e.to_string(),
            };
            let attempted = describe(&before, &expected_state(&task.target, &before));
            return (Outcome::Error(err.to_string()), Some(attempted));
        }

        match apply(self.ops, task, &before) {
            Ok(()) => {
                let after = self
                    .ops
                    .read_state(path)
                    .unwrap_or_else(|_| expected_state(&task.target, &before));
                (Outcome::Changed, Some(describe(&before, &after)))
            }
            Err(e) => {
                if let Err(rollback) = self.store.rollback_snapshot(self.batch_id, path) {
                    warn!(
                        path = %path.display(),
                        error = %rollback,
                        "Could not withdraw snapshot of failed mutation"
                    );
                }
                let attempted = describe(&before, &expected_state(&task.target, &before));
                (Outcome::Error(e.to_string()), Some(attempted))
            }
        }
    }
}

fn apply(ops: &dyn PermissionOps, task: &Task, before: &NodeState) -> Result<(), NodeError> {
    let path = task.node.path.as_path();
    match &task.target {
        NodeTarget::Uniform(Target::Owner { user, group }) => {
            ops.set_owner(path, user, group.as_deref())
        }
        NodeTarget::Uniform(Target::Permissions(mode)) => ops.set_permissions(path, *mode),
        NodeTarget::Restore(wanted) => {
            let owner_changes = wanted.owner != before.owner;
            if owner_changes {
                ops.set_owner(path, &wanted.owner.user, Some(wanted.owner.group.as_str()))?;
            }
            if wanted.mode != before.mode {
                if let Err(e) = ops.set_permissions(path, wanted.mode) {
                    if owner_changes {
                        let undo =
                            ops.set_owner(path, &before.owner.user, Some(before.owner.group.as_str()));
                        if let Err(undo) = undo {
                            warn!(
                                path = %path.display(),
                                error = %undo,
                                "Could not restore owner after failed chmod"
                            );
                        }
                    }
                    return Err(e);
                }
            }
            Ok(())
        }
    }
}

fn expected_state(target: &NodeTarget, before: &NodeState) -> NodeState {
    let mut state = before.clone();
    match target {
        NodeTarget::Uniform(Target::Owner { user, group }) => {
            state.owner.user = user.clone();
            if let Some(group) = group {
                state.owner.group = group.clone();
            }
        }
        NodeTarget::Uniform(Target::Permissions(mode)) => state.mode = *mode,
        NodeTarget::Restore(wanted) => state = wanted.clone(),
    }
    state
}

/// `alice:staff -> carol:staff`, `0644 -> 0755`, or both
fn describe(before: &NodeState, after: &NodeState) -> String {
    match (before.owner != after.owner, before.mode != after.mode) {
        (true, false) => format!("{} -> {}", before.owner, after.owner),
        (false, true) => format!("{} -> {}", before.mode, after.mode),
        _ => format!(
            "{} {} -> {} {}",
            before.owner, before.mode, after.owner, after.mode
        ),
    }
}
