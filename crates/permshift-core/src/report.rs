//! Outcome aggregation and batch reports
//!
//! Workers push outcomes into a shared [`ReportAggregator`]. Running totals
//! are plain atomics so a progress reader never waits on a worker; the
//! ordered entry list sits behind a mutex and is only read at the end.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{BatchRecord, Node, NodeKind, Outcome};

/// Running totals for a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub changed: u64,
    pub unchanged: u64,
    pub errored: u64,
    pub not_attempted: u64,
    /// Nodes handed to the pipeline so far
    pub seen: u64,
}

impl Counts {
    /// Nodes with a real outcome (changed, unchanged or errored)
    pub fn visited(&self) -> u64 {
        self.changed + self.unchanged + self.errored
    }

    /// Nodes with any outcome, including the not-attempted marker
    pub fn reported(&self) -> u64 {
        self.visited() + self.not_attempted
    }

    /// Nodes handed out but not yet reported
    pub fn in_flight(&self) -> u64 {
        self.seen.saturating_sub(self.reported())
    }
}

/// One line of a batch report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub path: PathBuf,
    pub kind: NodeKind,
    pub outcome: Outcome,
    /// Change made or attempted (`alice:staff -> carol:staff`), or the
    /// failure reason when the node could not be read
    pub detail: Option<String>,
}

/// Final, read-only result of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch: BatchRecord,
    /// Entries in arrival order
    pub entries: Vec<ReportEntry>,
}

impl BatchReport {
    pub fn counts(&self) -> Counts {
        self.batch.counts
    }

    pub fn entry(&self, path: &std::path::Path) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn with_outcome<'a>(
        &'a self,
        label: &'a str,
    ) -> impl Iterator<Item = &'a ReportEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.outcome.label() == label)
    }
}

type CountsCallback = Box<dyn Fn(&Counts) + Send + Sync>;

/// Thread-safe outcome collector
pub struct ReportAggregator {
    changed: AtomicU64,
    unchanged: AtomicU64,
    errored: AtomicU64,
    not_attempted: AtomicU64,
    seen: AtomicU64,
    entries: Mutex<Vec<ReportEntry>>,
    notify_every: u64,
    on_progress: Option<CountsCallback>,
}

impl Default for ReportAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportAggregator {
    pub fn new() -> Self {
        Self {
            changed: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            not_attempted: AtomicU64::new(0),
            seen: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
            notify_every: u64::MAX,
            on_progress: None,
        }
    }

    /// Invoke `callback` with fresh counts every `every` outcomes
    pub fn with_progress<F>(mut self, every: u64, callback: F) -> Self
    where
        F: Fn(&Counts) + Send + Sync + 'static,
    {
        self.notify_every = every.max(1);
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// A node entered the pipeline
    pub fn note_seen(&self) {
        self.seen.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the single outcome of `node`
    pub fn record(&self, node: &Node, outcome: Outcome, detail: Option<String>) {
        let counter = match outcome {
            Outcome::Changed => &self.changed,
            Outcome::Unchanged => &self.unchanged,
            Outcome::Error(_) => &self.errored,
            Outcome::NotAttempted => &self.not_attempted,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let total = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.push(ReportEntry {
                path: node.path.clone(),
                kind: node.kind,
                outcome,
                detail,
            });
            entries.len() as u64
        };

        if total % self.notify_every == 0 {
            self.notify();
        }
    }

    /// Push the current counts to the progress callback, if any
    pub fn notify(&self) {
        if let Some(callback) = &self.on_progress {
            callback(&self.counts());
        }
    }

    /// Point-in-time counts; never blocks writers
    pub fn counts(&self) -> Counts {
        Counts {
            changed: self.changed.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            not_attempted: self.not_attempted.load(Ordering::Relaxed),
            seen: self.seen.load(Ordering::Relaxed),
        }
    }

    /// Copy of the entries recorded so far, in arrival order
    pub fn entries(&self) -> Vec<ReportEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
