//! Bulk ownership and permission changes over filesystem trees, with a
//! snapshot history that allows every batch to be reverted.
//!
//! The pieces, leaf first: [`walker::PathEnumerator`] walks a root,
//! [`pool::WorkerPool`] applies one mutation per node through an injected
//! [`ops::PermissionOps`] capability, [`store::MetadataStore`] keeps the
//! pre-change [`Snapshot`]s, [`report::ReportAggregator`] collects outcomes,
//! and [`engine::ChangeEngine`] / [`engine::RevertEngine`] drive batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod ops;
pub mod parse;
pub mod pool;
pub mod report;
pub mod store;
pub mod walker;

pub use audit::{audit, AuditEntry, AuditReport};
pub use config::EngineConfig;
pub use engine::{ChangeEngine, ChangeRequest, Progress, RevertEngine};
pub use error::{ConfigError, EngineError, NodeError, ParseError, StoreError};
pub use ops::{MemoryOps, PermissionOps, SystemOps};
pub use parse::{parse_mode, parse_owner};
pub use report::{BatchReport, Counts, ReportAggregator, ReportEntry};
pub use store::{MemoryStore, MetadataStore, SqliteStore};
pub use walker::{PathEnumerator, WalkFailure};

/// Identifier of a change or revert batch
pub type BatchId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Directory => "directory",
            NodeKind::Symlink => "symlink",
            NodeKind::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(NodeKind::File),
            "directory" => Some(NodeKind::Directory),
            "symlink" => Some(NodeKind::Symlink),
            "other" => Some(NodeKind::Other),
            _ => None,
        }
    }

    pub(crate) fn from_file_type(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            NodeKind::Symlink
        } else if file_type.is_dir() {
            NodeKind::Directory
        } else if file_type.is_file() {
            NodeKind::File
        } else {
            NodeKind::Other
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filesystem entry visited during a batch. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub path: PathBuf,
    pub kind: NodeKind,
    /// Distance from the enumeration root (0 = root)
    pub depth: usize,
}

impl Node {
    pub fn new(path: impl Into<PathBuf>, kind: NodeKind, depth: usize) -> Self {
        Self {
            path: path.into(),
            kind,
            depth,
        }
    }
}

/// Owner identity as user and group names.
///
/// Ids with no name in the account database are carried as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ownership {
    pub user: String,
    pub group: String,
}

impl Ownership {
    pub fn new(user: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.group)
    }
}

/// Permission bits (setuid/setgid/sticky plus rwx triplets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mode(u32);

impl Mode {
    pub const MASK: u32 = 0o7777;

    pub fn from_bits(bits: u32) -> Self {
        Mode(bits & Self::MASK)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// Ownership/permission state of a node, as captured in a [`Snapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub owner: Ownership,
    pub mode: Mode,
}

impl NodeState {
    pub fn new(owner: Ownership, mode: Mode) -> Self {
        Self { owner, mode }
    }
}

/// Uniform mutation requested for every node of a change batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    /// Set the owning user, and the group when one is given
    Owner { user: String, group: Option<String> },
    Permissions(Mode),
}

impl Target {
    pub fn owner(user: impl Into<String>) -> Self {
        Target::Owner {
            user: user.into(),
            group: None,
        }
    }

    pub fn is_satisfied_by(&self, state: &NodeState) -> bool {
        match self {
            Target::Owner { user, group } => {
                state.owner.user == *user
                    && group.as_ref().map_or(true, |g| state.owner.group == *g)
            }
            Target::Permissions(mode) => state.mode == *mode,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Owner {
                user,
                group: Some(group),
            } => write!(f, "owner {}:{}", user, group),
            Target::Owner { user, group: None } => write!(f, "owner {}", user),
            Target::Permissions(mode) => write!(f, "mode {}", mode),
        }
    }
}

/// Target applied to a single node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTarget {
    /// Same request for every node (change batches)
    Uniform(Target),
    /// Put back a previously captured state (revert batches)
    Restore(NodeState),
}

impl NodeTarget {
    pub fn is_satisfied_by(&self, state: &NodeState) -> bool {
        match self {
            NodeTarget::Uniform(target) => target.is_satisfied_by(state),
            NodeTarget::Restore(wanted) => wanted == state,
        }
    }
}

/// Per-node result of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Changed,
    Unchanged,
    Error(String),
    /// Queued before a cancellation or fault and drained without mutation
    NotAttempted,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Changed => "changed",
            Outcome::Unchanged => "unchanged",
            Outcome::Error(_) => "error",
            Outcome::NotAttempted => "not attempted",
        }
    }
}

/// Pre-change state of one node, written before the node is mutated.
///
/// Keyed by (batch id, path). Never updated once written; later batches on
/// the same path add new snapshots rather than replacing this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub batch_id: BatchId,
    pub path: PathBuf,
    pub kind: NodeKind,
    pub before: NodeState,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchKind {
    Change,
    Revert { of: BatchId },
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKind::Change => write!(f, "change"),
            BatchKind::Revert { of } => write!(f, "revert of {}", of),
        }
    }
}

/// Lifecycle of a batch: `Created -> Enumerating -> Processing -> terminal`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Created,
    Enumerating,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Created => "created",
            BatchState::Enumerating => "enumerating",
            BatchState::Processing => "processing",
            BatchState::Completed => "completed",
            BatchState::Cancelled => "cancelled",
            BatchState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(BatchState::Created),
            "enumerating" => Some(BatchState::Enumerating),
            "processing" => Some(BatchState::Processing),
            "completed" => Some(BatchState::Completed),
            "cancelled" => Some(BatchState::Cancelled),
            "failed" => Some(BatchState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Cancelled | BatchState::Failed
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted description of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub kind: BatchKind,
    /// Enumeration root (change batches only)
    pub root: Option<PathBuf>,
    /// Uniform target (change batches only; reverts target each snapshot)
    pub target: Option<Target>,
    pub max_depth: Option<usize>,
    pub state: BatchState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub counts: Counts,
    /// Engine fault that moved the batch to `Failed`
    pub fault: Option<String>,
}

impl BatchRecord {
    pub(crate) fn new(kind: BatchKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            root: None,
            target: None,
            max_depth: None,
            state: BatchState::Created,
            started_at: Utc::now(),
            ended_at: None,
            counts: Counts::default(),
            fault: None,
        }
    }
}
