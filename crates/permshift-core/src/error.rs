//! Error types for permshift
//!
//! Two layers are kept apart:
//! - [`NodeError`] describes a failure on one node. It never aborts a batch;
//!   the worker turns it into an `Outcome::Error` entry.
//! - [`EngineError`] covers faults that stop a batch (store unreachable,
//!   worker spawn failure) plus caller mistakes such as unknown batch ids.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::BatchId;

/// Failure local to a single node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("permission denied: '{path}'")]
    PermissionDenied { path: PathBuf },

    /// Path disappeared between enumeration and processing
    #[error("path vanished: '{path}'")]
    Vanished { path: PathBuf },

    #[error("cyclic link: '{path}' resolves to ancestor '{target}'")]
    CyclicLink { path: PathBuf, target: PathBuf },

    #[error("failed to list directory '{path}': {reason}")]
    ListFailed { path: PathBuf, reason: String },

    #[error("{operation} failed on '{path}': {reason}")]
    Os {
        operation: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("{operation} is not supported on '{path}'")]
    Unsupported {
        operation: &'static str,
        path: PathBuf,
    },

    #[error("failed to resolve '{name}': {reason}")]
    LookupFailed { name: String, reason: String },

    #[error("snapshot store unavailable: {reason}")]
    StoreUnavailable { reason: String },
}

impl NodeError {
    /// Classify an I/O error raised while touching `path`
    pub fn from_io(operation: &'static str, path: &Path, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => NodeError::Vanished {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => NodeError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => NodeError::Os {
                operation,
                path: path.to_path_buf(),
                reason: err.to_string(),
            },
        }
    }
}

/// Metadata store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid batch id in store: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("invalid timestamp in store: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("failed to prepare store at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Could not determine where the default database lives
    #[error("no home directory to place the history database in")]
    NoHomeDirectory,

    /// A stored row could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("batch {0} is not recorded in the store")]
    MissingBatch(BatchId),

    #[error("batch prefix '{0}' matches more than one batch")]
    AmbiguousBatch(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Invalid engine configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("queue capacity must be at least 1")]
    ZeroQueueCapacity,

    #[error("progress interval must be at least 1")]
    ZeroProgressInterval,
}

/// Unparsable owner or mode specification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid owner specification '{0}' (expected user or user:group)")]
    InvalidOwner(String),

    #[error("invalid mode specification '{0}' (expected octal like 755 or u=rwx,g=rx,o=)")]
    InvalidMode(String),
}

/// Batch-level errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Store failure that makes further progress meaningless
    #[error("metadata store failure: {0}")]
    Store(#[from] StoreError),

    #[error("failed to start worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// Revert requested for a batch with no recorded snapshots
    #[error("no snapshots recorded for batch {0}")]
    RevertNotFound(BatchId),

    #[error("unknown batch: {0}")]
    UnknownBatch(String),

    #[error("batch {0} has already been launched")]
    AlreadyLaunched(BatchId),

    #[error("batch {0} did not produce a report")]
    Incomplete(BatchId),
}

impl EngineError {
    /// True for faults that move a batch to `Failed`
    pub fn is_fault(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::Spawn(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
