//! Read-only ownership audit
//!
//! Walks a tree like a change batch would and reports which nodes do not
//! match a target, without writing snapshots or mutating anything.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ops::PermissionOps;
use crate::walker::{PathEnumerator, WalkFailure};
use crate::{Node, NodeKind, NodeState, Target};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub path: PathBuf,
    pub kind: NodeKind,
    /// Current state, when it could be read
    pub state: Option<NodeState>,
    /// A change batch with the same target would modify this node
    pub needs_change: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Entries in enumeration order
    pub entries: Vec<AuditEntry>,
}

impl AuditReport {
    pub fn needing_change(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(|e| e.needs_change)
    }

    pub fn errors(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(|e| e.error.is_some())
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }
}

/// Compare every node under `root` against `target`
pub fn audit(
    ops: &dyn PermissionOps,
    root: &Path,
    target: &Target,
    config: &EngineConfig,
) -> Result<AuditReport> {
    config.validate()?;
    let target = match ops.canonical_target(target) {
        Ok(canonical) => canonical,
        Err(e) => {
            warn!(%target, error = %e, "Could not resolve expected owner");
            target.clone()
        }
    };
    let target = &target;

    let walked: Vec<std::result::Result<Node, WalkFailure>> = PathEnumerator::new(root)
        .max_depth(config.max_depth)
        .follow_links(config.follow_links)
        .collect();

    let pool = ThreadPoolBuilder::new()
        .num_threads(config.concurrency)
        .thread_name(|i| format!("permshift-audit-{}", i))
        .build()
        .map_err(|e| EngineError::Spawn(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

    let entries: Vec<AuditEntry> = pool.install(|| {
        walked
            .into_par_iter()
            .map(|item| match item {
                Ok(node) => inspect(ops, node, target),
                Err(WalkFailure { node, error }) => AuditEntry {
                    path: node.path,
                    kind: node.kind,
                    state: None,
                    needs_change: false,
                    error: Some(error.to_string()),
                },
            })
            .collect()
    });

    let report = AuditReport { entries };
    info!(
        root = %root.display(),
        nodes = report.total(),
        mismatched = report.needing_change().count(),
        errors = report.errors().count(),
        "Audit finished"
    );
    Ok(report)
}

fn inspect(ops: &dyn PermissionOps, node: Node, target: &Target) -> AuditEntry {
    match ops.read_state(&node.path) {
        Ok(state) => AuditEntry {
            needs_change: !target.is_satisfied_by(&state),
            path: node.path,
            kind: node.kind,
            state: Some(state),
            error: None,
        },
        Err(e) => AuditEntry {
            path: node.path,
            kind: node.kind,
            state: None,
            needs_change: false,
            error: Some(e.to_string()),
        },
    }
}
