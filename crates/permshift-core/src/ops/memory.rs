//! In-memory [`PermissionOps`] for tests and dry runs

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::NodeError;
use crate::ops::PermissionOps;
use crate::{Mode, NodeState, Ownership};

type MutationHook = Box<dyn Fn(&Path, u64) + Send + Sync>;

/// Ownership table keyed by path.
///
/// Paths that were never inserted behave like vanished files. Paths marked
/// with [`MemoryOps::fail_on`] reject every mutation with a permission error.
#[derive(Default)]
pub struct MemoryOps {
    states: Mutex<HashMap<PathBuf, NodeState>>,
    failing: Mutex<HashSet<PathBuf>>,
    mutations: AtomicU64,
    hook: Mutex<Option<MutationHook>>,
}

impl MemoryOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, state: NodeState) {
        self.lock_states().insert(path.into(), state);
    }

    /// Current state of `path`, if known
    pub fn state(&self, path: &Path) -> Option<NodeState> {
        self.lock_states().get(path).cloned()
    }

    pub fn remove(&self, path: &Path) -> Option<NodeState> {
        self.lock_states().remove(path)
    }

    /// Make every later mutation of `path` fail
    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        self.failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.into());
    }

    /// Number of successful set operations so far
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Run `hook` after every successful mutation with the running count
    pub fn set_hook<F>(&self, hook: F)
    where
        F: Fn(&Path, u64) + Send + Sync + 'static,
    {
        *self.hook.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Box::new(hook));
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, NodeState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(&self, operation: &'static str, path: &Path) -> Result<(), NodeError> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failing.contains(path) {
            return Err(NodeError::Os {
                operation,
                path: path.to_path_buf(),
                reason: "Operation not permitted".to_string(),
            });
        }
        Ok(())
    }

    fn mutated(&self, path: &Path) {
        let count = self.mutations.fetch_add(1, Ordering::SeqCst) + 1;
        let hook = self.hook.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(hook) = hook.as_ref() {
            hook(path, count);
        }
    }

    fn vanished(path: &Path) -> NodeError {
        NodeError::Vanished {
            path: path.to_path_buf(),
        }
    }
}

impl PermissionOps for MemoryOps {
    fn get_owner(&self, path: &Path) -> Result<Ownership, NodeError> {
        self.state(path)
            .map(|s| s.owner)
            .ok_or_else(|| Self::vanished(path))
    }

    fn set_owner(&self, path: &Path, user: &str, group: Option<&str>) -> Result<(), NodeError> {
        self.check_writable("chown", path)?;
        {
            let mut states = self.lock_states();
            let state = states.get_mut(path).ok_or_else(|| Self::vanished(path))?;
            state.owner.user = user.to_string();
            if let Some(group) = group {
                state.owner.group = group.to_string();
            }
        }
        self.mutated(path);
        Ok(())
    }

    fn get_permissions(&self, path: &Path) -> Result<Mode, NodeError> {
        self.state(path)
            .map(|s| s.mode)
            .ok_or_else(|| Self::vanished(path))
    }

    fn set_permissions(&self, path: &Path, mode: Mode) -> Result<(), NodeError> {
        self.check_writable("chmod", path)?;
        {
            let mut states = self.lock_states();
            let state = states.get_mut(path).ok_or_else(|| Self::vanished(path))?;
            state.mode = mode;
        }
        self.mutated(path);
        Ok(())
    }
}
