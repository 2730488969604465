//! OS permission capability
//!
//! The engine never touches ownership or permission bits directly. It goes
//! through [`PermissionOps`], which is injected at construction time:
//! [`SystemOps`] talks to the real filesystem, [`MemoryOps`] keeps an
//! in-memory table (tests, dry runs).

use std::path::Path;

use crate::error::NodeError;
use crate::{Mode, NodeState, Ownership, Target};

pub mod memory;
pub mod system;

pub use memory::MemoryOps;
pub use system::{current_user, SystemOps};

/// Fallible, synchronous, single-node operations.
///
/// None of these operations follow a symbolic link at `path`; links are
/// read and changed as themselves.
pub trait PermissionOps: Send + Sync {
    fn get_owner(&self, path: &Path) -> Result<Ownership, NodeError>;

    /// Set the owning user, and the group when `group` is given
    fn set_owner(&self, path: &Path, user: &str, group: Option<&str>) -> Result<(), NodeError>;

    fn get_permissions(&self, path: &Path) -> Result<Mode, NodeError>;

    fn set_permissions(&self, path: &Path, mode: Mode) -> Result<(), NodeError>;

    /// Rewrite `target` in the form [`PermissionOps::get_owner`] reports, so
    /// that `1000` and `alice` compare equal when they name the same account
    fn canonical_target(&self, target: &Target) -> Result<Target, NodeError> {
        Ok(target.clone())
    }

    /// Read owner and permissions together
    fn read_state(&self, path: &Path) -> Result<NodeState, NodeError> {
        Ok(NodeState {
            owner: self.get_owner(path)?,
            mode: self.get_permissions(path)?,
        })
    }
}
