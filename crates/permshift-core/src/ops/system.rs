//! Real filesystem implementation of [`PermissionOps`]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::NodeError;
use crate::ops::PermissionOps;
use crate::{Mode, Ownership, Target};

/// Filesystem-backed permission capability.
///
/// Uid/gid to name lookups are cached for the lifetime of the value, since
/// a tree usually has only a handful of distinct owners.
#[derive(Default)]
pub struct SystemOps {
    user_names: Mutex<HashMap<u32, String>>,
    group_names: Mutex<HashMap<u32, String>>,
}

impl SystemOps {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use nix::unistd::{Gid, Group, Uid, User};
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    impl SystemOps {
        fn user_name(&self, uid: u32) -> String {
            let mut cache = self
                .user_names
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache
                .entry(uid)
                .or_insert_with(|| match User::from_uid(Uid::from_raw(uid)) {
                    Ok(Some(user)) => user.name,
                    _ => uid.to_string(),
                })
                .clone()
        }

        fn group_name(&self, gid: u32) -> String {
            let mut cache = self
                .group_names
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache
                .entry(gid)
                .or_insert_with(|| match Group::from_gid(Gid::from_raw(gid)) {
                    Ok(Some(group)) => group.name,
                    _ => gid.to_string(),
                })
                .clone()
        }
    }

    pub(super) fn resolve_uid(spec: &str) -> Result<u32, NodeError> {
        let trimmed = spec.trim();
        if let Ok(id) = trimmed.parse::<u32>() {
            return Ok(id);
        }
        match User::from_name(trimmed) {
            Ok(Some(user)) => Ok(user.uid.as_raw()),
            Ok(None) => Err(NodeError::LookupFailed {
                name: trimmed.to_string(),
                reason: "user not found".to_string(),
            }),
            Err(e) => Err(NodeError::LookupFailed {
                name: trimmed.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    pub(super) fn resolve_gid(spec: &str) -> Result<u32, NodeError> {
        let trimmed = spec.trim();
        if let Ok(id) = trimmed.parse::<u32>() {
            return Ok(id);
        }
        match Group::from_name(trimmed) {
            Ok(Some(group)) => Ok(group.gid.as_raw()),
            Ok(None) => Err(NodeError::LookupFailed {
                name: trimmed.to_string(),
                reason: "group not found".to_string(),
            }),
            Err(e) => Err(NodeError::LookupFailed {
                name: trimmed.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    impl PermissionOps for SystemOps {
        fn canonical_target(&self, target: &Target) -> Result<Target, NodeError> {
            match target {
                Target::Owner { user, group } => {
                    let user = self.user_name(resolve_uid(user)?);
                    let group = group
                        .as_deref()
                        .map(|group| resolve_gid(group).map(|gid| self.group_name(gid)))
                        .transpose()?;
                    Ok(Target::Owner { user, group })
                }
                Target::Permissions(_) => Ok(target.clone()),
            }
        }

        fn get_owner(&self, path: &Path) -> Result<Ownership, NodeError> {
            let meta =
                fs::symlink_metadata(path).map_err(|e| NodeError::from_io("stat", path, &e))?;
            Ok(Ownership {
                user: self.user_name(meta.uid()),
                group: self.group_name(meta.gid()),
            })
        }

        fn set_owner(
            &self,
            path: &Path,
            user: &str,
            group: Option<&str>,
        ) -> Result<(), NodeError> {
            let uid = resolve_uid(user)?;
            let gid = group.map(resolve_gid).transpose()?;
            std::os::unix::fs::lchown(path, Some(uid), gid)
                .map_err(|e| NodeError::from_io("chown", path, &e))
        }

        fn get_permissions(&self, path: &Path) -> Result<Mode, NodeError> {
            let meta =
                fs::symlink_metadata(path).map_err(|e| NodeError::from_io("stat", path, &e))?;
            Ok(Mode::from_bits(meta.mode()))
        }

        fn set_permissions(&self, path: &Path, mode: Mode) -> Result<(), NodeError> {
            let meta =
                fs::symlink_metadata(path).map_err(|e| NodeError::from_io("stat", path, &e))?;
            if meta.file_type().is_symlink() {
                return Err(NodeError::Unsupported {
                    operation: "chmod",
                    path: path.to_path_buf(),
                });
            }
            fs::set_permissions(path, fs::Permissions::from_mode(mode.bits()))
                .map_err(|e| NodeError::from_io("chmod", path, &e))
        }
    }

    /// Name of the user running the process
    pub fn current_user() -> Option<String> {
        match User::from_uid(Uid::current()) {
            Ok(Some(user)) => Some(user.name),
            _ => std::env::var("USER").ok(),
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    use super::*;

    impl PermissionOps for SystemOps {
        fn get_owner(&self, path: &Path) -> Result<Ownership, NodeError> {
            Err(NodeError::Unsupported {
                operation: "read owner",
                path: path.to_path_buf(),
            })
        }

        fn set_owner(&self, path: &Path, _user: &str, _group: Option<&str>) -> Result<(), NodeError> {
            Err(NodeError::Unsupported {
                operation: "chown",
                path: path.to_path_buf(),
            })
        }

        fn get_permissions(&self, path: &Path) -> Result<Mode, NodeError> {
            Err(NodeError::Unsupported {
                operation: "read permissions",
                path: path.to_path_buf(),
            })
        }

        fn set_permissions(&self, path: &Path, _mode: Mode) -> Result<(), NodeError> {
            Err(NodeError::Unsupported {
                operation: "chmod",
                path: path.to_path_buf(),
            })
        }
    }

    pub fn current_user() -> Option<String> {
        std::env::var("USERNAME").ok()
    }
}

#[cfg(unix)]
pub use unix::current_user;

#[cfg(not(unix))]
pub use fallback::current_user;
