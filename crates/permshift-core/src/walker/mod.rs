//! Lazy tree enumeration
//!
//! [`PathEnumerator`] wraps a [`walkdir`] walk: depth first, children in file
//! name order, so the sequence is deterministic for a fixed filesystem state.
//! Every node comes out exactly once. A directory that cannot be listed is
//! reported as one failure for that directory, and a directory already listed
//! through another path (a followed link) is not listed again.
//!
//! A symbolic link that loops back into its own ancestry is yielded as a
//! [`WalkFailure`] whether or not links are followed, and the walk carries on
//! with the siblings.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::error::NodeError;
use crate::{Node, NodeKind};

/// Identity of a directory, used for cycle and revisit detection
#[cfg(unix)]
type DirKey = (u64, u64);

#[cfg(not(unix))]
type DirKey = PathBuf;

#[cfg(unix)]
fn dir_key(_path: &Path, meta: &fs::Metadata) -> Option<DirKey> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn dir_key(path: &Path, _meta: &fs::Metadata) -> Option<DirKey> {
    fs::canonicalize(path).ok()
}

/// A node that could not be enumerated cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkFailure {
    pub node: Node,
    pub error: NodeError,
}

/// Depth-first enumeration of every node below (and including) a root
pub struct PathEnumerator {
    root: PathBuf,
    max_depth: Option<usize>,
    follow_links: bool,
    walk: Option<walkdir::IntoIter>,
    /// Item read ahead while checking whether a directory could be listed
    lookahead: Option<walkdir::Result<DirEntry>>,
    /// Directory keys by depth along the current branch
    ancestors: Vec<DirKey>,
    visited: HashSet<DirKey>,
    yielded: u64,
}

impl PathEnumerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_depth: None,
            follow_links: false,
            walk: None,
            lookahead: None,
            ancestors: Vec::new(),
            visited: HashSet::new(),
            yielded: 0,
        }
    }

    /// Do not yield nodes deeper than `max_depth` (root is depth 0)
    pub fn max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Descend into directories reached through symbolic links
    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    /// Number of nodes (including failures) produced so far
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    fn walk(&mut self) -> &mut walkdir::IntoIter {
        let root = &self.root;
        let max_depth = self.max_depth;
        let follow_links = self.follow_links;
        self.walk.get_or_insert_with(|| {
            let mut walk = WalkDir::new(root)
                .follow_links(follow_links)
                .sort_by_file_name();
            if let Some(depth) = max_depth {
                walk = walk.max_depth(depth);
            }
            walk.into_iter()
        })
    }

    fn pull(&mut self) -> Option<walkdir::Result<DirEntry>> {
        match self.lookahead.take() {
            Some(item) => Some(item),
            None => self.walk().next(),
        }
    }

    fn visit(&mut self, entry: DirEntry) -> Result<Node, WalkFailure> {
        let depth = entry.depth();
        let is_link = entry.path_is_symlink();
        let kind = if is_link {
            NodeKind::Symlink
        } else {
            NodeKind::from_file_type(entry.file_type())
        };
        self.ancestors.truncate(depth);

        if is_link && !self.follow_links {
            if let Some(target) = self.loops_back(entry.path()) {
                return Err(WalkFailure {
                    error: NodeError::CyclicLink {
                        path: entry.path().to_path_buf(),
                        target,
                    },
                    node: Node::new(entry.into_path(), kind, depth),
                });
            }
            return Ok(Node::new(entry.into_path(), kind, depth));
        }

        if !entry.file_type().is_dir() {
            return Ok(Node::new(entry.into_path(), kind, depth));
        }

        let key = entry
            .metadata()
            .ok()
            .and_then(|meta| dir_key(entry.path(), &meta));
        if let Some(key) = key {
            if !self.visited.insert(key.clone()) {
                tracing::debug!("Already listed {}, not descending", entry.path().display());
                self.walk().skip_current_dir();
                return Ok(Node::new(entry.into_path(), kind, depth));
            }
            self.ancestors.push(key);
        }

        // A listing failure surfaces as the next item of the walk
        match self.walk().next() {
            Some(Err(err)) if is_listing_error(&err, entry.path()) => {
                let reason = err
                    .io_error()
                    .map_or_else(|| err.to_string(), io::Error::to_string);
                Err(WalkFailure {
                    error: NodeError::ListFailed {
                        path: entry.path().to_path_buf(),
                        reason,
                    },
                    node: Node::new(entry.into_path(), kind, depth),
                })
            }
            next => {
                self.lookahead = next;
                Ok(Node::new(entry.into_path(), kind, depth))
            }
        }
    }

    /// Path of the ancestor directory an unfollowed link resolves to, if any
    fn loops_back(&self, link: &Path) -> Option<PathBuf> {
        let meta = fs::metadata(link).ok().filter(|meta| meta.is_dir())?;
        let key = dir_key(link, &meta)?;
        let level = self.ancestors.iter().position(|k| *k == key)?;
        link.ancestors()
            .nth(self.ancestors.len() - level)
            .map(Path::to_path_buf)
    }

    fn failure(&self, err: walkdir::Error) -> Result<Node, WalkFailure> {
        let depth = err.depth();
        let path = err
            .path()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);

        if let Some(target) = err.loop_ancestor() {
            return Err(WalkFailure {
                error: NodeError::CyclicLink {
                    path: path.clone(),
                    target: target.to_path_buf(),
                },
                node: Node::new(path, NodeKind::Symlink, depth),
            });
        }

        // Following a dangling link fails; the link itself is still a node
        if self.follow_links {
            if let Ok(meta) = fs::symlink_metadata(&path) {
                if meta.file_type().is_symlink() {
                    return Ok(Node::new(path, NodeKind::Symlink, depth));
                }
            }
        }

        let error = match err.io_error() {
            Some(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                NodeError::from_io("stat", &path, io_err)
            }
            Some(io_err) => NodeError::ListFailed {
                path: path.clone(),
                reason: io_err.to_string(),
            },
            None => NodeError::ListFailed {
                path: path.clone(),
                reason: err.to_string(),
            },
        };
        Err(WalkFailure {
            node: Node::new(path, NodeKind::Other, depth),
            error,
        })
    }
}

fn is_listing_error(err: &walkdir::Error, dir: &Path) -> bool {
    err.loop_ancestor().is_none() && err.io_error().is_some() && err.path() == Some(dir)
}

impl Iterator for PathEnumerator {
    type Item = Result<Node, WalkFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.pull()? {
            Ok(entry) => self.visit(entry),
            Err(err) => self.failure(err),
        };
        self.yielded += 1;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("b.txt"), b"b").unwrap();
        fs::create_dir(root.join("sub").join("deeper")).unwrap();
        fs::write(root.join("sub").join("deeper").join("c.txt"), b"c").unwrap();
        temp_dir
    }

    fn relative(root: &Path, items: Vec<Result<Node, WalkFailure>>) -> Vec<String> {
        items
            .into_iter()
            .map(|item| {
                let path = match item {
                    Ok(node) => node.path,
                    Err(failure) => failure.node.path,
                };
                path.strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[test]
    fn test_depth_first_name_order() {
        let temp_dir = build_tree();
        let root = temp_dir.path();

        let items: Vec<_> = PathEnumerator::new(root).collect();
        assert!(items.iter().all(|i| i.is_ok()));
        assert_eq!(
            relative(root, items),
            vec![
                "",
                "a.txt",
                "sub",
                "sub/b.txt",
                "sub/deeper",
                "sub/deeper/c.txt"
            ]
        );
    }

    #[test]
    fn test_enumeration_is_deterministic() {
        let temp_dir = build_tree();
        let first: Vec<_> = PathEnumerator::new(temp_dir.path()).collect();
        let second: Vec<_> = PathEnumerator::new(temp_dir.path()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_max_depth_limits_listing() {
        let temp_dir = build_tree();
        let root = temp_dir.path();

        let only_root: Vec<_> = PathEnumerator::new(root).max_depth(Some(0)).collect();
        assert_eq!(only_root.len(), 1);

        let one_level: Vec<_> = PathEnumerator::new(root).max_depth(Some(1)).collect();
        assert_eq!(relative(root, one_level), vec!["", "a.txt", "sub"]);
    }

    #[test]
    fn test_kinds_and_depths() {
        let temp_dir = build_tree();
        let nodes: Vec<Node> = PathEnumerator::new(temp_dir.path())
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(nodes[0].kind, NodeKind::Directory);
        assert_eq!(nodes[0].depth, 0);
        let c = nodes.last().unwrap();
        assert_eq!(c.kind, NodeKind::File);
        assert_eq!(c.depth, 3);
    }

    #[test]
    fn test_missing_root_is_single_failure() {
        let temp_dir = TempDir::new().unwrap();
        let items: Vec<_> = PathEnumerator::new(temp_dir.path().join("missing")).collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0],
            Err(WalkFailure {
                error: NodeError::Vanished { .. },
                ..
            })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_self_referential_link_is_one_error() {
        let temp_dir = build_tree();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(".", root.join("sub").join("loop")).unwrap();

        for follow in [false, true] {
            let items: Vec<_> = PathEnumerator::new(root).follow_links(follow).collect();
            let failures: Vec<_> = items.iter().filter_map(|i| i.as_ref().err()).collect();
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].error, NodeError::CyclicLink { .. }));
            assert!(failures[0].node.path.ends_with("sub/loop"));
            assert_eq!(items.len(), 7);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_link_to_ancestor_is_cycle() {
        let temp_dir = build_tree();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(root, root.join("sub").join("deeper").join("up")).unwrap();

        let items: Vec<_> = PathEnumerator::new(root).follow_links(true).collect();
        let failures = items.iter().filter(|i| i.is_err()).count();
        assert_eq!(failures, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_follow_links_descends_once() {
        let temp_dir = build_tree();
        let root = temp_dir.path();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("x.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("ext")).unwrap();

        let plain: Vec<_> = PathEnumerator::new(root).collect();
        let followed: Vec<_> = PathEnumerator::new(root).follow_links(true).collect();

        assert_eq!(followed.len(), plain.len() + 1);
        assert!(followed
            .iter()
            .any(|i| matches!(i, Ok(n) if n.path.ends_with("ext/x.txt"))));
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_reached_twice_is_listed_once() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("z")).unwrap();
        fs::write(root.join("z").join("x.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("z"), root.join("a_link")).unwrap();

        let items: Vec<_> = PathEnumerator::new(root).follow_links(true).collect();
        assert!(items.iter().all(|i| i.is_ok()));
        assert_eq!(relative(root, items), vec!["", "a_link", "a_link/x.txt", "z"]);

        let plain: Vec<_> = PathEnumerator::new(root).collect();
        assert_eq!(relative(root, plain), vec!["", "a_link", "z", "z/x.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_link_is_plain_node() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(root.join("missing"), root.join("dangling")).unwrap();

        for follow in [false, true] {
            let nodes: Vec<Node> = PathEnumerator::new(root)
                .follow_links(follow)
                .map(|r| r.unwrap())
                .collect();
            assert_eq!(nodes.len(), 2);
            assert_eq!(nodes[1].kind, NodeKind::Symlink);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_continues() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = build_tree();
        let root = temp_dir.path();
        let locked = root.join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("hidden.txt"), b"h").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root ignores directory permissions; nothing to observe then
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let items: Vec<_> = PathEnumerator::new(root).collect();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let failures: Vec<_> = items.iter().filter_map(|i| i.as_ref().err()).collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, NodeError::ListFailed { .. }));
        assert!(items
            .iter()
            .any(|i| matches!(i, Ok(n) if n.path.ends_with("sub/deeper/c.txt"))));
    }
}
