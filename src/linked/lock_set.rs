// src/linked/lock_set.rs

//! Ordered locking across a linked-image hierarchy
//!
//! The parent is locked first, then each active child in path order. Locks
//! are released in reverse order of acquisition.

use super::ChildRelation;
use crate::error::Result;
use crate::image::ImageLock;
use crate::paths;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive locks on a parent and its active children
#[derive(Debug)]
pub struct LockSet {
    locks: Vec<ImageLock>,
}

impl LockSet {
    /// Lock `parent_root` and every active child
    ///
    /// A failure releases whatever was already taken before returning.
    pub fn acquire(parent_root: &Path, children: &[ChildRelation], retries: u32) -> Result<Self> {
        let mut roots: Vec<&Path> = children
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.path.as_path())
            .collect();
        roots.sort();
        roots.dedup();

        let mut set = Self {
            locks: Vec::with_capacity(roots.len() + 1),
        };
        set.locks
            .push(ImageLock::exclusive(paths::lock_path(parent_root), retries)?);
        for root in roots {
            set.locks
                .push(ImageLock::exclusive(paths::lock_path(root), retries)?);
        }

        debug!("Locked {} image(s)", set.locks.len());
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Lock files in acquisition order
    pub fn paths(&self) -> Vec<PathBuf> {
        self.locks.iter().map(|l| l.path().to_path_buf()).collect()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(lock) = self.locks.pop() {
            drop(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::linked::LinkPolicy;
    use tempfile::TempDir;

    #[test]
    fn test_parent_then_children_by_path() {
        let dir = TempDir::new().unwrap();
        let parent = dir.path().join("root");
        let children = vec![
            ChildRelation::new("b", dir.path().join("zones/b"), LinkPolicy::Recurse),
            ChildRelation::new("a", dir.path().join("zones/a"), LinkPolicy::Ignore),
            ChildRelation::new("c", dir.path().join("zones/c"), LinkPolicy::Exclude),
        ];

        let set = LockSet::acquire(&parent, &children, 0).unwrap();
        assert_eq!(
            set.paths(),
            vec![
                paths::lock_path(&parent),
                paths::lock_path(&dir.path().join("zones/a")),
                paths::lock_path(&dir.path().join("zones/b")),
            ]
        );

        assert!(matches!(
            ImageLock::exclusive(paths::lock_path(&dir.path().join("zones/b")), 0),
            Err(Error::LockContention { .. })
        ));
        drop(set);
        assert!(ImageLock::exclusive(paths::lock_path(&parent), 0).is_ok());
    }

    #[test]
    fn test_contended_child_releases_parent() {
        let dir = TempDir::new().unwrap();
        let parent = dir.path().join("root");
        let child = dir.path().join("zones/a");
        let _held = ImageLock::exclusive(paths::lock_path(&child), 0).unwrap();

        let children = vec![ChildRelation::new("a", &child, LinkPolicy::Recurse)];
        assert!(matches!(
            LockSet::acquire(&parent, &children, 0),
            Err(Error::LockContention { .. })
        ));
        assert!(ImageLock::exclusive(paths::lock_path(&parent), 0).is_ok());
    }
}
