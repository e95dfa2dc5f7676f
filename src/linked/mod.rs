// src/linked/mod.rs

//! Linked images
//!
//! A parent image records its children by path together with a propagation
//! policy. The parent does not own a child's state: the coordinator opens the
//! child through an [`ImageProvider`] when an operation needs it.
//!
//! Child state machine:
//!
//! ```text
//! Detached -> Attached -> Syncing -> Synced | SyncFailed
//! ```
//!
//! `Synced` and `SyncFailed` re-enter `Syncing` on the next parent operation;
//! any settled state can be detached.

mod coordinator;
mod lock_set;

pub use coordinator::{ChildPlan, Coordinator, ExecutorFactory, LinkedPlan};
pub use lock_set::LockSet;

use crate::error::{Error, Result};
use crate::image::{Image, ImageState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{Display, EnumString};

/// How a parent operation propagates to a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LinkPolicy {
    /// Child must track the parent's versions of shared packages
    Recurse,
    /// Child is synced when possible; failures do not stop the parent
    Ignore,
    /// Never touched
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ChildState {
    Detached,
    Attached,
    Syncing,
    Synced,
    SyncFailed,
}

impl ChildState {
    pub fn can_transition(self, to: ChildState) -> bool {
        use ChildState::*;
        matches!(
            (self, to),
            (Detached, Attached)
                | (Attached | Synced | SyncFailed, Detached)
                | (Attached | Synced | SyncFailed, Syncing)
                | (Syncing, Synced | SyncFailed)
        )
    }

    /// Move to `to`, rejecting transitions the state machine does not allow
    pub fn transition(self, to: ChildState) -> Result<ChildState> {
        if !self.can_transition(to) {
            return Err(Error::InvalidOperation(format!(
                "linked image cannot go from {} to {}",
                self, to
            )));
        }
        Ok(to)
    }

    /// Whether parent operations reach a child in this state
    pub fn participates(self) -> bool {
        !matches!(self, ChildState::Detached)
    }
}

/// A parent's record of one child image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRelation {
    pub name: String,
    pub path: PathBuf,
    pub policy: LinkPolicy,
    pub state: ChildState,
}

impl ChildRelation {
    /// A newly attached child
    pub fn new(name: &str, path: impl Into<PathBuf>, policy: LinkPolicy) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            policy,
            state: ChildState::Attached,
        }
    }

    /// Whether the coordinator should plan for this child at all
    pub fn is_active(&self) -> bool {
        self.policy != LinkPolicy::Exclude && self.state.participates()
    }
}

/// Lists the children of a parent image
pub trait ChildEnumerator {
    fn children(&self) -> Result<Vec<ChildRelation>>;
}

impl ChildEnumerator for Image {
    fn children(&self) -> Result<Vec<ChildRelation>> {
        Image::children(self)
    }
}

/// Loads a child image's state by its recorded path
pub trait ImageProvider {
    fn load_state(&self, child: &ChildRelation) -> Result<ImageState>;
}

/// Children stored as images on the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskImages;

impl ImageProvider for DiskImages {
    fn load_state(&self, child: &ChildRelation) -> Result<ImageState> {
        Image::open(&child.path)?.load_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_transitions() {
        let state = ChildState::Attached;
        let state = state.transition(ChildState::Syncing).unwrap();
        let state = state.transition(ChildState::SyncFailed).unwrap();
        let state = state.transition(ChildState::Syncing).unwrap();
        let state = state.transition(ChildState::Synced).unwrap();
        assert_eq!(state, ChildState::Synced);
        assert!(state.transition(ChildState::Detached).is_ok());
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(matches!(
            ChildState::Detached.transition(ChildState::Syncing),
            Err(Error::InvalidOperation(_))
        ));
        assert!(ChildState::Attached.transition(ChildState::Synced).is_err());
        assert!(ChildState::Syncing.transition(ChildState::Detached).is_err());
        assert!(ChildState::Synced.transition(ChildState::Synced).is_err());
    }

    #[test]
    fn test_names_round_trip() {
        assert_eq!(ChildState::SyncFailed.to_string(), "sync-failed");
        assert_eq!(ChildState::from_str("sync-failed").unwrap(), ChildState::SyncFailed);
        assert_eq!(LinkPolicy::from_str("exclude").unwrap(), LinkPolicy::Exclude);
    }

    #[test]
    fn test_active_children() {
        let mut child = ChildRelation::new("zone1", "/zones/one", LinkPolicy::Recurse);
        assert!(child.is_active());
        child.state = ChildState::Detached;
        assert!(!child.is_active());
        let excluded = ChildRelation::new("zone2", "/zones/two", LinkPolicy::Exclude);
        assert!(!excluded.is_active());
    }
}
