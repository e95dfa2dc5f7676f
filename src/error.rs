// src/error.rs

use crate::plan::PathConflict;
use crate::solver::Explanation;
use thiserror::Error;

/// Core error types for the image engine
#[derive(Error, Debug)]
pub enum Error {
    /// A package identifier could not be parsed
    #[error("Malformed FMRI '{fmri}': {reason}")]
    MalformedFmri { fmri: String, reason: String },

    /// A version range expression could not be parsed
    #[error("Invalid version range '{range}': {reason}")]
    InvalidRange { range: String, reason: String },

    /// The solver exhausted every choice without a consistent selection
    #[error("No solution found for the requested operation:\n{0}")]
    Unsatisfiable(Box<Explanation>),

    /// Two packages deliver the same path (or identity) incompatibly
    #[error("{0}")]
    PathConflict(Box<PathConflict>),

    /// The action graph contains a cycle (malformed action metadata)
    #[error("Action ordering cycle detected between: {}", .actions.join(", "))]
    PlanCycle { actions: Vec<String> },

    /// A recurse-linked child image could not follow the parent
    #[error("Linked image {child} failed to sync: {reason}")]
    SyncFailed { child: String, reason: String },

    /// Another mutating operation holds the image lock
    #[error("Image at {path} is locked by another operation")]
    LockContention { path: String },

    /// The external transport/content collaborator failed
    #[error("Transport failure while fetching {what}: {reason}")]
    TransportFailure { what: String, reason: String },

    /// A request pattern matched no known package
    #[error("'{0}' matches no packages in the current catalog")]
    UnknownPackage(String),

    /// An operation targeted a package that is not installed
    #[error("'{0}' is not installed")]
    NotInstalled(String),

    /// A well-formed but inapplicable request
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled during {0}")]
    Cancelled(String),

    /// Action execution failed after the point where actions were being applied
    #[error("Execution failed at action {failed} ({completed} action(s) completed): {reason}")]
    ExecutionFailed {
        completed: usize,
        failed: String,
        reason: String,
    },

    /// The transaction journal cannot establish which actions were applied
    #[error("Transaction journal corrupted: {0}")]
    JournalCorrupted(String),

    /// Plan used out of lifecycle order
    #[error("Plan is {found}, expected {expected}")]
    InvalidPlanState { expected: String, found: String },

    /// Engine configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No image metadata at the given root
    #[error("No image found at {0}")]
    ImageNotFound(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a malformed FMRI error
    pub(crate) fn malformed(fmri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedFmri {
            fmri: fmri.into(),
            reason: reason.into(),
        }
    }

    /// True when the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportFailure { .. } | Self::LockContention { .. })
    }
}

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;
