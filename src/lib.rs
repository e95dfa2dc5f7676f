// src/lib.rs

//! imagepkg - dependency solving and image planning for IPS-style images
//!
//! Given a catalog of package versions, the installed state of an image and a
//! requested operation, the engine selects a consistent set of package
//! versions, turns the difference into an ordered list of content actions,
//! and carries linked child images along with their parent.
//!
//! # Architecture
//!
//! - `fmri`: package identity and version ordering
//! - `catalog`: indexed, variant-filtered package metadata
//! - `solver`: constraint propagation plus deterministic branch-and-bound search
//! - `plan`: content diff, conflict detection and action ordering
//! - `transaction`: journaled execution through an external executor
//! - `linked`: parent/child image coordination
//!
//! Image state lives in SQLite under `<root>/var/pkg/`. Fetching content and
//! touching the real filesystem stay outside the engine, behind the
//! `ContentFetcher` and `ActionExecutor` traits.

pub mod catalog;
pub mod config;
pub mod db;
mod error;
pub mod fmri;
pub mod hash;
pub mod image;
pub mod linked;
pub mod paths;
pub mod plan;
pub mod progress;
pub mod solver;
pub mod transaction;

pub use catalog::{
    Catalog, CatalogEntry, CatalogFeed, CatalogView, FileFeed, LoadReport, MemoryFeed, PackageInfo,
};
pub use config::{ConfigError, EngineConfig};
pub use error::{Error, Result};
pub use fmri::{Fmri, PackageSpec, Version, VersionRange};
pub use hash::{Fingerprint, HashAlgorithm};
pub use image::{Image, ImageConfig, ImageLock, ImageState};
pub use linked::{ChildRelation, ChildState, Coordinator, LinkPolicy, LinkedPlan, LockSet};
pub use plan::{
    ActionOp, ContentAction, ContentFetcher, Finding, ImagePlan, ManifestSource, MemoryManifests,
    PlanState, PlanSummary, PlannedAction, Planner, Setting, VerifyReport,
};
pub use progress::{CancelToken, CliProgress, LogProgress, ProgressTracker, SilentProgress};
pub use solver::{Explanation, PackageChange, Solution, SolveRequest, Solver};
pub use transaction::{
    ActionExecutor, MetadataOnly, RecoveryOutcome, StagedTransaction, Transaction,
    TransactionOptions, TransactionPhase,
};
