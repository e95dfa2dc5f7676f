// src/solver/request.rs

//! Solve requests
//!
//! A request is built once and handed to the solver by reference; the solver
//! never changes it.

use crate::fmri::{Fmri, PackageSpec, Version};
use std::collections::BTreeMap;
use std::fmt;

/// One requested operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Install a package matching the pattern
    Install(PackageSpec),
    /// Update one installed package, or every installed package with `None`
    Update(Option<PackageSpec>),
    /// Remove an installed package
    Remove(String),
    /// Select exactly this version (downgrades allowed)
    Exact(Fmri),
}

impl Operation {
    pub fn target_name(&self) -> Option<&str> {
        match self {
            Operation::Install(spec) => Some(&spec.name),
            Operation::Update(spec) => spec.as_ref().map(|s| s.name.as_str()),
            Operation::Remove(name) => Some(name),
            Operation::Exact(fmri) => Some(&fmri.name),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Install(spec) => write!(f, "install {}", spec),
            Operation::Update(Some(spec)) => write!(f, "update {}", spec),
            Operation::Update(None) => write!(f, "update all packages"),
            Operation::Remove(name) => write!(f, "remove {}", name),
            Operation::Exact(fmri) => write!(f, "install exactly {}", fmri),
        }
    }
}

/// The operation set of one solve plus its modifiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveRequest {
    pub operations: Vec<Operation>,
    /// Permit selecting versions older than the installed ones
    pub allow_downgrade: bool,
    /// Boot environment name recorded for recovery
    pub be_name: Option<String>,
    /// Compute the solution and plan without executing
    pub dry_run: bool,
    /// Exact versions imposed by a linked parent image (only if present)
    pub pins: BTreeMap<String, Version>,
}

impl SolveRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(mut self, spec: PackageSpec) -> Self {
        self.operations.push(Operation::Install(spec));
        self
    }

    pub fn update(mut self, spec: PackageSpec) -> Self {
        self.operations.push(Operation::Update(Some(spec)));
        self
    }

    pub fn update_all(mut self) -> Self {
        self.operations.push(Operation::Update(None));
        self
    }

    pub fn remove(mut self, name: &str) -> Self {
        self.operations.push(Operation::Remove(name.to_string()));
        self
    }

    pub fn exact(mut self, fmri: Fmri) -> Self {
        self.operations.push(Operation::Exact(fmri));
        self
    }

    pub fn allow_downgrade(mut self, allow: bool) -> Self {
        self.allow_downgrade = allow;
        self
    }

    pub fn be_name(mut self, name: &str) -> Self {
        self.be_name = Some(name.to_string());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn pin(mut self, name: &str, version: Version) -> Self {
        self.pins.insert(name.to_string(), version);
        self
    }

    pub fn is_update_all(&self) -> bool {
        self.operations
            .iter()
            .any(|op| matches!(op, Operation::Update(None)))
    }

    /// Human-readable summary used in explanations and logs
    pub fn describe(&self) -> String {
        if self.operations.is_empty() {
            return "re-evaluate image".to_string();
        }
        self.operations
            .iter()
            .map(|op| op.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
