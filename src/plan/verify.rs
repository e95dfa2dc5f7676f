// src/plan/verify.rs

//! Checking installed content against package manifests
//!
//! Only path actions are inspected on disk. Files are hashed with the
//! algorithm their published digest names; a payload reference that is not a
//! digest leaves type and mode as the only checks. Repair does not touch the
//! disk either: it plans the damaged actions again for the executor.

use super::action::ContentAction;
use super::diff::{self, ActionOp, PlannedAction};
use super::{ImagePlan, PlanState, PlanSummary, Planner, collect_actuators, order};
use crate::error::{Error, Result};
use crate::fmri::Fmri;
use crate::hash::{self, Fingerprint};
use crate::image::ImageState;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, Metadata};
use std::io;
use std::path::Path;
use tracing::{debug, info};

/// How an installed object differs from its manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    Missing,
    /// Something of another type occupies the path
    WrongType { found: &'static str },
    ContentMismatch {
        expected: Fingerprint,
        found: Fingerprint,
    },
    ModeMismatch { expected: u32, found: u32 },
    LinkTarget { expected: String, found: String },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::Missing => write!(f, "missing"),
            Finding::WrongType { found } => write!(f, "found a {} instead", found),
            Finding::ContentMismatch { expected, found } => {
                write!(f, "content is {}, expected {}", found, expected)
            }
            Finding::ModeMismatch { expected, found } => {
                write!(f, "mode is {:o}, expected {:o}", found, expected)
            }
            Finding::LinkTarget { expected, found } => {
                write!(f, "points at {}, expected {}", found, expected)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyIssue {
    pub package: Fmri,
    pub action: ContentAction,
    pub finding: Finding,
}

impl fmt::Display for VerifyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.package.short(), self.action, self.finding)
    }
}

/// Outcome of verifying an image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Path actions inspected
    pub checked: usize,
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Names of packages with at least one issue
    pub fn damaged(&self) -> BTreeSet<&str> {
        self.issues.iter().map(|i| i.package.name.as_str()).collect()
    }
}

impl Planner<'_> {
    /// Check the content of `packages` under `root`, or of every installed
    /// package when `packages` is empty
    pub fn verify(&self, root: &Path, state: &ImageState, packages: &[String]) -> Result<VerifyReport> {
        if let Some(name) = packages.iter().find(|name| !state.is_installed(name)) {
            return Err(Error::NotInstalled(name.clone()));
        }
        let selected = state
            .installed
            .values()
            .filter(|fmri| packages.is_empty() || packages.contains(&fmri.name));
        let mediators = self.current_mediators(state);
        let owned = diff::collect(self.manifests, selected, &state.config, &mediators)?;

        let mut report = VerifyReport::default();
        for item in owned {
            if !item.action.kind().is_path() {
                continue;
            }
            self.check_cancel("image verification")?;
            report.checked += 1;
            if let Some(finding) = inspect(root, &item.action)? {
                debug!("{} from {}: {}", item.action, item.owner, finding);
                report.issues.push(VerifyIssue {
                    package: item.owner,
                    action: item.action,
                    finding,
                });
            }
        }

        info!(
            "Verified {} path(s): {} issue(s)",
            report.checked,
            report.issues.len()
        );
        Ok(report)
    }

    /// Plan the damaged objects of `report` again
    ///
    /// The package set and configuration stay as they are.
    pub fn repair(&self, state: &ImageState, report: &VerifyReport) -> Result<ImagePlan> {
        let mut seen = BTreeSet::new();
        let mut actions = Vec::new();
        for issue in &report.issues {
            let key = issue.action.key();
            if !seen.insert(key.clone()) {
                continue;
            }
            let op = match issue.finding {
                Finding::Missing => ActionOp::Install,
                _ => ActionOp::Update,
            };
            actions.push(PlannedAction {
                op,
                key,
                old: None,
                new: Some(issue.action.clone()),
                from: None,
                to: Some(issue.package.clone()),
                fingerprint: None,
                after: Vec::new(),
            });
        }

        diff::fingerprint_all(&mut actions, self.options.fingerprint, self.options.parallel);
        let actions = order::order(actions, &self.cancel)?;

        let mut summary = PlanSummary::default();
        for step in &actions {
            *summary.actions.entry(step.op).or_insert(0) += 1;
        }
        info!("Repair plan: {} action(s)", actions.len());

        Ok(ImagePlan {
            state: PlanState::Evaluated,
            changes: Vec::new(),
            actuators: collect_actuators(&actions),
            actions,
            summary,
            target: state.clone(),
        })
    }
}

fn inspect(root: &Path, action: &ContentAction) -> Result<Option<Finding>> {
    let Some(path) = action.path() else {
        return Ok(None);
    };
    let on_disk = root.join(&path);
    let meta = match fs::symlink_metadata(&on_disk) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Some(Finding::Missing)),
        Err(e) => return Err(e.into()),
    };
    let wrong_type = Finding::WrongType {
        found: type_name(&meta),
    };

    let finding = match action {
        ContentAction::Dir { mode, .. } => {
            if meta.is_dir() {
                mode_mismatch(*mode, &meta)
            } else {
                Some(wrong_type)
            }
        }
        ContentAction::File { hash, mode, .. } => {
            if !meta.is_file() {
                Some(wrong_type)
            } else if let Some(expected) = hash::published_digest(hash) {
                let found = hash::hash_file(expected.algorithm(), &on_disk)?;
                if found != expected {
                    Some(Finding::ContentMismatch { expected, found })
                } else {
                    mode_mismatch(*mode, &meta)
                }
            } else {
                mode_mismatch(*mode, &meta)
            }
        }
        ContentAction::Link { target, .. } => {
            if meta.file_type().is_symlink() {
                let found = fs::read_link(&on_disk)?.to_string_lossy().into_owned();
                (found != *target).then(|| Finding::LinkTarget {
                    expected: target.clone(),
                    found,
                })
            } else {
                Some(wrong_type)
            }
        }
        ContentAction::Hardlink { .. } => (!meta.is_file()).then_some(wrong_type),
        _ => None,
    };
    Ok(finding)
}

fn type_name(meta: &Metadata) -> &'static str {
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        "link"
    } else if file_type.is_dir() {
        "directory"
    } else if file_type.is_file() {
        "file"
    } else {
        "special file"
    }
}

#[cfg(unix)]
fn mode_mismatch(expected: u32, meta: &Metadata) -> Option<Finding> {
    use std::os::unix::fs::PermissionsExt;
    let found = meta.permissions().mode() & 0o7777;
    (found != expected).then_some(Finding::ModeMismatch { expected, found })
}

#[cfg(not(unix))]
fn mode_mismatch(_expected: u32, _meta: &Metadata) -> Option<Finding> {
    None
}
