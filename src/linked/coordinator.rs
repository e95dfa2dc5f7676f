// src/linked/coordinator.rs

//! Propagating parent operations to child images
//!
//! For each active child the coordinator pins the packages it shares with a
//! changing parent to the parent's new versions, solves and plans the child,
//! and folds the result into one [`LinkedPlan`]. A `recurse` child that
//! cannot follow aborts the whole operation; an `ignore` child is logged and
//! left alone.

use super::{ChildRelation, ChildState, ImageProvider, LinkPolicy};
use crate::catalog::{Catalog, CatalogView};
use crate::config::{PlanConfig, SolverConfig};
use crate::error::{Error, Result};
use crate::fmri::{Fmri, PackageSpec};
use crate::image::{Image, ImageState};
use crate::plan::{ContentFetcher, ImagePlan, ManifestSource, PlanState, Planner};
use crate::progress::{CancelToken, ProgressTracker};
use crate::solver::{ChangeKind, PackageChange, SolveRequest, Solver};
use crate::transaction::{ActionExecutor, StagedTransaction, Transaction, TransactionOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Supplies an executor for the image rooted at the given path
pub type ExecutorFactory<'a> = dyn FnMut(&Path) -> Box<dyn ActionExecutor> + 'a;

/// Plan for one child image
#[derive(Debug, Clone)]
pub struct ChildPlan {
    pub relation: ChildRelation,
    pub plan: ImagePlan,
}

/// A parent plan plus the child plans it implies
#[derive(Debug, Clone)]
pub struct LinkedPlan {
    pub parent: ImagePlan,
    /// Ordered by child path
    pub children: Vec<ChildPlan>,
    /// `ignore` children that could not follow, with the reason
    pub skipped: Vec<(ChildRelation, String)>,
}

impl LinkedPlan {
    fn plans_mut(&mut self) -> impl Iterator<Item = &mut ImagePlan> {
        std::iter::once(&mut self.parent).chain(self.children.iter_mut().map(|c| &mut c.plan))
    }

    /// Prepare every plan; any failure aborts all of them
    pub fn prepare(&mut self, fetcher: &dyn ContentFetcher) -> Result<()> {
        let mut failure = None;
        for plan in self.plans_mut() {
            if let Err(e) = plan.prepare(fetcher) {
                failure = Some(e);
                break;
            }
        }
        match failure {
            Some(e) => {
                self.abort();
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Abort every plan that has not been executed
    pub fn abort(&mut self) {
        for plan in self.plans_mut() {
            if matches!(plan.state(), PlanState::Evaluated | PlanState::Prepared) {
                let _ = plan.abort();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty() && self.children.iter().all(|c| c.plan.is_empty())
    }
}

/// Runs one operation across a parent image and its children
pub struct Coordinator<'a> {
    catalog: &'a Catalog,
    manifests: &'a dyn ManifestSource,
    solver: SolverConfig,
    planner: PlanConfig,
    cancel: CancelToken,
    progress: Option<Arc<dyn ProgressTracker>>,
}

impl<'a> Coordinator<'a> {
    pub fn new(catalog: &'a Catalog, manifests: &'a dyn ManifestSource) -> Self {
        Self {
            catalog,
            manifests,
            solver: SolverConfig::default(),
            planner: PlanConfig::default(),
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    pub fn with_solver_options(mut self, options: SolverConfig) -> Self {
        self.solver = options;
        self
    }

    pub fn with_plan_options(mut self, options: PlanConfig) -> Self {
        self.planner = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report the parent's action progress
    pub fn with_progress(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Extend a parent plan with plans for every affected child
    pub fn plan(
        &self,
        parent: ImagePlan,
        children: &[ChildRelation],
        provider: &dyn ImageProvider,
    ) -> Result<LinkedPlan> {
        let parent_target = parent.target_state().installed.clone();
        let parent_changes = parent.changes().to_vec();

        let mut ordered: Vec<&ChildRelation> = children.iter().filter(|c| c.is_active()).collect();
        ordered.sort_by(|a, b| a.path.cmp(&b.path));

        let mut linked = LinkedPlan {
            parent,
            children: Vec::new(),
            skipped: Vec::new(),
        };

        for child in ordered {
            if self.cancel.is_cancelled() {
                linked.abort();
                return Err(Error::Cancelled("linked image planning".to_string()));
            }

            match self.plan_child(child, &parent_changes, &parent_target, provider) {
                Ok(Some(plan)) => linked.children.push(ChildPlan {
                    relation: child.clone(),
                    plan,
                }),
                Ok(None) => debug!("Linked image {} is unaffected", child.name),
                Err(e @ Error::Cancelled(_)) => {
                    linked.abort();
                    return Err(e);
                }
                Err(e) if child.policy == LinkPolicy::Ignore => {
                    warn!("Ignoring linked image {}: {}", child.name, e);
                    linked.skipped.push((child.clone(), e.to_string()));
                }
                Err(e) => {
                    linked.abort();
                    return Err(Error::SyncFailed {
                        child: child.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Linked plan covers {} child image(s), {} skipped",
            linked.children.len(),
            linked.skipped.len()
        );
        Ok(linked)
    }

    fn plan_child(
        &self,
        child: &ChildRelation,
        parent_changes: &[PackageChange],
        parent_target: &BTreeMap<String, Fmri>,
        provider: &dyn ImageProvider,
    ) -> Result<Option<ImagePlan>> {
        let state = provider.load_state(child)?;
        let request = match child_request(&state, parent_changes) {
            Some(request) => request,
            None => return Ok(None),
        };
        debug!("Syncing linked image {}: {}", child.name, request.describe());

        let view = CatalogView::new(self.catalog, &state.config);
        let solution = Solver::new(&view, &state)
            .with_parent(parent_target)
            .with_options(self.solver.clone())
            .with_cancel(self.cancel.clone())
            .solve(&request)?;

        let plan = Planner::new(self.catalog, self.manifests)
            .with_options(self.planner.clone())
            .with_cancel(self.cancel.clone())
            .evaluate(&state, &state.config, &solution)?;
        Ok(Some(plan))
    }

    /// Execute a prepared linked plan as one unit
    ///
    /// Every image is staged, then every image applies its actions, parent
    /// first. Only when all of them succeed does the parent journal record
    /// the commit decision; the children then commit and the parent commits
    /// last. Before the decision no image's recorded state changes, and the
    /// journals of images that applied actions stay behind for recovery.
    ///
    /// Child states recorded in the parent move through `Syncing` to `Synced`
    /// or `SyncFailed`.
    pub fn execute(
        &self,
        parent: &mut Image,
        linked: &mut LinkedPlan,
        executors: &mut ExecutorFactory<'_>,
    ) -> Result<()> {
        for plan in std::iter::once(&linked.parent).chain(linked.children.iter().map(|c| &c.plan)) {
            if plan.state() != PlanState::Prepared {
                return Err(Error::InvalidPlanState {
                    expected: PlanState::Prepared.to_string(),
                    found: plan.state().to_string(),
                });
            }
        }

        for child in &mut linked.children {
            child.relation.state = child.relation.state.transition(ChildState::Syncing)?;
            parent.set_child_state(&child.relation.path, child.relation.state)?;
        }

        let mut images = Vec::with_capacity(linked.children.len());
        for (index, child) in linked.children.iter().enumerate() {
            match Image::open(&child.relation.path) {
                Ok(image) => images.push(image),
                Err(e) => {
                    let err = member_error(linked, index + 1, e);
                    linked.abort();
                    unsettle(parent, linked)?;
                    return Err(err);
                }
            }
        }

        let operation = Uuid::new_v4().to_string();
        let parent_root = parent.root().to_path_buf();
        let members = images.len() + 1;
        let mut options = TransactionOptions::new().with_cancel(self.cancel.clone());
        if let Some(progress) = &self.progress {
            options = options.with_progress(progress.clone());
        }

        let mut staged: Vec<StagedTransaction> = Vec::with_capacity(members);
        for member in 0..members {
            let result = if member == 0 {
                Transaction::new(parent, options.clone()).stage_linked(
                    &linked.parent,
                    &operation,
                    &parent_root,
                    members,
                )
            } else {
                Transaction::new(&mut images[member - 1], TransactionOptions::new()).stage_linked(
                    &linked.children[member - 1].plan,
                    &operation,
                    &parent_root,
                    members,
                )
            };
            match result {
                Ok(tx) => staged.push(tx),
                Err(e) => {
                    let err = member_error(linked, member, e);
                    abort_from(linked, staged, 0, "linked image could not be staged");
                    linked.abort();
                    unsettle(parent, linked)?;
                    return Err(err);
                }
            }
        }

        if self.cancel.is_cancelled() {
            abort_from(linked, staged, 0, "cancelled before the first action");
            unsettle(parent, linked)?;
            info!("Linked operation {} cancelled before any action was applied", operation);
            return Err(Error::Cancelled("linked plan execution".to_string()));
        }

        for member in 0..members {
            let root = member_root(linked, &parent_root, member);
            let mut executor = executors(&root);
            let result = staged[member].apply(member_plan(linked, member), executor.as_mut());
            if let Err(e) = result {
                let err = member_error(linked, member, e);
                warn!(
                    "Linked operation {} stopped at {}; {} image(s) applied, none committed",
                    operation,
                    root.display(),
                    member
                );
                abort_from(linked, staged, member + 1, "another linked image failed");
                unsettle(parent, linked)?;
                return Err(err);
            }
        }

        if let Some(tx) = staged.first_mut()
            && let Err(e) = tx.decide(members)
        {
            unsettle(parent, linked)?;
            return Err(e);
        }
        debug!("Linked operation {} decided to commit {} image(s)", operation, members);

        let mut staged = staged.into_iter();
        let parent_tx = staged.next();
        let mut failure = None;
        for ((tx, image), child) in staged.zip(images.iter_mut()).zip(linked.children.iter_mut()) {
            if let Err(e) = tx.commit(image, &mut child.plan) {
                failure = Some(Error::SyncFailed {
                    child: child.relation.name.clone(),
                    reason: e.to_string(),
                });
                break;
            }
            settle(parent, &mut child.relation, ChildState::Synced)?;
        }
        if let Some(err) = failure {
            // decided: recovery rolls the remaining members forward
            unsettle(parent, linked)?;
            return Err(err);
        }
        if let Some(tx) = parent_tx {
            tx.commit(parent, &mut linked.parent)?;
        }

        info!("Linked operation {} committed {} image(s)", operation, members);
        Ok(())
    }
}

fn settle(parent: &Image, relation: &mut ChildRelation, to: ChildState) -> Result<()> {
    relation.state = relation.state.transition(to)?;
    parent.set_child_state(&relation.path, relation.state)
}

/// Mark every child still syncing as failed
fn unsettle(parent: &Image, linked: &mut LinkedPlan) -> Result<()> {
    for child in &mut linked.children {
        if child.relation.state == ChildState::Syncing {
            settle(parent, &mut child.relation, ChildState::SyncFailed)?;
        }
    }
    Ok(())
}

/// Member 0 is the parent, member `n` the n-th child
fn member_plan(linked: &mut LinkedPlan, member: usize) -> &mut ImagePlan {
    match member.checked_sub(1) {
        None => &mut linked.parent,
        Some(index) => &mut linked.children[index].plan,
    }
}

fn member_root(linked: &LinkedPlan, parent_root: &Path, member: usize) -> PathBuf {
    match member.checked_sub(1) {
        None => parent_root.to_path_buf(),
        Some(index) => linked.children[index].relation.path.clone(),
    }
}

fn member_error(linked: &LinkedPlan, member: usize, error: Error) -> Error {
    match member.checked_sub(1) {
        None => error,
        Some(index) => Error::SyncFailed {
            child: linked.children[index].relation.name.clone(),
            reason: error.to_string(),
        },
    }
}

/// Abort the staged members from `first` on; earlier ones keep their journals
fn abort_from(linked: &mut LinkedPlan, staged: Vec<StagedTransaction>, first: usize, reason: &str) {
    for (member, tx) in staged.into_iter().enumerate().skip(first) {
        let tx_root = tx.root().to_path_buf();
        if let Err(e) = tx.abort(member_plan(linked, member), reason) {
            warn!("Could not abort staged transaction on {}: {}", tx_root.display(), e);
        }
    }
}

/// The request a child needs to follow the parent's changes to shared packages
fn child_request(state: &ImageState, parent_changes: &[PackageChange]) -> Option<SolveRequest> {
    let mut request = SolveRequest::new();
    let mut shared = false;

    for change in parent_changes {
        if !state.is_installed(&change.name) {
            continue;
        }
        shared = true;
        request = match &change.to {
            Some(to) => {
                if change.kind == ChangeKind::Downgrade {
                    request = request.allow_downgrade(true);
                }
                request
                    .update(PackageSpec::name(&change.name))
                    .pin(&change.name, to.version.clone())
            }
            None => request.remove(&change.name),
        };
    }

    shared.then_some(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmri::Fmri;

    fn change(name: &str, from: Option<&str>, to: Option<&str>, kind: ChangeKind) -> PackageChange {
        PackageChange {
            name: name.to_string(),
            from: from.map(|f| Fmri::parse(f).unwrap()),
            to: to.map(|f| Fmri::parse(f).unwrap()),
            kind,
        }
    }

    #[test]
    fn test_child_request_pins_shared_packages() {
        let mut state = ImageState::default();
        state.install(Fmri::parse("pkg://t/libc@1.0").unwrap());
        state.install(Fmri::parse("pkg://t/old@1.0").unwrap());

        let changes = vec![
            change("libc", Some("pkg://t/libc@1.0"), Some("pkg://t/libc@2.0"), ChangeKind::Update),
            change("old", Some("pkg://t/old@1.0"), None, ChangeKind::Remove),
            change("web", None, Some("pkg://t/web@1.0"), ChangeKind::Install),
        ];
        let request = child_request(&state, &changes).unwrap();
        assert_eq!(request.pins.get("libc").map(|v| v.to_string()).as_deref(), Some("2.0"));
        assert!(!request.pins.contains_key("web"));
        assert_eq!(request.describe(), "update libc, remove old");
    }

    #[test]
    fn test_unrelated_child_untouched() {
        let mut state = ImageState::default();
        state.install(Fmri::parse("pkg://t/shell@1.0").unwrap());
        let changes = vec![change(
            "libc",
            Some("pkg://t/libc@1.0"),
            Some("pkg://t/libc@2.0"),
            ChangeKind::Update,
        )];
        assert!(child_request(&state, &changes).is_none());
    }
}
