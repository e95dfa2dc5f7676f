// src/plan/mod.rs

//! Image planning
//!
//! Turns the difference between the current image and a solution into an
//! ordered list of content actions. The plan is built in passes:
//!
//! 1. expand manifests of the current and target package sets
//! 2. detect conflicting deliveries in the target set
//! 3. diff old and new objects key by key, fingerprinting each step
//! 4. order the steps
//! 5. collect actuators
//!
//! An [`ImagePlan`] moves through `Evaluated → Prepared → Executed`, or to
//! `Aborted` from either of the first two states.
//!
//! The same manifest expansion backs [`Planner::contents`], and
//! [`Planner::verify`] / [`Planner::repair`] for checking an image against
//! what its packages deliver.

pub mod action;
mod diff;
mod listing;
mod order;
mod verify;

pub use action::{
    ActionKey, ActionKind, ActionTags, Actuator, ContentAction, ContentFetcher, ManifestAction,
    ManifestSource, MediatorTag, MemoryManifests, Namespace, Overlay,
};
pub use diff::{ActionOp, PathConflict, PlannedAction};
pub use listing::Setting;
pub use verify::{Finding, VerifyIssue, VerifyReport};

use crate::catalog::{Catalog, CatalogEntry};
use crate::config::PlanConfig;
use crate::error::{Error, Result};
use crate::fmri::Fmri;
use crate::image::{ImageConfig, ImageState};
use crate::progress::CancelToken;
use crate::solver::{ChangeKind, MediatorChoice, PackageChange, Solution, select_mediators};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use strum_macros::Display;
use tracing::{debug, info};

/// Lifecycle position of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanState {
    Evaluated,
    Prepared,
    Executed,
    Aborted,
}

/// An actuator due after a package's actions are applied
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ActuatorRun {
    pub package: String,
    pub actuator: Actuator,
}

/// What a plan will do, for display
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub install: Vec<Fmri>,
    pub update: Vec<(Fmri, Fmri)>,
    pub remove: Vec<Fmri>,
    pub variant_changes: Vec<(String, Option<String>, Option<String>)>,
    pub facet_changes: Vec<(String, Option<bool>, Option<bool>)>,
    pub mediator_changes: Vec<String>,
    pub actions: BTreeMap<ActionOp, usize>,
    pub services_to_restart: Vec<String>,
    pub reboot_needed: bool,
}

impl PlanSummary {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty()
            && self.update.is_empty()
            && self.remove.is_empty()
            && self.variant_changes.is_empty()
            && self.facet_changes.is_empty()
            && self.mediator_changes.is_empty()
            && self.actions.is_empty()
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes required.");
        }
        writeln!(f, "Packages to install: {}", self.install.len())?;
        for fmri in &self.install {
            writeln!(f, "  {}", fmri)?;
        }
        writeln!(f, "Packages to update:  {}", self.update.len())?;
        for (from, to) in &self.update {
            writeln!(f, "  {} -> {}", from, to.version)?;
        }
        writeln!(f, "Packages to remove:  {}", self.remove.len())?;
        for fmri in &self.remove {
            writeln!(f, "  {}", fmri)?;
        }
        for (name, old, new) in &self.variant_changes {
            writeln!(
                f,
                "Variant {}: {} -> {}",
                name,
                old.as_deref().unwrap_or("unset"),
                new.as_deref().unwrap_or("unset")
            )?;
        }
        for (name, old, new) in &self.facet_changes {
            let show = |v: &Option<bool>| v.map(|b| b.to_string()).unwrap_or("default".into());
            writeln!(f, "Facet {}: {} -> {}", name, show(old), show(new))?;
        }
        for line in &self.mediator_changes {
            writeln!(f, "Mediator {}", line)?;
        }
        let counts: Vec<String> = self
            .actions
            .iter()
            .map(|(op, n)| format!("{} {}", n, op))
            .collect();
        writeln!(f, "Actions: {}", counts.join(", "))?;
        if !self.services_to_restart.is_empty() {
            writeln!(f, "Services to restart: {}", self.services_to_restart.join(", "))?;
        }
        if self.reboot_needed {
            writeln!(f, "A reboot is needed after this operation.")?;
        }
        Ok(())
    }
}

/// An ordered, executable plan for one image
#[derive(Debug, Clone)]
pub struct ImagePlan {
    state: PlanState,
    changes: Vec<PackageChange>,
    actions: Vec<PlannedAction>,
    actuators: Vec<ActuatorRun>,
    summary: PlanSummary,
    target: ImageState,
}

#[derive(Serialize)]
struct PlanDocument<'a> {
    state: PlanState,
    summary: &'a PlanSummary,
    actions: &'a [PlannedAction],
    actuators: &'a [ActuatorRun],
}

impl ImagePlan {
    pub fn state(&self) -> PlanState {
        self.state
    }

    pub fn changes(&self) -> &[PackageChange] {
        &self.changes
    }

    /// Steps in execution order
    pub fn actions(&self) -> &[PlannedAction] {
        &self.actions
    }

    pub fn actuators(&self) -> &[ActuatorRun] {
        &self.actuators
    }

    pub fn summary(&self) -> &PlanSummary {
        &self.summary
    }

    /// Image state to record once every action has been applied
    pub fn target_state(&self) -> &ImageState {
        &self.target
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
    }

    fn expect_state(&self, expected: PlanState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidPlanState {
                expected: expected.to_string(),
                found: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Fetch the content of every file the plan installs or updates
    pub fn prepare(&mut self, fetcher: &dyn ContentFetcher) -> Result<()> {
        self.expect_state(PlanState::Evaluated)?;

        let mut fetched = 0;
        for step in &self.actions {
            if !step.creates() {
                continue;
            }
            let (Some(owner), Some(action)) = (step.to.as_ref(), step.new.as_ref()) else {
                continue;
            };
            if action.kind() != ActionKind::File {
                continue;
            }
            fetcher.fetch(owner, action).map_err(|e| match e {
                e @ Error::TransportFailure { .. } => e,
                other => Error::TransportFailure {
                    what: format!("{} from {}", action, owner),
                    reason: other.to_string(),
                },
            })?;
            fetched += 1;
        }

        debug!("Prepared plan: fetched content for {} file(s)", fetched);
        self.state = PlanState::Prepared;
        Ok(())
    }

    pub(crate) fn mark_executed(&mut self) -> Result<()> {
        self.expect_state(PlanState::Prepared)?;
        self.state = PlanState::Executed;
        Ok(())
    }

    /// Drop the plan before execution
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            PlanState::Evaluated | PlanState::Prepared => {
                info!("Plan aborted in state {}", self.state);
                self.state = PlanState::Aborted;
                Ok(())
            }
            found => Err(Error::InvalidPlanState {
                expected: "evaluated or prepared".to_string(),
                found: found.to_string(),
            }),
        }
    }

    /// The ordered plan as pretty JSON, for an external executor
    pub fn to_json(&self) -> Result<String> {
        let doc = PlanDocument {
            state: self.state,
            summary: &self.summary,
            actions: &self.actions,
            actuators: &self.actuators,
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }
}

/// Builds image plans from solutions
pub struct Planner<'a> {
    catalog: &'a Catalog,
    manifests: &'a dyn ManifestSource,
    options: PlanConfig,
    cancel: CancelToken,
}

impl<'a> Planner<'a> {
    pub fn new(catalog: &'a Catalog, manifests: &'a dyn ManifestSource) -> Self {
        Self {
            catalog,
            manifests,
            options: PlanConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_options(mut self, options: PlanConfig) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancel(&self, pass: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(pass.to_string()));
        }
        Ok(())
    }

    /// Plan the move from `current` to `solution` under `target_config`
    pub fn evaluate(
        &self,
        current: &ImageState,
        target_config: &ImageConfig,
        solution: &Solution,
    ) -> Result<ImagePlan> {
        let changes = solution.changes(current);
        let old_mediators = self.current_mediators(current);

        let mut summary = PlanSummary {
            variant_changes: current.config.variant_changes(target_config),
            facet_changes: current.config.facet_changes(target_config),
            mediator_changes: mediator_changes(&old_mediators, &solution.mediators),
            ..PlanSummary::default()
        };
        for change in &changes {
            match (change.kind, &change.from, &change.to) {
                (ChangeKind::Install, _, Some(to)) => summary.install.push(to.clone()),
                (ChangeKind::Remove, Some(from), _) => summary.remove.push(from.clone()),
                (_, Some(from), Some(to)) => summary.update.push((from.clone(), to.clone())),
                _ => {}
            }
        }

        let target = ImageState {
            installed: solution.target_installed(),
            config: target_config.clone(),
        };

        if changes.is_empty()
            && summary.variant_changes.is_empty()
            && summary.facet_changes.is_empty()
            && summary.mediator_changes.is_empty()
        {
            info!("Nothing to do: image already matches the solution");
            return Ok(ImagePlan {
                state: PlanState::Evaluated,
                changes,
                actions: Vec::new(),
                actuators: Vec::new(),
                summary,
                target,
            });
        }

        self.check_cancel("plan evaluation")?;
        let old = diff::collect(
            self.manifests,
            current.installed.values(),
            &current.config,
            &old_mediators,
        )?;
        let new = diff::collect(
            self.manifests,
            solution.selected(),
            target_config,
            &solution.mediators,
        )?;

        self.check_cancel("conflict detection")?;
        let (new_objects, conflicts) = diff::resolve(new);
        if let Some(first) = conflicts.first() {
            diff::log_conflicts(&conflicts);
            return Err(Error::PathConflict(Box::new(first.clone())));
        }
        let (old_objects, _) = diff::resolve(old);

        self.check_cancel("plan diff")?;
        let mut actions = diff::diff(&old_objects, &new_objects);
        diff::fingerprint_all(&mut actions, self.options.fingerprint, self.options.parallel);

        self.check_cancel("plan ordering")?;
        let actions = order::order(actions, &self.cancel)?;

        let actuators = collect_actuators(&actions);
        for step in &actions {
            *summary.actions.entry(step.op).or_insert(0) += 1;
        }
        summary.services_to_restart = actuators
            .iter()
            .filter_map(|run| match &run.actuator {
                Actuator::Restart(svc) => Some(svc.clone()),
                _ => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        summary.reboot_needed = actuators
            .iter()
            .any(|run| run.actuator == Actuator::RebootNeeded);

        info!(
            "Plan: {} install, {} update, {} remove, {} action(s)",
            summary.install.len(),
            summary.update.len(),
            summary.remove.len(),
            actions.len()
        );

        Ok(ImagePlan {
            state: PlanState::Evaluated,
            changes,
            actions,
            actuators,
            summary,
            target,
        })
    }

    /// Actions `fmri` delivers into an image in `state`
    ///
    /// Variant, facet and mediator tags are applied as the image is
    /// currently configured.
    pub fn contents(&self, fmri: &Fmri, state: &ImageState) -> Result<Vec<ContentAction>> {
        let mediators = self.current_mediators(state);
        let owned = diff::collect(self.manifests, std::iter::once(fmri), &state.config, &mediators)?;
        let mut actions: Vec<ContentAction> = owned.into_iter().map(|o| o.action).collect();
        actions.sort_by_key(ContentAction::key);
        Ok(actions)
    }

    fn current_mediators(&self, current: &ImageState) -> BTreeMap<String, MediatorChoice> {
        let entries: Vec<Arc<CatalogEntry>> = current
            .installed
            .values()
            .filter_map(|fmri| self.catalog.entry(fmri).cloned())
            .collect();
        select_mediators(&current.config, &entries)
    }
}

fn mediator_changes(
    old: &BTreeMap<String, MediatorChoice>,
    new: &BTreeMap<String, MediatorChoice>,
) -> Vec<String> {
    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| match (old.get(name), new.get(name)) {
            (Some(a), Some(b)) if a == b => None,
            (Some(a), Some(b)) => Some(format!(
                "{}: {} -> {}",
                name,
                a.provider.short(),
                b.provider.short()
            )),
            (None, Some(b)) => Some(format!("{}: -> {}", name, b.provider.short())),
            (Some(a), None) => Some(format!("{}: {} ->", name, a.provider.short())),
            (None, None) => None,
        })
        .collect()
}

/// Actuators of every changing action, by package name then type
fn collect_actuators(actions: &[PlannedAction]) -> Vec<ActuatorRun> {
    let mut runs = BTreeSet::new();
    for step in actions {
        if step.op == ActionOp::Transfer {
            continue;
        }
        let (Some(package), Some(action)) = (step.package(), step.action()) else {
            continue;
        };
        for actuator in action.actuators() {
            runs.insert(ActuatorRun {
                package: package.name.clone(),
                actuator: actuator.clone(),
            });
        }
    }
    runs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;

    struct NoFetch;

    impl ContentFetcher for NoFetch {
        fn fetch(&self, _owner: &Fmri, _action: &ContentAction) -> Result<()> {
            Err(Error::Io(std::io::Error::other("offline")))
        }
    }

    struct Fetched;

    impl ContentFetcher for Fetched {
        fn fetch(&self, _owner: &Fmri, _action: &ContentAction) -> Result<()> {
            Ok(())
        }
    }

    fn fmri(s: &str) -> Fmri {
        Fmri::parse(s).unwrap()
    }

    fn file(path: &str, hash: &str) -> ManifestAction {
        ManifestAction::new(ContentAction::File {
            path: path.to_string(),
            hash: hash.to_string(),
            mode: 0o644,
            owner: "root".to_string(),
            group: "root".to_string(),
            overlay: None,
            actuators: vec![Actuator::Restart("svc:/motd".to_string())],
        })
    }

    fn solution(selected: &[&str], installed: &[&str]) -> Solution {
        let mut packages = BTreeMap::new();
        for f in installed {
            let f = fmri(f);
            packages.insert(f.name.clone(), None);
        }
        for f in selected {
            let f = fmri(f);
            packages.insert(f.name.clone(), Some(f));
        }
        Solution {
            packages,
            mediators: BTreeMap::new(),
            stats: Default::default(),
        }
    }

    #[test]
    fn test_install_plan_lifecycle() {
        let catalog = Catalog::from_entries(vec![CatalogEntry::bare(fmri("pkg://t/a@1"))]);
        let mut manifests = MemoryManifests::new();
        manifests.insert(fmri("pkg://t/a@1"), vec![file("etc/motd", "1")]);

        let current = ImageState::default();
        let sol = solution(&["pkg://t/a@1"], &[]);
        let planner = Planner::new(&catalog, &manifests);
        let mut plan = planner
            .evaluate(&current, &current.config, &sol)
            .unwrap();

        assert_eq!(plan.state(), PlanState::Evaluated);
        assert_eq!(plan.actions().len(), 1);
        assert_eq!(plan.summary().install, vec![fmri("pkg://t/a@1")]);
        assert_eq!(plan.summary().services_to_restart, vec!["svc:/motd".to_string()]);
        assert_eq!(plan.actuators()[0].package, "a");
        assert!(plan.target_state().is_installed("a"));

        assert!(matches!(plan.mark_executed(), Err(Error::InvalidPlanState { .. })));
        assert!(plan.prepare(&NoFetch).unwrap_err().is_retryable());
        plan.prepare(&Fetched).unwrap();
        assert_eq!(plan.state(), PlanState::Prepared);
        assert!(plan.prepare(&Fetched).is_err());
        plan.mark_executed().unwrap();
        assert!(plan.abort().is_err());
    }

    #[test]
    fn test_noop_plan_is_empty() {
        let catalog = Catalog::from_entries(vec![CatalogEntry::bare(fmri("pkg://t/a@1"))]);
        let manifests = MemoryManifests::new();
        let mut current = ImageState::default();
        current.install(fmri("pkg://t/a@1"));

        let sol = solution(&["pkg://t/a@1"], &[]);
        let plan = Planner::new(&catalog, &manifests)
            .evaluate(&current, &current.config, &sol)
            .unwrap();
        assert!(plan.is_empty());
        assert!(plan.actions().is_empty());
    }

    #[test]
    fn test_facet_change_removes_content() {
        let catalog = Catalog::from_entries(vec![CatalogEntry::bare(fmri("pkg://t/a@1"))]);
        let mut manifests = MemoryManifests::new();
        manifests.insert(
            fmri("pkg://t/a@1"),
            vec![
                file("usr/bin/a", "1"),
                file("usr/share/doc/a", "2").with_facet("facet.doc"),
            ],
        );
        let mut current = ImageState::default();
        current.install(fmri("pkg://t/a@1"));
        let mut target = current.config.clone();
        target.set_facet("facet.doc", Some(false)).unwrap();

        let sol = solution(&["pkg://t/a@1"], &[]);
        let plan = Planner::new(&catalog, &manifests)
            .evaluate(&current, &target, &sol)
            .unwrap();
        assert_eq!(plan.summary().facet_changes.len(), 1);
        assert_eq!(plan.actions().len(), 1);
        assert_eq!(plan.actions()[0].op, ActionOp::Remove);
        assert_eq!(plan.actions()[0].key.id, "usr/share/doc/a");
    }

    #[test]
    fn test_cancelled_plan() {
        let catalog = Catalog::from_entries(vec![CatalogEntry::bare(fmri("pkg://t/a@1"))]);
        let manifests = MemoryManifests::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let current = ImageState::default();
        let sol = solution(&["pkg://t/a@1"], &[]);
        let result = Planner::new(&catalog, &manifests)
            .with_cancel(cancel)
            .evaluate(&current, &current.config, &sol);
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}
