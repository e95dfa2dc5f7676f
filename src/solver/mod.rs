// src/solver/mod.rs

//! Dependency solver
//!
//! Given a catalog view, the current image state and a request, select at
//! most one version of each package so that every dependency holds.
//!
//! Among valid selections the solver prefers, in order:
//!
//! 1. what was explicitly requested (install, update, exact, remove)
//! 2. the newest achievable version of each requested package
//! 3. the fewest changes to packages that were not requested
//! 4. newer versions over older ones for everything else
//! 5. the image's publisher search order, then FMRI string order
//!
//! The search is a budgeted branch-and-bound over an explicit stack, so the
//! same inputs always produce the same solution. When nothing is valid the
//! error carries an [`Explanation`].

mod explain;
mod problem;
pub mod request;
mod search;

pub use explain::Explanation;
pub use request::{Operation, SolveRequest};

use crate::catalog::{CatalogEntry, CatalogView, Dependency, Predicate, Target};
use crate::config::SolverConfig;
use crate::error::{Error, Result};
use crate::fmri::{Fmri, Version};
use crate::image::{ImageConfig, ImageState};
use crate::progress::CancelToken;
use problem::{ABSENT, ProblemBuilder};
use search::Search;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How one package moves between the current image and a solution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Install,
    Update,
    Downgrade,
    Remove,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Install => "install",
            ChangeKind::Update => "update",
            ChangeKind::Downgrade => "downgrade",
            ChangeKind::Remove => "remove",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageChange {
    pub name: String,
    pub from: Option<Fmri>,
    pub to: Option<Fmri>,
    pub kind: ChangeKind,
}

impl fmt::Display for PackageChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.from, &self.to) {
            (Some(from), Some(to)) => write!(f, "{} {} -> {}", self.kind, from, to),
            (None, Some(to)) => write!(f, "{} {}", self.kind, to),
            (Some(from), None) => write!(f, "{} {}", self.kind, from),
            (None, None) => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// The provider chosen for one mediated capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorChoice {
    pub version: Option<Version>,
    pub implementation: Option<String>,
    pub provider: Fmri,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveStats {
    pub variables: usize,
    pub constraints: usize,
    pub steps: u64,
    pub solutions: u64,
    /// The step budget ran out; the solution is the best one found so far
    pub exhausted: bool,
}

/// A complete target selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    /// Every package that is installed now or selected; `None` means absent
    pub packages: BTreeMap<String, Option<Fmri>>,
    pub mediators: BTreeMap<String, MediatorChoice>,
    pub stats: SolveStats,
}

impl Solution {
    /// Selected FMRIs in name order
    pub fn selected(&self) -> impl Iterator<Item = &Fmri> {
        self.packages.values().flatten()
    }

    pub fn get(&self, name: &str) -> Option<&Fmri> {
        self.packages.get(name).and_then(Option::as_ref)
    }

    /// The installed set the image would have after applying this solution
    pub fn target_installed(&self) -> BTreeMap<String, Fmri> {
        self.selected()
            .map(|f| (f.name.clone(), f.clone()))
            .collect()
    }

    /// Differences against `state`, in name order
    pub fn changes(&self, state: &ImageState) -> Vec<PackageChange> {
        let mut names: Vec<&String> = self.packages.keys().collect();
        names.extend(
            state
                .installed
                .keys()
                .filter(|n| !self.packages.contains_key(*n)),
        );
        names.sort();

        names
            .into_iter()
            .filter_map(|name| {
                let from = state.installed(name).cloned();
                let to = self.get(name).cloned();
                let kind = match (&from, &to) {
                    (None, None) => return None,
                    (None, Some(_)) => ChangeKind::Install,
                    (Some(_), None) => ChangeKind::Remove,
                    (Some(a), Some(b)) if a == b => return None,
                    (Some(a), Some(b)) if b.version < a.version => ChangeKind::Downgrade,
                    (Some(_), Some(_)) => ChangeKind::Update,
                };
                Some(PackageChange {
                    name: name.clone(),
                    from,
                    to,
                    kind,
                })
            })
            .collect()
    }

    pub fn is_noop(&self, state: &ImageState) -> bool {
        self.changes(state).is_empty()
    }

    /// Check every dependency of every selected package against this selection
    ///
    /// `state` is the image the solution was computed for; group dependencies
    /// accept any installed alternative that stays within range.
    pub fn verify(&self, view: &CatalogView, state: &ImageState) -> Result<()> {
        let config = view.config();
        let mut violations = Vec::new();

        let holds = |t: &Target| self.get(&t.name).is_some_and(|f| t.range.satisfies(&f.version));
        let absent_or_holds = |t: &Target| self.get(&t.name).is_none_or(|f| t.range.satisfies(&f.version));

        for fmri in self.selected() {
            let Some(deps) = view.dependencies(fmri) else {
                continue;
            };
            for decl in deps {
                let gated_off = decl.facet.as_ref().is_some_and(|f| !config.facet_enabled(f));
                let ok = match &decl.dependency {
                    Dependency::Require(t) if gated_off => absent_or_holds(t),
                    Dependency::Require(t) => holds(t),
                    Dependency::Optional(t) | Dependency::Incorporate(t) => absent_or_holds(t),
                    Dependency::Group(alts) if gated_off => alts.iter().all(|t| absent_or_holds(t)),
                    Dependency::Group(alts) => {
                        let present: BTreeSet<&str> = alts
                            .iter()
                            .filter(|t| self.get(&t.name).is_some())
                            .map(|t| t.name.as_str())
                            .collect();
                        let within: BTreeSet<&str> = alts
                            .iter()
                            .filter(|t| holds(t))
                            .map(|t| t.name.as_str())
                            .collect();
                        let kept = within.iter().any(|name| state.is_installed(name));
                        !within.is_empty() && (kept || present.len() == 1)
                    }
                    Dependency::Conditional { target, predicate } => {
                        let active = match predicate {
                            Predicate::Variant { name, value } => {
                                config.variant(name) == Some(value.as_str())
                            }
                            Predicate::Facet { name, enabled } => {
                                config.facet_enabled(name) == *enabled
                            }
                            Predicate::Package(p) => holds(p),
                        };
                        !active || if gated_off { absent_or_holds(target) } else { holds(target) }
                    }
                    Dependency::Origin { .. } | Dependency::Parent(_) => true,
                };
                if !ok {
                    violations.push(format!("{} {}", fmri, decl.dependency));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "solution violates: {}",
                violations.join("; ")
            )))
        }
    }
}

/// Dependency solver for one image
pub struct Solver<'a> {
    view: &'a CatalogView<'a>,
    state: &'a ImageState,
    parent: Option<&'a BTreeMap<String, Fmri>>,
    options: SolverConfig,
    cancel: CancelToken,
}

impl<'a> Solver<'a> {
    pub fn new(view: &'a CatalogView<'a>, state: &'a ImageState) -> Self {
        Self {
            view,
            state,
            parent: None,
            options: SolverConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Installed set of the parent image, for parent and origin dependencies
    pub fn with_parent(mut self, parent: &'a BTreeMap<String, Fmri>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_options(mut self, options: SolverConfig) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn solve(&self, request: &SolveRequest) -> Result<Solution> {
        info!("Solving: {}", request.describe());

        let problem = ProblemBuilder::new(self.view, self.state, self.parent, request).build()?;
        let outcome = Search::new(&problem, &self.options, &self.cancel).run()?;

        let stats = SolveStats {
            variables: problem.vars.len(),
            constraints: problem.constraints.len(),
            steps: outcome.steps,
            solutions: outcome.solutions,
            exhausted: outcome.exhausted,
        };

        let Some((assignment, cost)) = outcome.best else {
            let note = outcome.exhausted.then(|| {
                format!(
                    "search budget of {} steps exhausted before any solution was found",
                    self.options.max_steps
                )
            });
            let explanation = explain::explain(&problem, outcome.conflict.as_ref(), note);
            info!("No solution: {}", explanation);
            return Err(Error::Unsatisfiable(Box::new(explanation)));
        };

        if outcome.exhausted {
            warn!(
                "Search budget of {} steps exhausted; using best solution found",
                self.options.max_steps
            );
        }
        debug!("Solved in {} steps, cost {:?}", outcome.steps, cost);

        let mut packages = BTreeMap::new();
        let mut entries: Vec<Arc<CatalogEntry>> = Vec::new();
        for (var, &val) in problem.vars.iter().zip(&assignment) {
            match var.values[val].as_ref() {
                Some(entry) => {
                    packages.insert(var.name.clone(), Some(entry.fmri.clone()));
                    entries.push(entry.clone());
                }
                None if val == ABSENT && self.state.is_installed(&var.name) => {
                    packages.insert(var.name.clone(), None);
                }
                None => {}
            }
        }

        let mediators = select_mediators(self.view.config(), &entries);

        Ok(Solution {
            packages,
            mediators,
            stats,
        })
    }
}

/// Pick one provider per mediator among the selected packages
///
/// An image setting wins when some provider matches it. Otherwise the highest
/// mediator version wins, then the implementation name, then the FMRI.
pub(crate) fn select_mediators(
    config: &ImageConfig,
    entries: &[Arc<CatalogEntry>],
) -> BTreeMap<String, MediatorChoice> {
    let mut claims: BTreeMap<&str, Vec<MediatorChoice>> = BTreeMap::new();
    for entry in entries {
        for claim in &entry.mediations {
            claims
                .entry(claim.mediator.as_str())
                .or_default()
                .push(MediatorChoice {
                    version: claim.version.clone(),
                    implementation: claim.implementation.clone(),
                    provider: entry.fmri.clone(),
                });
        }
    }

    let mut chosen = BTreeMap::new();
    for (mediator, mut offers) in claims {
        offers.sort_by(|a, b| {
            b.version
                .cmp(&a.version)
                .then_with(|| a.implementation.cmp(&b.implementation))
                .then_with(|| a.provider.cmp(&b.provider))
        });

        let configured = config.mediators.get(mediator).and_then(|setting| {
            let found = offers.iter().find(|o| {
                setting
                    .version
                    .as_ref()
                    .is_none_or(|v| o.version.as_ref().is_some_and(|ov| ov.matches_prefix(v)))
                    && setting
                        .implementation
                        .as_ref()
                        .is_none_or(|i| o.implementation.as_ref() == Some(i))
            });
            if found.is_none() {
                warn!(
                    "No provider of mediator {} matches the image setting; using the default",
                    mediator
                );
            }
            found.cloned()
        });

        if let Some(choice) = configured.or_else(|| offers.first().cloned()) {
            chosen.insert(mediator.to_string(), choice);
        }
    }
    chosen
}
