// src/solver/problem.rs

//! Problem construction
//!
//! Every package name reachable from the installed set and the request gets
//! one variable. Its values are "absent" (index 0) followed by the applicable
//! catalog entries in preference order. Request, freeze, avoid and downgrade
//! rules remove values up front; dependency actions become constraints
//! between variables.

use super::request::{Operation, SolveRequest};
use crate::catalog::{CatalogEntry, CatalogView, Dependency, PARENT_SELF, Predicate, Target};
use crate::catalog::preference;
use crate::error::{Error, Result};
use crate::fmri::{Fmri, PackageSpec, Version};
use crate::image::ImageState;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub(crate) type VarId = usize;
pub(crate) type ValId = usize;

/// Value index meaning "not installed"
pub(crate) const ABSENT: ValId = 0;

/// Why a value left a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cause {
    /// Fixed rule applied before the search (index into `Problem::statics`)
    Static(usize),
    /// Propagation of a dependency constraint
    Constraint(usize),
    /// A tentative search decision on the given variable
    Decision(VarId),
}

#[derive(Debug, Clone)]
pub(crate) enum StaticReason {
    Requested { op: String },
    NotRequested { op: String },
    Removal { op: String },
    Obsolete { fmri: Fmri },
    Frozen { version: Version, reason: Option<String> },
    Pinned { version: Version },
    Avoided,
    NoDowngrade { installed: Fmri },
    KeepInstalled { installed: Fmri },
    Origin { dependency: String, found: Option<Fmri> },
    Parent { dependency: String },
}

impl fmt::Display for StaticReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaticReason::Requested { op } => write!(f, "requested by '{}'", op),
            StaticReason::NotRequested { op } => write!(f, "does not match '{}'", op),
            StaticReason::Removal { op } => write!(f, "removal requested by '{}'", op),
            StaticReason::Obsolete { fmri } => write!(f, "{} is obsolete", fmri),
            StaticReason::Frozen { version, reason } => {
                write!(f, "frozen at {}", version)?;
                if let Some(r) = reason {
                    write!(f, " ({})", r)?;
                }
                Ok(())
            }
            StaticReason::Pinned { version } => {
                write!(f, "pinned to {} by the parent image", version)
            }
            StaticReason::Avoided => write!(f, "on the avoid list"),
            StaticReason::NoDowngrade { installed } => {
                write!(f, "older than installed {} (downgrade not allowed)", installed)
            }
            StaticReason::KeepInstalled { installed } => write!(
                f,
                "{} is installed and not requested for removal",
                installed
            ),
            StaticReason::Origin { dependency, found } => match found {
                Some(fmri) => write!(f, "{}, but the image has {}", dependency, fmri),
                None => write!(f, "{}", dependency),
            },
            StaticReason::Parent { dependency } => {
                write!(f, "{}, which the parent image does not satisfy", dependency)
            }
        }
    }
}

/// One package name and its candidate values
#[derive(Debug)]
pub(crate) struct Variable {
    pub name: String,
    /// `values[0]` is absent; the rest are catalog entries
    pub values: Vec<Option<Arc<CatalogEntry>>>,
    /// Installed value, or `ABSENT`
    pub current: ValId,
    /// Values in the order the search tries them
    pub order: Vec<ValId>,
    /// Position of each value in `order`
    pub rank: Vec<u64>,
    /// Explicit install/update/exact target
    pub target: bool,
}

impl Variable {
    pub fn fmri(&self, val: ValId) -> Option<&Fmri> {
        self.values
            .get(val)
            .and_then(|v| v.as_ref())
            .map(|e| &e.fmri)
    }

    pub fn label(&self, val: ValId) -> String {
        match self.fmri(val) {
            Some(fmri) => fmri.to_string(),
            None => format!("{} (absent)", self.name),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

#[derive(Debug)]
pub(crate) enum ConstraintKind {
    /// owner=value → target ∈ allowed
    Implies { target: VarId, allowed: Vec<bool> },
    /// owner=value ∧ cond ∈ cond_set → target ∈ allowed
    Conditional {
        cond: VarId,
        cond_set: Vec<bool>,
        target: VarId,
        allowed: Vec<bool>,
    },
    /// owner=value → some alternative present within its range; a new one
    /// is chosen only when no installed alternative stays, and then alone
    Group { alts: Vec<(VarId, Vec<bool>)> },
}

#[derive(Debug)]
pub(crate) struct Constraint {
    pub owner: VarId,
    pub value: ValId,
    pub kind: ConstraintKind,
    /// "pkg://pub/a@1.0 requires b >=2.0"
    pub text: String,
}

impl Constraint {
    pub fn vars(&self) -> Vec<VarId> {
        let mut vars = vec![self.owner];
        match &self.kind {
            ConstraintKind::Implies { target, .. } => vars.push(*target),
            ConstraintKind::Conditional { cond, target, .. } => {
                vars.push(*cond);
                vars.push(*target);
            }
            ConstraintKind::Group { alts } => vars.extend(alts.iter().map(|(v, _)| *v)),
        }
        vars.sort_unstable();
        vars.dedup();
        vars
    }
}

#[derive(Debug)]
pub(crate) struct Problem {
    pub vars: Vec<Variable>,
    pub index: BTreeMap<String, VarId>,
    pub constraints: Vec<Constraint>,
    /// Constraints mentioning each variable
    pub watches: Vec<Vec<usize>>,
    pub statics: Vec<StaticReason>,
    /// Removal table after static rules: `None` means the value is alive
    pub initial: Vec<Vec<Option<Cause>>>,
    pub request_text: String,
}

/// What the request says about one name
#[derive(Debug, Default)]
struct Intent {
    install: Vec<PackageSpec>,
    update: Vec<PackageSpec>,
    update_all: bool,
    remove: bool,
    exact: Option<Fmri>,
}

pub(crate) struct ProblemBuilder<'a> {
    view: &'a CatalogView<'a>,
    state: &'a ImageState,
    parent: Option<&'a BTreeMap<String, Fmri>>,
    request: &'a SolveRequest,
    intents: BTreeMap<String, Intent>,
    vars: Vec<Variable>,
    index: BTreeMap<String, VarId>,
    statics: Vec<StaticReason>,
    initial: Vec<Vec<Option<Cause>>>,
}

impl<'a> ProblemBuilder<'a> {
    pub fn new(
        view: &'a CatalogView<'a>,
        state: &'a ImageState,
        parent: Option<&'a BTreeMap<String, Fmri>>,
        request: &'a SolveRequest,
    ) -> Self {
        Self {
            view,
            state,
            parent,
            request,
            intents: BTreeMap::new(),
            vars: Vec::new(),
            index: BTreeMap::new(),
            statics: Vec::new(),
            initial: Vec::new(),
        }
    }

    pub fn build(mut self) -> Result<Problem> {
        self.collect_intents()?;

        let mut seeds: BTreeSet<String> = self.state.installed.keys().cloned().collect();
        seeds.extend(self.intents.keys().cloned());

        let mut queue: VecDeque<VarId> = VecDeque::new();
        for name in &seeds {
            let id = self.ensure_var(name);
            queue.push_back(id);
        }

        // Expand the dependency closure of every surviving value
        let mut expanded: BTreeSet<VarId> = BTreeSet::new();
        while let Some(id) = queue.pop_front() {
            if !expanded.insert(id) {
                continue;
            }
            let mut targets: Vec<String> = Vec::new();
            for (val, entry) in self.vars[id].values.iter().enumerate() {
                if self.initial[id][val].is_some() {
                    continue;
                }
                if let Some(entry) = entry {
                    for decl in &entry.dependencies {
                        targets.extend(
                            decl.dependency
                                .target_names()
                                .into_iter()
                                .map(str::to_string),
                        );
                    }
                }
            }
            for name in targets {
                let target = self.ensure_var(&name);
                if !expanded.contains(&target) {
                    queue.push_back(target);
                }
            }
        }

        let constraints = self.build_constraints();
        let mut watches = vec![Vec::new(); self.vars.len()];
        for (cid, c) in constraints.iter().enumerate() {
            for v in c.vars() {
                watches[v].push(cid);
            }
        }

        debug!(
            "Solver problem: {} variables, {} constraints, {} static rules",
            self.vars.len(),
            constraints.len(),
            self.statics.len()
        );

        Ok(Problem {
            vars: self.vars,
            index: self.index,
            constraints,
            watches,
            statics: self.statics,
            initial: self.initial,
            request_text: self.request.describe(),
        })
    }

    fn collect_intents(&mut self) -> Result<()> {
        let catalog = self.view.catalog();
        for op in &self.request.operations {
            match op {
                Operation::Install(spec) => {
                    if !catalog.contains_name(&spec.name) && !self.state.is_installed(&spec.name) {
                        return Err(Error::UnknownPackage(spec.to_string()));
                    }
                    self.intent(&spec.name).install.push(spec.clone());
                }
                Operation::Update(Some(spec)) => {
                    if !self.state.is_installed(&spec.name) {
                        return Err(Error::NotInstalled(spec.name.clone()));
                    }
                    self.intent(&spec.name).update.push(spec.clone());
                }
                Operation::Update(None) => {
                    let names: Vec<String> = self.state.installed.keys().cloned().collect();
                    for name in names {
                        self.intent(&name).update_all = true;
                    }
                }
                Operation::Remove(name) => {
                    if !self.state.is_installed(name) {
                        return Err(Error::NotInstalled(name.clone()));
                    }
                    self.intent(name).remove = true;
                }
                Operation::Exact(fmri) => {
                    let found = self.view.applicable(&fmri.name).iter().any(|e| {
                        e.fmri.version == fmri.version
                            && fmri
                                .publisher
                                .as_ref()
                                .is_none_or(|p| e.fmri.publisher.as_ref() == Some(p))
                    });
                    let installed = self.state.installed(&fmri.name).is_some_and(|i| {
                        i.version == fmri.version
                            && fmri.publisher.as_ref().is_none_or(|p| i.publisher.as_ref() == Some(p))
                    });
                    if !found && !installed {
                        return Err(Error::UnknownPackage(fmri.to_string()));
                    }
                    self.intent(&fmri.name).exact = Some(fmri.clone());
                }
            }
        }
        Ok(())
    }

    fn intent(&mut self, name: &str) -> &mut Intent {
        self.intents.entry(name.to_string()).or_default()
    }

    fn add_static(&mut self, reason: StaticReason) -> Cause {
        self.statics.push(reason);
        Cause::Static(self.statics.len() - 1)
    }

    /// Remove every alive value of `var` selected by `pred`, recording `reason`
    fn prune<F>(&mut self, var: VarId, reason: StaticReason, pred: F)
    where
        F: Fn(ValId, Option<&Fmri>) -> bool,
    {
        let doomed: Vec<ValId> = (0..self.vars[var].len())
            .filter(|&val| self.initial[var][val].is_none())
            .filter(|&val| pred(val, self.vars[var].fmri(val)))
            .collect();
        if doomed.is_empty() {
            return;
        }
        let cause = self.add_static(reason);
        for val in doomed {
            self.initial[var][val] = Some(cause);
        }
    }

    fn ensure_var(&mut self, name: &str) -> VarId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }

        let config = self.view.config();
        let installed = self.state.installed(name).cloned();
        let intent = self.intents.remove(name).unwrap_or_default();

        let mut entries: Vec<Arc<CatalogEntry>> = self.view.candidates(name).cloned().collect();

        // an exact request may name an obsolete entry, which means "remove"
        let exact_obsolete = intent.exact.as_ref().and_then(|fmri| {
            self.view
                .applicable(name)
                .iter()
                .find(|e| e.obsolete && exact_matches(fmri, &e.fmri))
                .map(|e| e.fmri.clone())
        });

        if let Some(ref fmri) = installed
            && !entries.iter().any(|e| &e.fmri == fmri)
        {
            let entry = self
                .view
                .catalog()
                .entry(fmri)
                .cloned()
                .unwrap_or_else(|| Arc::new(CatalogEntry::bare(fmri.clone())));
            entries.push(entry);
            entries.sort_by(|a, b| preference(config, &a.fmri, &b.fmri));
        }

        let mut values: Vec<Option<Arc<CatalogEntry>>> = vec![None];
        values.extend(entries.into_iter().map(Some));

        let current = installed
            .as_ref()
            .and_then(|fmri| {
                values
                    .iter()
                    .position(|v| v.as_ref().is_some_and(|e| &e.fmri == fmri))
            })
            .unwrap_or(ABSENT);

        let install_satisfied = installed
            .as_ref()
            .is_some_and(|i| !intent.install.is_empty() && intent.install.iter().all(|s| s.matches(i)));
        let newest_first = !intent.update.is_empty()
            || intent.update_all
            || intent.exact.is_some()
            || (!intent.install.is_empty() && !install_satisfied);
        let target = newest_first;

        let entries_in_order = 1..values.len();
        let order: Vec<ValId> = if newest_first {
            entries_in_order.chain(std::iter::once(ABSENT)).collect()
        } else if let Some(installed) = installed.as_ref().filter(|_| current != ABSENT) {
            // keep what is there, then prefer moving forward over moving back
            let (newer, older): (Vec<ValId>, Vec<ValId>) = (1..values.len())
                .filter(|&v| v != current)
                .partition(|&v| {
                    values[v]
                        .as_ref()
                        .is_some_and(|e| e.fmri.version > installed.version)
                });
            std::iter::once(current)
                .chain(newer)
                .chain(older)
                .chain(std::iter::once(ABSENT))
                .collect()
        } else {
            std::iter::once(ABSENT).chain(entries_in_order).collect()
        };

        let mut rank = vec![0u64; values.len()];
        for (pos, &val) in order.iter().enumerate() {
            rank[val] = pos as u64;
        }

        let id = self.vars.len();
        self.vars.push(Variable {
            name: name.to_string(),
            values,
            current,
            order,
            rank,
            target,
        });
        self.initial.push(vec![None; self.vars[id].len()]);
        self.index.insert(name.to_string(), id);

        self.apply_statics(id, &intent, installed.as_ref(), exact_obsolete);
        id
    }

    fn apply_statics(
        &mut self,
        id: VarId,
        intent: &Intent,
        installed: Option<&Fmri>,
        exact_obsolete: Option<Fmri>,
    ) {
        let config = self.view.config();
        let name = self.vars[id].name.clone();

        if intent.remove {
            let op = Operation::Remove(name.clone()).to_string();
            self.prune(id, StaticReason::Removal { op }, |val, _| val != ABSENT);
        }

        for spec in &intent.install {
            let op = Operation::Install(spec.clone()).to_string();
            self.prune(id, StaticReason::NotRequested { op: op.clone() }, |val, fmri| {
                val != ABSENT && !fmri.is_some_and(|f| spec.matches(f))
            });
            self.prune(id, StaticReason::Requested { op }, |val, _| val == ABSENT);
        }

        for spec in &intent.update {
            let op = Operation::Update(Some(spec.clone())).to_string();
            self.prune(id, StaticReason::NotRequested { op: op.clone() }, |val, fmri| {
                val != ABSENT && !fmri.is_some_and(|f| spec.matches(f))
            });
            self.prune(id, StaticReason::Requested { op }, |val, _| val == ABSENT);
        }

        if let Some(ref exact) = intent.exact {
            match exact_obsolete {
                Some(fmri) => {
                    self.prune(id, StaticReason::Obsolete { fmri }, |val, _| val != ABSENT);
                }
                None => {
                    let op = Operation::Exact(exact.clone()).to_string();
                    self.prune(id, StaticReason::NotRequested { op: op.clone() }, |val, fmri| {
                        val != ABSENT && !fmri.is_some_and(|f| exact_matches(exact, f))
                    });
                    self.prune(id, StaticReason::Requested { op }, |val, _| val == ABSENT);
                }
            }
        }

        if let Some(freeze) = config.freezes.get(&name) {
            let reason = StaticReason::Frozen {
                version: freeze.version.clone(),
                reason: freeze.reason.clone(),
            };
            self.prune(id, reason.clone(), |val, fmri| {
                val != ABSENT && !fmri.is_some_and(|f| f.version.matches_prefix(&freeze.version))
            });
            if installed.is_some() {
                self.prune(id, reason, |val, _| val == ABSENT);
            }
        }

        if let Some(pin) = self.request.pins.get(&name) {
            self.prune(id, StaticReason::Pinned { version: pin.clone() }, |val, fmri| {
                val != ABSENT && !fmri.is_some_and(|f| &f.version == pin)
            });
        }

        let requested = !intent.install.is_empty()
            || !intent.update.is_empty()
            || intent.exact.is_some();
        if config.is_avoided(&name) && installed.is_none() && !requested {
            self.prune(id, StaticReason::Avoided, |val, _| val != ABSENT);
        }

        if let Some(installed) = installed {
            if !self.request.allow_downgrade && intent.exact.is_none() {
                let floor = installed.version.clone();
                self.prune(
                    id,
                    StaticReason::NoDowngrade {
                        installed: installed.clone(),
                    },
                    |val, fmri| val != ABSENT && fmri.is_some_and(|f| f.version < floor),
                );
            }
            if !intent.remove {
                self.prune(
                    id,
                    StaticReason::KeepInstalled {
                        installed: installed.clone(),
                    },
                    |val, _| val == ABSENT,
                );
            }
        }

        self.apply_linked_statics(id);
    }

    /// Origin and parent dependencies are checked against fixed image contents
    fn apply_linked_statics(&mut self, id: VarId) {
        for val in 1..self.vars[id].len() {
            if self.initial[id][val].is_some() {
                continue;
            }
            let Some(entry) = self.vars[id].values[val].clone() else {
                continue;
            };
            for decl in &entry.dependencies {
                let violation = match &decl.dependency {
                    Dependency::Origin { target, root_image } => {
                        let reference = match (root_image, self.parent) {
                            (true, Some(parent)) => parent,
                            _ => &self.state.installed,
                        };
                        reference
                            .get(&target.name)
                            .filter(|found| !target.range.satisfies(&found.version))
                            .map(|found| StaticReason::Origin {
                                dependency: format!("{} {}", entry.fmri, decl.dependency),
                                found: Some(found.clone()),
                            })
                    }
                    Dependency::Parent(target) => match self.parent {
                        Some(parent) if !parent_satisfies(parent, target, &entry.fmri) => {
                            Some(StaticReason::Parent {
                                dependency: format!("{} {}", entry.fmri, decl.dependency),
                            })
                        }
                        _ => None,
                    },
                    _ => None,
                };
                if let Some(reason) = violation {
                    let cause = self.add_static(reason);
                    self.initial[id][val] = Some(cause);
                    break;
                }
            }
        }
    }

    fn build_constraints(&self) -> Vec<Constraint> {
        let config = self.view.config();
        let mut constraints = Vec::new();

        for (owner, var) in self.vars.iter().enumerate() {
            for (value, entry) in var.values.iter().enumerate() {
                let Some(entry) = entry else { continue };
                if self.initial[owner][value].is_some() {
                    continue;
                }

                for decl in &entry.dependencies {
                    let facet_off = decl
                        .facet
                        .as_ref()
                        .is_some_and(|f| !config.facet_enabled(f));
                    let mut text = format!("{} {}", entry.fmri, decl.dependency);
                    if facet_off && let Some(ref facet) = decl.facet {
                        text.push_str(&format!(" ({} is off)", facet));
                    }

                    let implies = |target: &Target, allow_absent: bool| Constraint {
                        owner,
                        value,
                        kind: ConstraintKind::Implies {
                            target: self.index[&target.name],
                            allowed: self.allowed(target, allow_absent),
                        },
                        text: text.clone(),
                    };

                    match &decl.dependency {
                        Dependency::Require(t) => constraints.push(implies(t, facet_off)),
                        Dependency::Optional(t) | Dependency::Incorporate(t) => {
                            constraints.push(implies(t, true))
                        }
                        Dependency::Group(alts) if facet_off => {
                            constraints.extend(alts.iter().map(|t| implies(t, true)))
                        }
                        Dependency::Group(alts) => {
                            let mut seen = BTreeSet::new();
                            let alts = alts
                                .iter()
                                .filter(|t| seen.insert(t.name.clone()))
                                .map(|t| (self.index[&t.name], self.allowed(t, false)))
                                .collect();
                            constraints.push(Constraint {
                                owner,
                                value,
                                kind: ConstraintKind::Group { alts },
                                text: text.clone(),
                            });
                        }
                        Dependency::Conditional { target, predicate } => match predicate {
                            Predicate::Variant { name, value: wanted } => {
                                if config.variant(name) == Some(wanted.as_str()) {
                                    constraints.push(implies(target, facet_off));
                                }
                            }
                            Predicate::Facet { name, enabled } => {
                                if config.facet_enabled(name) == *enabled {
                                    constraints.push(implies(target, facet_off));
                                }
                            }
                            Predicate::Package(p) => {
                                constraints.push(Constraint {
                                    owner,
                                    value,
                                    kind: ConstraintKind::Conditional {
                                        cond: self.index[&p.name],
                                        cond_set: self.allowed(p, false),
                                        target: self.index[&target.name],
                                        allowed: self.allowed(target, facet_off),
                                    },
                                    text: text.clone(),
                                });
                            }
                        },
                        Dependency::Origin { .. } | Dependency::Parent(_) => {}
                    }
                }
            }
        }

        constraints
    }

    fn allowed(&self, target: &Target, allow_absent: bool) -> Vec<bool> {
        let var = &self.vars[self.index[&target.name]];
        (0..var.len())
            .map(|val| match var.fmri(val) {
                None => allow_absent,
                Some(fmri) => target.range.satisfies(&fmri.version),
            })
            .collect()
    }
}

fn exact_matches(wanted: &Fmri, candidate: &Fmri) -> bool {
    wanted.name == candidate.name
        && wanted.version == candidate.version
        && wanted
            .publisher
            .as_ref()
            .is_none_or(|p| candidate.publisher.as_ref() == Some(p))
}

fn parent_satisfies(parent: &BTreeMap<String, Fmri>, target: &Target, own: &Fmri) -> bool {
    if target.name == PARENT_SELF {
        return parent
            .get(&own.name)
            .is_some_and(|p| p.version == own.version);
    }
    parent
        .get(&target.name)
        .is_some_and(|p| target.range.satisfies(&p.version))
}
