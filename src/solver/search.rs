// src/solver/search.rs

//! Propagation and search
//!
//! Domains shrink by removing values, each removal tagged with its [`Cause`].
//! Propagation runs every affected constraint to a fixpoint. The search keeps
//! an explicit stack of decision frames, trying values in each variable's
//! preference order, and keeps the cheapest complete assignment it finds.

use super::problem::{ABSENT, Cause, ConstraintKind, Problem, ValId, VarId};
use crate::config::SolverConfig;
use crate::error::{Error, Result};
use crate::progress::CancelToken;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Domains of every variable
#[derive(Debug, Clone)]
pub(crate) struct State {
    pub removed: Vec<Vec<Option<Cause>>>,
}

impl State {
    pub fn alive(&self, var: VarId, val: ValId) -> bool {
        self.removed[var][val].is_none()
    }

    pub fn alive_values(&self, var: VarId) -> impl Iterator<Item = ValId> + '_ {
        self.removed[var]
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(v, _)| v)
    }

    pub fn count(&self, var: VarId) -> usize {
        self.removed[var].iter().filter(|c| c.is_none()).count()
    }

    /// The single remaining value, if the domain is down to one
    pub fn fixed(&self, var: VarId) -> Option<ValId> {
        let mut alive = self.alive_values(var);
        match (alive.next(), alive.next()) {
            (Some(v), None) => Some(v),
            _ => None,
        }
    }

    pub fn cause(&self, var: VarId, val: ValId) -> Option<Cause> {
        self.removed[var][val]
    }

    fn remove(&mut self, var: VarId, val: ValId, cause: Cause) -> bool {
        if self.removed[var][val].is_some() {
            return false;
        }
        self.removed[var][val] = Some(cause);
        true
    }
}

/// Pending constraint queue for one propagation run
struct Worklist {
    queue: VecDeque<usize>,
    queued: Vec<bool>,
}

impl Worklist {
    fn new(size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: vec![false; size],
        }
    }

    fn push_var(&mut self, problem: &Problem, var: VarId) {
        for &c in &problem.watches[var] {
            if !self.queued[c] {
                self.queued[c] = true;
                self.queue.push_back(c);
            }
        }
    }

    fn pop(&mut self) -> Option<usize> {
        let c = self.queue.pop_front()?;
        self.queued[c] = false;
        Some(c)
    }
}

/// Remove values until every constraint holds; `Err` names an emptied variable
pub(crate) fn propagate(
    problem: &Problem,
    state: &mut State,
    dirty: impl IntoIterator<Item = VarId>,
) -> std::result::Result<(), VarId> {
    let mut work = Worklist::new(problem.constraints.len());
    for var in dirty {
        work.push_var(problem, var);
    }

    while let Some(cid) = work.pop() {
        let mut changed: Vec<VarId> = Vec::new();
        {
            let mut strike = |state: &mut State, var: VarId, val: ValId| {
                if state.remove(var, val, Cause::Constraint(cid)) {
                    changed.push(var);
                }
            };
            apply(problem, state, cid, &mut strike);
        }
        changed.sort_unstable();
        changed.dedup();
        for var in changed {
            if state.count(var) == 0 {
                return Err(var);
            }
            work.push_var(problem, var);
        }
    }
    Ok(())
}

fn any_allowed(state: &State, var: VarId, allowed: &[bool]) -> bool {
    state.alive_values(var).any(|v| allowed[v])
}

fn apply<F>(problem: &Problem, state: &mut State, cid: usize, strike: &mut F)
where
    F: FnMut(&mut State, VarId, ValId),
{
    let c = &problem.constraints[cid];
    let (owner, value) = (c.owner, c.value);
    if !state.alive(owner, value) {
        return;
    }
    let owner_fixed = state.fixed(owner) == Some(value);

    match &c.kind {
        ConstraintKind::Implies { target, allowed } => {
            if !any_allowed(state, *target, allowed) {
                strike(state, owner, value);
            } else if owner_fixed {
                let doomed: Vec<ValId> = state
                    .alive_values(*target)
                    .filter(|&v| !allowed[v])
                    .collect();
                for v in doomed {
                    strike(state, *target, v);
                }
            }
        }
        ConstraintKind::Conditional {
            cond,
            cond_set,
            target,
            allowed,
        } => {
            let cond_holds = state.alive_values(*cond).all(|v| cond_set[v]);
            let target_ok = any_allowed(state, *target, allowed);
            if cond_holds && !target_ok {
                strike(state, owner, value);
            } else if owner_fixed && cond_holds {
                let doomed: Vec<ValId> = state
                    .alive_values(*target)
                    .filter(|&v| !allowed[v])
                    .collect();
                for v in doomed {
                    strike(state, *target, v);
                }
            } else if owner_fixed && !target_ok {
                let doomed: Vec<ValId> = state
                    .alive_values(*cond)
                    .filter(|&v| cond_set[v])
                    .collect();
                for v in doomed {
                    strike(state, *cond, v);
                }
            }
        }
        ConstraintKind::Group { alts } => {
            let valid: Vec<bool> = alts
                .iter()
                .map(|(var, allowed)| {
                    state
                        .alive_values(*var)
                        .any(|v| v != ABSENT && allowed[v])
                })
                .collect();
            let must: Vec<bool> = alts
                .iter()
                .map(|(var, _)| !state.alive(*var, ABSENT))
                .collect();
            // an installed alternative that may stay within range
            let keep = alts
                .iter()
                .zip(&valid)
                .any(|((var, _), &ok)| ok && problem.vars[*var].current != ABSENT);

            let n_valid = valid.iter().filter(|&&b| b).count();
            let n_must = must.iter().filter(|&&b| b).count();
            let must_but_invalid = valid.iter().zip(&must).any(|(&ok, &m)| m && !ok);

            if n_valid == 0 || (!keep && (n_must >= 2 || must_but_invalid)) {
                strike(state, owner, value);
                return;
            }
            if !owner_fixed {
                return;
            }

            if n_valid == 1
                && let Some(i) = valid.iter().position(|&b| b)
            {
                let (var, allowed) = &alts[i];
                let doomed: Vec<ValId> = state
                    .alive_values(*var)
                    .filter(|&v| v == ABSENT || !allowed[v])
                    .collect();
                for v in doomed {
                    strike(state, *var, v);
                }
            }
            if keep {
                return;
            }

            for (var, allowed) in alts {
                let doomed: Vec<ValId> = state
                    .alive_values(*var)
                    .filter(|&v| v != ABSENT && !allowed[v])
                    .collect();
                for v in doomed {
                    strike(state, *var, v);
                }
            }
            if n_must == 1
                && let Some(i) = must.iter().position(|&b| b)
            {
                for (j, (var, _)) in alts.iter().enumerate() {
                    if j != i {
                        let doomed: Vec<ValId> =
                            state.alive_values(*var).filter(|&v| v != ABSENT).collect();
                        for v in doomed {
                            strike(state, *var, v);
                        }
                    }
                }
            }
        }
    }
}

/// Lexicographic cost: (target preference ranks, non-target changes)
pub(crate) type Cost = (u64, u64);

fn cost(problem: &Problem, assignment: &[ValId]) -> Cost {
    let mut ranks = 0;
    let mut changes = 0;
    for (var, &val) in problem.vars.iter().zip(assignment) {
        if var.target {
            ranks += var.rank[val];
        } else if val != var.current {
            changes += 1;
        }
    }
    (ranks, changes)
}

fn lower_bound(problem: &Problem, state: &State) -> Cost {
    let mut ranks = 0;
    let mut changes = 0;
    for (id, var) in problem.vars.iter().enumerate() {
        if var.target {
            ranks += state
                .alive_values(id)
                .map(|v| var.rank[v])
                .min()
                .unwrap_or(0);
        } else if !state.alive(id, var.current) {
            changes += 1;
        }
    }
    (ranks, changes)
}

/// The deepest dead end reached, kept for explanations
#[derive(Debug, Clone)]
pub(crate) struct Conflict {
    pub state: State,
    pub var: VarId,
    pub depth: usize,
    pub decisions: Vec<(VarId, ValId)>,
}

#[derive(Debug)]
pub(crate) struct Outcome {
    pub best: Option<(Vec<ValId>, Cost)>,
    pub steps: u64,
    pub solutions: u64,
    pub exhausted: bool,
    pub conflict: Option<Conflict>,
}

struct Frame {
    state: State,
    var: VarId,
    choices: Vec<ValId>,
    next: usize,
}

pub(crate) struct Search<'p> {
    problem: &'p Problem,
    options: &'p SolverConfig,
    cancel: &'p CancelToken,
    steps: u64,
    solutions: u64,
    best: Option<(Vec<ValId>, Cost)>,
    conflict: Option<Conflict>,
}

impl<'p> Search<'p> {
    pub fn new(problem: &'p Problem, options: &'p SolverConfig, cancel: &'p CancelToken) -> Self {
        Self {
            problem,
            options,
            cancel,
            steps: 0,
            solutions: 0,
            best: None,
            conflict: None,
        }
    }

    pub fn run(mut self) -> Result<Outcome> {
        let problem = self.problem;
        let mut root = State {
            removed: problem.initial.clone(),
        };

        if let Some(var) = (0..problem.vars.len()).find(|&v| root.count(v) == 0) {
            self.record_conflict(0, root, var, &[]);
            return Ok(self.finish(false));
        }
        if let Err(var) = propagate(problem, &mut root, 0..problem.vars.len()) {
            self.record_conflict(0, root, var, &[]);
            return Ok(self.finish(false));
        }

        let mut stack: Vec<Frame> = Vec::new();
        let mut pending = Some(root);
        let mut exhausted = false;

        loop {
            if let Some(state) = pending.take() {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled("solve".to_string()));
                }
                self.steps += 1;
                if self.steps > self.options.max_steps {
                    exhausted = true;
                    break;
                }

                let pruned = self
                    .best
                    .as_ref()
                    .is_some_and(|(_, best)| lower_bound(problem, &state) >= *best);
                if !pruned {
                    match self.select(&state) {
                        Some(var) => {
                            let choices = problem.vars[var]
                                .order
                                .iter()
                                .copied()
                                .filter(|&v| state.alive(var, v))
                                .collect();
                            stack.push(Frame {
                                state,
                                var,
                                choices,
                                next: 0,
                            });
                        }
                        None => {
                            self.record_solution(&state);
                            if !self.options.optimize {
                                break;
                            }
                        }
                    }
                }
            }

            let Some(frame) = stack.last_mut() else { break };
            if frame.next >= frame.choices.len() {
                stack.pop();
                continue;
            }
            let var = frame.var;
            let val = frame.choices[frame.next];
            frame.next += 1;

            let mut child = frame.state.clone();
            let others: Vec<ValId> = child.alive_values(var).filter(|&v| v != val).collect();
            for other in others {
                child.remove(var, other, Cause::Decision(var));
            }
            trace!(
                "decide {} = {}",
                problem.vars[var].name,
                problem.vars[var].label(val)
            );

            match propagate(problem, &mut child, [var]) {
                Ok(()) => pending = Some(child),
                Err(conflict_var) => {
                    let decisions: Vec<(VarId, ValId)> = stack
                        .iter()
                        .map(|f| (f.var, f.choices[f.next - 1]))
                        .collect();
                    self.record_conflict(stack.len(), child, conflict_var, &decisions);
                }
            }
        }

        Ok(self.finish(exhausted))
    }

    /// Unfixed variable with the fewest remaining values, ties by name
    fn select(&self, state: &State) -> Option<VarId> {
        (0..self.problem.vars.len())
            .filter(|&v| state.count(v) > 1)
            .min_by(|&a, &b| {
                state
                    .count(a)
                    .cmp(&state.count(b))
                    .then_with(|| self.problem.vars[a].name.cmp(&self.problem.vars[b].name))
            })
    }

    fn record_solution(&mut self, state: &State) {
        let assignment: Vec<ValId> = (0..self.problem.vars.len())
            .map(|v| state.fixed(v).unwrap_or(ABSENT))
            .collect();
        let cost = cost(self.problem, &assignment);
        self.solutions += 1;
        if self.best.as_ref().is_none_or(|(_, best)| cost < *best) {
            debug!("Solution {} with cost {:?}", self.solutions, cost);
            self.best = Some((assignment, cost));
        }
    }

    fn record_conflict(
        &mut self,
        depth: usize,
        state: State,
        var: VarId,
        decisions: &[(VarId, ValId)],
    ) {
        if self.conflict.as_ref().is_some_and(|c| c.depth > depth) {
            return;
        }
        let keep = decisions.len().min(self.options.trace_depth);
        self.conflict = Some(Conflict {
            state,
            var,
            depth,
            decisions: decisions[decisions.len() - keep..].to_vec(),
        });
    }

    fn finish(self, exhausted: bool) -> Outcome {
        Outcome {
            best: self.best,
            steps: self.steps,
            solutions: self.solutions,
            exhausted,
            conflict: self.conflict,
        }
    }
}
