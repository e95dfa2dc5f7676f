// src/solver/explain.rs

//! Unsatisfiable explanations
//!
//! Built from the deepest dead end the search reached. The chain follows why
//! the conflicting package had to be present back to the request, a freeze or
//! an installed package; the reasons say why each of its candidates was
//! rejected.

use super::problem::{ABSENT, Cause, ConstraintKind, Problem, VarId};
use super::search::{Conflict, State};
use std::collections::BTreeSet;
use std::fmt;

/// Why no solution exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Explanation {
    /// The request being solved
    pub request: String,
    /// Package whose candidates were all rejected
    pub conflict: String,
    /// Requirement chain from the request down to the conflict
    pub chain: Vec<String>,
    /// One entry per rejected candidate
    pub reasons: Vec<String>,
    /// Search decisions in force at the dead end
    pub decisions: Vec<String>,
    pub note: Option<String>,
}

impl Explanation {
    /// Every chain and reason line, in display order
    pub fn lines(&self) -> Vec<&str> {
        self.chain
            .iter()
            .chain(&self.reasons)
            .map(String::as_str)
            .collect()
    }

    /// True if any line contains `needle`
    pub fn mentions(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
            || self.note.as_deref().is_some_and(|n| n.contains(needle))
    }
}

impl fmt::Display for Explanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no solution for '{}': no acceptable choice for {}",
            self.request, self.conflict
        )?;
        for line in &self.chain {
            write!(f, "\n  {}", line)?;
        }
        for line in &self.reasons {
            write!(f, "\n    rejected {}", line)?;
        }
        if !self.decisions.is_empty() {
            write!(f, "\n  while trying: {}", self.decisions.join(", "))?;
        }
        if let Some(ref note) = self.note {
            write!(f, "\n  note: {}", note)?;
        }
        Ok(())
    }
}

pub(crate) fn explain(problem: &Problem, conflict: Option<&Conflict>, note: Option<String>) -> Explanation {
    let Some(conflict) = conflict else {
        return Explanation {
            request: problem.request_text.clone(),
            conflict: "the image".to_string(),
            chain: Vec::new(),
            reasons: Vec::new(),
            decisions: Vec::new(),
            note,
        };
    };

    let state = &conflict.state;
    let var = &problem.vars[conflict.var];

    let mut reasons: Vec<String> = var
        .order
        .iter()
        .map(|&val| {
            format!(
                "{}: {}",
                var.label(val),
                describe(problem, state, conflict.var, val, 0)
            )
        })
        .collect();
    if var.len() == 1 {
        reasons.push(format!(
            "no versions of {} are available for this image",
            var.name
        ));
    }

    let decisions = conflict
        .decisions
        .iter()
        .map(|&(v, val)| format!("{} = {}", problem.vars[v].name, problem.vars[v].label(val)))
        .collect();

    Explanation {
        request: problem.request_text.clone(),
        conflict: var.name.clone(),
        chain: chain(problem, state, conflict.var),
        reasons,
        decisions,
        note,
    }
}

/// Walk "why must this be present" links up to their origin
fn chain(problem: &Problem, state: &State, start: VarId) -> Vec<String> {
    let mut lines = Vec::new();
    let mut seen = BTreeSet::new();
    let mut current = start;

    while seen.insert(current) {
        let name = &problem.vars[current].name;
        match state.cause(current, ABSENT) {
            Some(Cause::Static(i)) => {
                lines.push(format!("{}: {}", name, problem.statics[i]));
                break;
            }
            Some(Cause::Constraint(c)) if problem.constraints[c].owner != current => {
                let constraint = &problem.constraints[c];
                lines.push(format!("{}: needed because {}", name, constraint.text));
                current = constraint.owner;
            }
            Some(Cause::Decision(_)) => {
                lines.push(format!("{}: selected during search", name));
                break;
            }
            _ => break,
        }
    }

    lines.reverse();
    lines
}

fn describe(problem: &Problem, state: &State, var: VarId, val: usize, depth: usize) -> String {
    match state.cause(var, val) {
        None => "still possible".to_string(),
        Some(Cause::Static(i)) => problem.statics[i].to_string(),
        Some(Cause::Decision(v)) => {
            let chosen = state
                .fixed(v)
                .map(|c| problem.vars[v].label(c))
                .unwrap_or_else(|| problem.vars[v].name.clone());
            format!("not chosen while trying {}", chosen)
        }
        Some(Cause::Constraint(c)) => {
            let constraint = &problem.constraints[c];
            if constraint.owner != var {
                return format!("excluded because {}", constraint.text);
            }
            let ConstraintKind::Implies { target, allowed } = &constraint.kind else {
                return constraint.text.clone();
            };
            if depth > 0 {
                return constraint.text.clone();
            }

            let target_var = &problem.vars[*target];
            let blocked: Vec<String> = (0..target_var.len())
                .filter(|&v| allowed[v])
                .map(|v| {
                    format!(
                        "{} is excluded: {}",
                        target_var.label(v),
                        describe(problem, state, *target, v, depth + 1)
                    )
                })
                .collect();
            if blocked.is_empty() {
                format!(
                    "{} but no version of {} satisfies it",
                    constraint.text, target_var.name
                )
            } else {
                format!("{} but {}", constraint.text, blocked.join("; "))
            }
        }
    }
}
