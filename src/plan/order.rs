// src/plan/order.rs

//! Action ordering
//!
//! Edges:
//! - a directory is created before anything inside it, and removed after
//! - a removal at a path precedes any creation at or below that path
//! - a link comes after the action that creates its target
//! - groups, then users, then the files and directories they own
//! - services and drivers come after filesystem creation and are removed
//!   before filesystem removal
//! - explicit `after` hints from manifests
//!
//! Ready actions are emitted in (phase, key) order so the result is
//! reproducible. Anything left once no action is ready is a cycle.

use super::action::{ActionKey, ActionKind, Namespace, ancestors, normalize};
use super::diff::{ActionOp, PlannedAction};
use crate::error::{Error, Result};
use crate::progress::CancelToken;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const CANCEL_CHECK_INTERVAL: usize = 256;

struct Graph {
    succ: Vec<BTreeSet<usize>>,
    indegree: Vec<usize>,
}

impl Graph {
    fn new(n: usize) -> Self {
        Self {
            succ: vec![BTreeSet::new(); n],
            indegree: vec![0; n],
        }
    }

    fn edge(&mut self, from: usize, to: usize) {
        if from != to && self.succ[from].insert(to) {
            self.indegree[to] += 1;
        }
    }
}

fn phase(action: &PlannedAction) -> u8 {
    let kind = action.kind();
    let service = matches!(kind, Some(ActionKind::Service | ActionKind::Driver));
    match (action.op, kind) {
        (ActionOp::Remove, _) if service => 0,
        (ActionOp::Remove, Some(ActionKind::User)) => 6,
        (ActionOp::Remove, Some(ActionKind::Group)) => 7,
        (ActionOp::Remove, _) => 1,
        (_, Some(ActionKind::Group)) => 2,
        (_, Some(ActionKind::User)) => 3,
        _ if service => 5,
        _ => 4,
    }
}

/// Sort `actions` into a valid execution order
pub(crate) fn order(actions: Vec<PlannedAction>, cancel: &CancelToken) -> Result<Vec<PlannedAction>> {
    let n = actions.len();
    let mut graph = Graph::new(n);

    let mut creators: BTreeMap<&ActionKey, usize> = BTreeMap::new();
    let mut removers: BTreeMap<&ActionKey, usize> = BTreeMap::new();
    for (i, a) in actions.iter().enumerate() {
        match a.op {
            ActionOp::Install | ActionOp::Update => {
                creators.insert(&a.key, i);
            }
            ActionOp::Remove => {
                removers.insert(&a.key, i);
            }
            ActionOp::Transfer => {}
        }
    }

    let path_key = |id: &str| ActionKey {
        namespace: Namespace::Path,
        id: id.to_string(),
    };

    for (i, a) in actions.iter().enumerate() {
        let is_path = a.key.namespace == Namespace::Path;

        if a.creates() {
            if let Some(&r) = removers.get(&a.key) {
                graph.edge(r, i);
            }
            if is_path {
                for anc in ancestors(&a.key.id) {
                    let anc = path_key(anc);
                    if let Some(&c) = creators.get(&anc)
                        && actions[c].kind() == Some(ActionKind::Dir)
                    {
                        graph.edge(c, i);
                    }
                    if let Some(&r) = removers.get(&anc) {
                        graph.edge(r, i);
                    }
                }
            }
            if let Some(target) = a.new.as_ref().and_then(|c| c.link_target())
                && let Some(&c) = creators.get(&path_key(&target))
            {
                graph.edge(c, i);
            }
            if let Some(new) = a.new.as_ref() {
                for (ns, name) in new.principals() {
                    let key = ActionKey {
                        namespace: ns,
                        id: name.to_string(),
                    };
                    if let Some(&c) = creators.get(&key) {
                        graph.edge(c, i);
                    }
                }
            }
        }

        if a.op == ActionOp::Remove {
            if is_path {
                for anc in ancestors(&a.key.id) {
                    if let Some(&r) = removers.get(&path_key(anc))
                        && actions[r].kind() == Some(ActionKind::Dir)
                    {
                        graph.edge(i, r);
                    }
                }
            }
            if let Some(old) = a.old.as_ref() {
                for (ns, name) in old.principals() {
                    let key = ActionKey {
                        namespace: ns,
                        id: name.to_string(),
                    };
                    if let Some(&r) = removers.get(&key) {
                        graph.edge(i, r);
                    }
                }
            }
        }
    }

    // services and drivers relative to the filesystem
    let services: Vec<usize> = (0..n)
        .filter(|&i| matches!(actions[i].kind(), Some(ActionKind::Service | ActionKind::Driver)))
        .collect();
    for &s in &services {
        for (i, a) in actions.iter().enumerate() {
            if a.key.namespace != Namespace::Path {
                continue;
            }
            match (actions[s].op, a.op) {
                (ActionOp::Remove, ActionOp::Remove) => graph.edge(s, i),
                (ActionOp::Install | ActionOp::Update, ActionOp::Install | ActionOp::Update) => {
                    graph.edge(i, s)
                }
                _ => {}
            }
        }
    }

    // explicit hints name an action by its key
    let mut by_name: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, a) in actions.iter().enumerate() {
        by_name.entry(a.key.to_string()).or_default().push(i);
    }
    for (i, a) in actions.iter().enumerate() {
        for hint in &a.after {
            let hint = if hint.contains(' ') {
                hint.clone()
            } else {
                normalize(hint)
            };
            for &j in by_name.get(&hint).into_iter().flatten() {
                graph.edge(j, i);
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled("plan ordering".to_string()));
    }

    let mut ready: BTreeSet<(u8, &str, usize)> = BTreeSet::new();
    for (i, a) in actions.iter().enumerate() {
        if graph.indegree[i] == 0 {
            ready.insert((phase(a), a.key.id.as_str(), i));
        }
    }

    let mut sequence: Vec<usize> = Vec::with_capacity(n);
    while let Some(next) = ready.pop_first() {
        let (_, _, i) = next;
        sequence.push(i);
        if sequence.len() % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled("plan ordering".to_string()));
        }
        let successors: Vec<usize> = graph.succ[i].iter().copied().collect();
        for j in successors {
            graph.indegree[j] -= 1;
            if graph.indegree[j] == 0 {
                ready.insert((phase(&actions[j]), actions[j].key.id.as_str(), j));
            }
        }
    }

    if sequence.len() < n {
        let placed: BTreeSet<usize> = sequence.iter().copied().collect();
        let mut stuck: Vec<String> = (0..n)
            .filter(|i| !placed.contains(i))
            .map(|i| actions[i].label())
            .collect();
        stuck.sort();
        return Err(Error::PlanCycle { actions: stuck });
    }

    debug!("Ordered {} action(s)", n);

    let mut slots: Vec<Option<PlannedAction>> = actions.into_iter().map(Some).collect();
    Ok(sequence
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}
