// src/plan/diff.rs

//! Image content diff
//!
//! Both the current and the target image are expanded into one object per
//! action key (path, user, group, driver, service). Conflicts are found on
//! the target side before anything is compared; the diff then pairs old and
//! new objects key by key.

use super::action::{ActionKey, ActionKind, ContentAction, ManifestSource, Overlay};
use crate::error::Result;
use crate::fmri::Fmri;
use crate::hash::{Fingerprint, HashAlgorithm};
use crate::image::ImageConfig;
use crate::solver::MediatorChoice;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum_macros::Display;
use tracing::{debug, warn};

/// What an action does to the image
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActionOp {
    Install,
    Update,
    Remove,
    /// Content unchanged; only the owning package changes
    Transfer,
}

/// One step of an image plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub op: ActionOp,
    pub key: ActionKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<ContentAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<ContentAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Fmri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Fmri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// Ordering hints carried from the manifest
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

impl PlannedAction {
    /// The action as it will exist afterwards, or as it existed before a removal
    pub fn action(&self) -> Option<&ContentAction> {
        self.new.as_ref().or(self.old.as_ref())
    }

    pub fn kind(&self) -> Option<ActionKind> {
        self.action().map(ContentAction::kind)
    }

    /// Package responsible for this step
    pub fn package(&self) -> Option<&Fmri> {
        match self.op {
            ActionOp::Remove => self.from.as_ref(),
            _ => self.to.as_ref(),
        }
    }

    /// True for steps that create or replace something on disk
    pub fn creates(&self) -> bool {
        matches!(self.op, ActionOp::Install | ActionOp::Update)
    }

    pub fn label(&self) -> String {
        match self.kind() {
            Some(kind) => format!("{} {} {}", self.op, kind, self.key.id),
            None => format!("{} {}", self.op, self.key),
        }
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())?;
        match (self.op, &self.from, &self.to) {
            (ActionOp::Transfer, Some(from), Some(to)) => {
                write!(f, " ({} -> {})", from.short(), to.short())
            }
            (_, _, Some(to)) => write!(f, " ({})", to.short()),
            (_, Some(from), None) => write!(f, " ({})", from.short()),
            _ => Ok(()),
        }
    }
}

/// Two packages deliver the same object incompatibly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConflict {
    pub key: ActionKey,
    pub owners: Vec<Fmri>,
    pub reason: String,
}

impl fmt::Display for PathConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owners: Vec<String> = self.owners.iter().map(|o| o.to_string()).collect();
        write!(
            f,
            "Conflicting actions for {}: {} (delivered by {})",
            self.key,
            self.reason,
            owners.join(", ")
        )
    }
}

/// An action together with the package delivering it
#[derive(Debug, Clone)]
pub(crate) struct Owned {
    pub owner: Fmri,
    pub action: ContentAction,
    pub after: Vec<String>,
}

/// The object a key resolves to, with every package sharing it
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub action: ContentAction,
    pub owners: Vec<Fmri>,
    pub after: Vec<String>,
}

/// Expand the manifests of `packages` under one configuration
pub(crate) fn collect<'f>(
    manifests: &dyn ManifestSource,
    packages: impl Iterator<Item = &'f Fmri>,
    config: &ImageConfig,
    mediators: &BTreeMap<String, MediatorChoice>,
) -> Result<Vec<Owned>> {
    let mut owned = Vec::new();
    for fmri in packages {
        for line in manifests.manifest(fmri)? {
            if line.applies(fmri, config, mediators) {
                owned.push(Owned {
                    owner: fmri.clone(),
                    action: line.action,
                    after: line.tags.after,
                });
            }
        }
    }
    Ok(owned)
}

/// Group actions by key; every key resolves even when it also conflicts
pub(crate) fn resolve(actions: Vec<Owned>) -> (BTreeMap<ActionKey, Resolved>, Vec<PathConflict>) {
    let mut groups: BTreeMap<ActionKey, Vec<Owned>> = BTreeMap::new();
    for owned in actions {
        groups.entry(owned.action.key()).or_default().push(owned);
    }

    let mut resolved = BTreeMap::new();
    let mut conflicts = Vec::new();

    for (key, mut group) in groups {
        group.sort_by(|a, b| a.owner.cmp(&b.owner));
        let mut owners: Vec<Fmri> = group.iter().map(|o| o.owner.clone()).collect();
        owners.dedup();

        if owners.len() == 1 {
            let first = &group[0];
            if group.iter().any(|o| !same_content(&o.action, &first.action)) {
                conflicts.push(PathConflict {
                    key: key.clone(),
                    owners: owners.clone(),
                    reason: "delivered twice with different attributes".to_string(),
                });
            }
            resolved.insert(key, merge(&group, 0, owners));
            continue;
        }

        match shared(&group) {
            Ok(winner) => {
                let owners = if group[winner].action.overlay() == Some(Overlay::True) {
                    vec![group[winner].owner.clone()]
                } else {
                    owners
                };
                resolved.insert(key, merge(&group, winner, owners));
            }
            Err(reason) => {
                conflicts.push(PathConflict {
                    key: key.clone(),
                    owners: owners.clone(),
                    reason,
                });
                resolved.insert(key, merge(&group, 0, owners));
            }
        }
    }

    (resolved, conflicts)
}

fn merge(group: &[Owned], winner: usize, owners: Vec<Fmri>) -> Resolved {
    let mut after: Vec<String> = group.iter().flat_map(|o| o.after.iter().cloned()).collect();
    after.sort();
    after.dedup();
    Resolved {
        action: group[winner].action.clone(),
        owners,
        after,
    }
}

/// Index of the action that represents a key shared by several packages
fn shared(group: &[Owned]) -> std::result::Result<usize, String> {
    let first = &group[0].action;
    let kinds: Vec<ActionKind> = group.iter().map(|o| o.action.kind()).collect();
    if kinds.iter().any(|k| *k != first.kind()) {
        let mut names: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
        names.sort();
        names.dedup();
        return Err(format!("delivered as {}", names.join(" and ")));
    }

    if first.kind() == ActionKind::File {
        let overlays: Vec<Option<Overlay>> = group.iter().map(|o| o.action.overlay()).collect();
        return match overlays.as_slice() {
            [Some(Overlay::Allow), Some(Overlay::True)] => Ok(1),
            [Some(Overlay::True), Some(Overlay::Allow)] => Ok(0),
            _ => Err("file delivered by more than one package".to_string()),
        };
    }

    if group.iter().all(|o| same_content(&o.action, first)) {
        Ok(0)
    } else {
        Err(format!("{} delivered with different attributes", first.kind()))
    }
}

fn same_content(a: &ContentAction, b: &ContentAction) -> bool {
    a.fingerprint(HashAlgorithm::Xxh128) == b.fingerprint(HashAlgorithm::Xxh128)
}

/// Pair old and new objects by key
pub(crate) fn diff(
    old: &BTreeMap<ActionKey, Resolved>,
    new: &BTreeMap<ActionKey, Resolved>,
) -> Vec<PlannedAction> {
    let mut actions = Vec::new();
    let step = |op, key: &ActionKey, old: Option<&Resolved>, new: Option<&Resolved>| PlannedAction {
        op,
        key: key.clone(),
        old: old.map(|r| r.action.clone()),
        new: new.map(|r| r.action.clone()),
        from: old.and_then(|r| r.owners.first().cloned()),
        to: new.and_then(|r| r.owners.first().cloned()),
        fingerprint: None,
        after: new.or(old).map(|r| r.after.clone()).unwrap_or_default(),
    };

    for (key, before) in old {
        match new.get(key) {
            None => actions.push(step(ActionOp::Remove, key, Some(before), None)),
            Some(after) if same_content(&before.action, &after.action) => {
                if before.owners != after.owners {
                    actions.push(step(ActionOp::Transfer, key, Some(before), Some(after)));
                }
            }
            Some(after) if before.action.kind() == after.action.kind() => {
                actions.push(step(ActionOp::Update, key, Some(before), Some(after)));
            }
            Some(after) => {
                actions.push(step(ActionOp::Remove, key, Some(before), None));
                actions.push(step(ActionOp::Install, key, None, Some(after)));
            }
        }
    }
    for (key, after) in new {
        if !old.contains_key(key) {
            actions.push(step(ActionOp::Install, key, None, Some(after)));
        }
    }

    debug!("Content diff: {} action(s)", actions.len());
    actions
}

/// Fingerprint every step, on the rayon pool when `parallel`
pub(crate) fn fingerprint_all(actions: &mut [PlannedAction], algorithm: HashAlgorithm, parallel: bool) {
    let compute = |a: &mut PlannedAction| {
        a.fingerprint = a.action().map(|c| c.fingerprint(algorithm));
    };
    if parallel {
        actions.par_iter_mut().for_each(compute);
    } else {
        actions.iter_mut().for_each(compute);
    }
}

/// Log every conflict after the first, which the caller reports
pub(crate) fn log_conflicts(conflicts: &[PathConflict]) {
    for extra in conflicts.iter().skip(1) {
        warn!("{}", extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::action::Namespace;

    fn fmri(s: &str) -> Fmri {
        Fmri::parse(s).unwrap()
    }

    fn file(path: &str, hash: &str, overlay: Option<Overlay>) -> ContentAction {
        ContentAction::File {
            path: path.to_string(),
            hash: hash.to_string(),
            mode: 0o644,
            owner: "root".to_string(),
            group: "root".to_string(),
            overlay,
            actuators: Vec::new(),
        }
    }

    fn dir(path: &str, mode: u32) -> ContentAction {
        ContentAction::Dir {
            path: path.to_string(),
            mode,
            owner: "root".to_string(),
            group: "root".to_string(),
        }
    }

    fn owned(owner: &str, action: ContentAction) -> Owned {
        Owned {
            owner: fmri(owner),
            action,
            after: Vec::new(),
        }
    }

    fn path_key(p: &str) -> ActionKey {
        ActionKey {
            namespace: Namespace::Path,
            id: p.to_string(),
        }
    }

    #[test]
    fn test_file_conflict() {
        let (_, conflicts) = resolve(vec![
            owned("pkg://t/a@1", file("etc/foo", "1", None)),
            owned("pkg://t/b@1", file("/etc/foo", "1", None)),
        ]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].key, path_key("etc/foo"));
        assert_eq!(conflicts[0].owners.len(), 2);
    }

    #[test]
    fn test_shared_directory_refcounted() {
        let (resolved, conflicts) = resolve(vec![
            owned("pkg://t/a@1", dir("usr", 0o755)),
            owned("pkg://t/b@1", dir("usr", 0o755)),
        ]);
        assert!(conflicts.is_empty());
        assert_eq!(resolved[&path_key("usr")].owners.len(), 2);

        let (_, conflicts) = resolve(vec![
            owned("pkg://t/a@1", dir("usr", 0o755)),
            owned("pkg://t/b@1", dir("usr", 0o700)),
        ]);
        assert_eq!(conflicts.len(), 1);
    }

    #[test]
    fn test_overlay_wins() {
        let (resolved, conflicts) = resolve(vec![
            owned("pkg://t/a@1", file("etc/conf", "1", Some(Overlay::Allow))),
            owned("pkg://t/b@1", file("etc/conf", "2", Some(Overlay::True))),
        ]);
        assert!(conflicts.is_empty());
        let r = &resolved[&path_key("etc/conf")];
        assert_eq!(r.owners, vec![fmri("pkg://t/b@1")]);
    }

    #[test]
    fn test_kind_mismatch_conflict() {
        let (_, conflicts) = resolve(vec![
            owned("pkg://t/a@1", file("opt/x", "1", None)),
            owned("pkg://t/b@1", dir("opt/x", 0o755)),
        ]);
        assert!(conflicts[0].reason.contains("dir and file"));
    }

    #[test]
    fn test_diff_ops() {
        let (old, _) = resolve(vec![
            owned("pkg://t/a@1", file("etc/keep", "1", None)),
            owned("pkg://t/a@1", file("etc/change", "1", None)),
            owned("pkg://t/a@1", file("etc/gone", "1", None)),
            owned("pkg://t/a@1", file("etc/moved", "1", None)),
        ]);
        let (new, _) = resolve(vec![
            owned("pkg://t/a@1", file("etc/keep", "1", None)),
            owned("pkg://t/a@1", file("etc/change", "2", None)),
            owned("pkg://t/a@1", file("etc/added", "1", None)),
            owned("pkg://t/b@1", file("etc/moved", "1", None)),
        ]);
        let actions = diff(&old, &new);
        let ops: BTreeMap<String, ActionOp> = actions
            .iter()
            .map(|a| (a.key.id.clone(), a.op))
            .collect();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops["etc/change"], ActionOp::Update);
        assert_eq!(ops["etc/gone"], ActionOp::Remove);
        assert_eq!(ops["etc/added"], ActionOp::Install);
        assert_eq!(ops["etc/moved"], ActionOp::Transfer);
    }
}
