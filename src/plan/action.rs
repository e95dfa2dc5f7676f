// src/plan/action.rs

//! Content actions and their sources
//!
//! A package's manifest is a list of content actions: directories, files,
//! links, users, groups, drivers and services. Each may be tagged with the
//! variants and facets it applies to and, for links, the mediator that
//! controls it.

use crate::error::{Error, Result};
use crate::fmri::{Fmri, Version};
use crate::hash::{Fingerprint, HashAlgorithm, Hasher};
use crate::image::ImageConfig;
use crate::solver::MediatorChoice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use strum_macros::{Display, EnumString};

/// Action type
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Dir,
    File,
    Link,
    Hardlink,
    User,
    Group,
    Driver,
    Service,
}

impl ActionKind {
    /// Actions that occupy a path in the image
    pub fn is_path(self) -> bool {
        matches!(
            self,
            ActionKind::Dir | ActionKind::File | ActionKind::Link | ActionKind::Hardlink
        )
    }
}

/// Namespace an action's identity lives in
///
/// Directories, files and links share the path namespace, so a file and a
/// directory at the same path collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Path,
    User,
    Group,
    Driver,
    Service,
}

/// Identity of an installed object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey {
    pub namespace: Namespace,
    pub id: String,
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace {
            Namespace::Path => write!(f, "{}", self.id),
            ns => write!(f, "{} {}", ns, self.id),
        }
    }
}

/// File overlay permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Overlay {
    /// This file may be replaced by another package's overlaying file
    Allow,
    /// This file replaces another package's overlay-allowed file
    True,
}

/// Follow-up work triggered when an action is applied
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Actuator {
    Restart(String),
    Refresh(String),
    RebootNeeded,
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actuator::Restart(svc) => write!(f, "restart {}", svc),
            Actuator::Refresh(svc) => write!(f, "refresh {}", svc),
            Actuator::RebootNeeded => write!(f, "reboot needed"),
        }
    }
}

fn default_mode() -> u32 {
    0o644
}

fn default_dir_mode() -> u32 {
    0o755
}

fn root() -> String {
    "root".to_string()
}

/// One content action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContentAction {
    Dir {
        path: String,
        #[serde(default = "default_dir_mode")]
        mode: u32,
        #[serde(default = "root")]
        owner: String,
        #[serde(default = "root")]
        group: String,
    },
    File {
        path: String,
        /// Payload digest as published
        hash: String,
        #[serde(default = "default_mode")]
        mode: u32,
        #[serde(default = "root")]
        owner: String,
        #[serde(default = "root")]
        group: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overlay: Option<Overlay>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        actuators: Vec<Actuator>,
    },
    Link {
        path: String,
        target: String,
    },
    Hardlink {
        path: String,
        target: String,
    },
    User {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
    Group {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gid: Option<u32>,
    },
    Driver {
        name: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        aliases: Vec<String>,
    },
    Service {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        manifest: Option<String>,
    },
}

impl ContentAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            ContentAction::Dir { .. } => ActionKind::Dir,
            ContentAction::File { .. } => ActionKind::File,
            ContentAction::Link { .. } => ActionKind::Link,
            ContentAction::Hardlink { .. } => ActionKind::Hardlink,
            ContentAction::User { .. } => ActionKind::User,
            ContentAction::Group { .. } => ActionKind::Group,
            ContentAction::Driver { .. } => ActionKind::Driver,
            ContentAction::Service { .. } => ActionKind::Service,
        }
    }

    pub fn key(&self) -> ActionKey {
        let (namespace, id) = match self {
            ContentAction::Dir { path, .. }
            | ContentAction::File { path, .. }
            | ContentAction::Link { path, .. }
            | ContentAction::Hardlink { path, .. } => (Namespace::Path, normalize(path)),
            ContentAction::User { name, .. } => (Namespace::User, name.clone()),
            ContentAction::Group { name, .. } => (Namespace::Group, name.clone()),
            ContentAction::Driver { name, .. } => (Namespace::Driver, name.clone()),
            ContentAction::Service { name, .. } => (Namespace::Service, name.clone()),
        };
        ActionKey { namespace, id }
    }

    /// Image-relative path for path actions
    pub fn path(&self) -> Option<String> {
        let key = self.key();
        (key.namespace == Namespace::Path).then_some(key.id)
    }

    /// Path a link points at, resolved against the image root
    pub fn link_target(&self) -> Option<String> {
        match self {
            ContentAction::Link { path, target } => {
                if let Some(abs) = target.strip_prefix('/') {
                    Some(normalize(abs))
                } else {
                    let parent = normalize(path)
                        .rsplit_once('/')
                        .map(|(p, _)| p.to_string())
                        .unwrap_or_default();
                    Some(normalize(&format!("{}/{}", parent, target)))
                }
            }
            ContentAction::Hardlink { target, .. } => Some(normalize(target)),
            _ => None,
        }
    }

    /// User and group names this action needs to exist first
    pub fn principals(&self) -> Vec<(Namespace, &str)> {
        match self {
            ContentAction::Dir { owner, group, .. } | ContentAction::File { owner, group, .. } => {
                vec![(Namespace::User, owner.as_str()), (Namespace::Group, group.as_str())]
            }
            ContentAction::User {
                group: Some(group), ..
            } => vec![(Namespace::Group, group.as_str())],
            _ => Vec::new(),
        }
    }

    pub fn overlay(&self) -> Option<Overlay> {
        match self {
            ContentAction::File { overlay, .. } => *overlay,
            _ => None,
        }
    }

    pub fn actuators(&self) -> &[Actuator] {
        match self {
            ContentAction::File { actuators, .. } => actuators,
            _ => &[],
        }
    }

    /// Attributes that determine on-disk state, in a fixed order
    fn attributes(&self) -> Vec<(&'static str, String)> {
        let mut attrs = vec![("kind", self.kind().to_string()), ("key", self.key().id)];
        match self {
            ContentAction::Dir {
                mode, owner, group, ..
            } => {
                attrs.push(("mode", format!("{:o}", mode)));
                attrs.push(("owner", owner.clone()));
                attrs.push(("group", group.clone()));
            }
            ContentAction::File {
                hash,
                mode,
                owner,
                group,
                ..
            } => {
                attrs.push(("hash", hash.clone()));
                attrs.push(("mode", format!("{:o}", mode)));
                attrs.push(("owner", owner.clone()));
                attrs.push(("group", group.clone()));
            }
            ContentAction::Link { target, .. } | ContentAction::Hardlink { target, .. } => {
                attrs.push(("target", target.clone()));
            }
            ContentAction::User { uid, group, .. } => {
                attrs.push(("uid", uid.map(|u| u.to_string()).unwrap_or_default()));
                attrs.push(("group", group.clone().unwrap_or_default()));
            }
            ContentAction::Group { gid, .. } => {
                attrs.push(("gid", gid.map(|g| g.to_string()).unwrap_or_default()));
            }
            ContentAction::Driver { aliases, .. } => {
                attrs.push(("aliases", aliases.join(",")));
            }
            ContentAction::Service { manifest, .. } => {
                attrs.push(("manifest", manifest.clone().unwrap_or_default()));
            }
        }
        attrs
    }

    pub fn fingerprint(&self, algorithm: HashAlgorithm) -> Fingerprint {
        let mut hasher = Hasher::new(algorithm);
        for (name, value) in self.attributes() {
            hasher.field(name, &value);
        }
        hasher.finalize()
    }
}

impl fmt::Display for ContentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.key().id)
    }
}

/// Strip leading/trailing slashes and `.`/`..` segments
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Ancestor directories of a normalized path, nearest first
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').rev().map(move |(i, _)| &path[..i])
}

/// Mediator control for a link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediatorTag {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
}

/// Applicability tags carried alongside an action
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionTags {
    /// Variant name → value this action applies to
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variants: BTreeMap<String, String>,
    /// Facets that must be enabled for this action to be installed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mediator: Option<MediatorTag>,
    /// Keys of actions that must be applied before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

/// A manifest line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestAction {
    pub action: ContentAction,
    #[serde(default)]
    pub tags: ActionTags,
}

impl ManifestAction {
    pub fn new(action: ContentAction) -> Self {
        Self {
            action,
            tags: ActionTags::default(),
        }
    }

    pub fn with_facet(mut self, facet: &str) -> Self {
        self.tags.facets.push(facet.to_string());
        self
    }

    pub fn with_variant(mut self, name: &str, value: &str) -> Self {
        self.tags.variants.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_mediator(mut self, tag: MediatorTag) -> Self {
        self.tags.mediator = Some(tag);
        self
    }

    pub fn after(mut self, key: &str) -> Self {
        self.tags.after.push(key.to_string());
        self
    }

    /// True if this action is delivered by `owner` under `config`
    pub fn applies(
        &self,
        owner: &Fmri,
        config: &ImageConfig,
        mediators: &BTreeMap<String, MediatorChoice>,
    ) -> bool {
        let variants_ok = self
            .tags
            .variants
            .iter()
            .all(|(name, value)| config.variant(name).is_none_or(|active| active == value));
        let facets_ok = self.tags.facets.iter().all(|f| config.facet_enabled(f));
        let mediator_ok = self.tags.mediator.as_ref().is_none_or(|tag| {
            mediators.get(&tag.name).is_some_and(|choice| {
                &choice.provider == owner
                    && tag
                        .version
                        .as_ref()
                        .is_none_or(|v| choice.version.as_ref() == Some(v))
                    && tag
                        .implementation
                        .as_ref()
                        .is_none_or(|i| choice.implementation.as_ref() == Some(i))
            })
        });
        variants_ok && facets_ok && mediator_ok
    }
}

/// Supplies the action list of a package version (external collaborator)
pub trait ManifestSource: Send + Sync {
    fn manifest(&self, fmri: &Fmri) -> Result<Vec<ManifestAction>>;
}

/// One manifest record in a JSON-lines manifest file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestRecord {
    fmri: Fmri,
    actions: Vec<ManifestAction>,
}

/// Manifests held in memory, keyed by FMRI
#[derive(Debug, Clone, Default)]
pub struct MemoryManifests {
    manifests: BTreeMap<Fmri, Vec<ManifestAction>>,
}

impl MemoryManifests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fmri: Fmri, actions: Vec<ManifestAction>) {
        self.manifests.insert(fmri, actions);
    }

    /// Load `{"fmri": ..., "actions": [...]}` records, one per line
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::TransportFailure {
            what: format!("manifests {}", path.display()),
            reason: e.to_string(),
        })?;
        let mut manifests = Self::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record: ManifestRecord = serde_json::from_str(line)?;
            manifests.insert(record.fmri, record.actions);
        }
        Ok(manifests)
    }
}

impl ManifestSource for MemoryManifests {
    fn manifest(&self, fmri: &Fmri) -> Result<Vec<ManifestAction>> {
        if let Some(actions) = self.manifests.get(fmri) {
            return Ok(actions.clone());
        }
        // a manifest recorded without publisher serves every publisher
        self.manifests
            .iter()
            .find(|(f, _)| f.publisher.is_none() && f.name == fmri.name && f.version == fmri.version)
            .map(|(_, actions)| actions.clone())
            .ok_or_else(|| Error::TransportFailure {
                what: format!("manifest {}", fmri),
                reason: "not available from any source".to_string(),
            })
    }
}

/// Retrieves payload for an action before execution (external collaborator)
pub trait ContentFetcher: Send + Sync {
    fn fetch(&self, owner: &Fmri, action: &ContentAction) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, hash: &str) -> ContentAction {
        ContentAction::File {
            path: path.to_string(),
            hash: hash.to_string(),
            mode: 0o644,
            owner: "root".to_string(),
            group: "bin".to_string(),
            overlay: None,
            actuators: Vec::new(),
        }
    }

    #[test]
    fn test_normalize_and_ancestors() {
        assert_eq!(normalize("/usr/./bin//ls/"), "usr/bin/ls");
        assert_eq!(normalize("usr/lib/../bin"), "usr/bin");
        let anc: Vec<&str> = ancestors("usr/share/doc").collect();
        assert_eq!(anc, vec!["usr/share", "usr"]);
    }

    #[test]
    fn test_link_target_resolution() {
        let rel = ContentAction::Link {
            path: "usr/bin/python".to_string(),
            target: "python3.11".to_string(),
        };
        assert_eq!(rel.link_target().as_deref(), Some("usr/bin/python3.11"));

        let up = ContentAction::Link {
            path: "usr/lib/libfoo.so".to_string(),
            target: "../../opt/foo/libfoo.so".to_string(),
        };
        assert_eq!(up.link_target().as_deref(), Some("opt/foo/libfoo.so"));

        let abs = ContentAction::Link {
            path: "etc/localtime".to_string(),
            target: "/usr/share/zoneinfo/UTC".to_string(),
        };
        assert_eq!(abs.link_target().as_deref(), Some("usr/share/zoneinfo/UTC"));
    }

    #[test]
    fn test_fingerprint_tracks_attributes() {
        let a = file("etc/motd", "abc");
        let b = file("/etc/motd", "abc");
        let c = file("etc/motd", "abd");
        assert_eq!(
            a.fingerprint(HashAlgorithm::Sha256),
            b.fingerprint(HashAlgorithm::Sha256)
        );
        assert_ne!(
            a.fingerprint(HashAlgorithm::Sha256),
            c.fingerprint(HashAlgorithm::Sha256)
        );
    }

    #[test]
    fn test_manifest_json() {
        let json = r#"{"action": {"kind": "file", "path": "etc/motd", "hash": "abc", "overlay": "allow",
            "actuators": [{"restart": "svc:/system/motd"}, "reboot-needed"]},
            "tags": {"facets": ["facet.doc"]}}"#;
        let action: ManifestAction = serde_json::from_str(json).unwrap();
        assert_eq!(action.action.kind(), ActionKind::File);
        assert_eq!(action.action.overlay(), Some(Overlay::Allow));
        assert_eq!(action.action.actuators().len(), 2);
        assert_eq!(action.tags.facets, vec!["facet.doc".to_string()]);
    }

    #[test]
    fn test_applies_filters_tags() {
        let owner = Fmri::parse("pkg://test/a@1.0").unwrap();
        let mut config = ImageConfig::default();
        config.set_facet("facet.doc", Some(false)).unwrap();
        config.set_variant("variant.arch", "i386").unwrap();
        let none = BTreeMap::new();

        let doc = ManifestAction::new(file("usr/share/doc/a", "1")).with_facet("facet.doc");
        assert!(!doc.applies(&owner, &config, &none));

        let sparc = ManifestAction::new(file("kernel/a", "1")).with_variant("variant.arch", "sparc");
        assert!(!sparc.applies(&owner, &config, &none));

        let x86 = ManifestAction::new(file("kernel/a", "1")).with_variant("variant.arch", "i386");
        assert!(x86.applies(&owner, &config, &none));

        let link = ManifestAction::new(ContentAction::Link {
            path: "usr/bin/python".to_string(),
            target: "python3.9".to_string(),
        })
        .with_mediator(MediatorTag {
            name: "python".to_string(),
            version: None,
            implementation: None,
        });
        assert!(!link.applies(&owner, &config, &none));

        let mut chosen = BTreeMap::new();
        chosen.insert(
            "python".to_string(),
            MediatorChoice {
                version: None,
                implementation: None,
                provider: owner.clone(),
            },
        );
        assert!(link.applies(&owner, &config, &chosen));
    }

    #[test]
    fn test_memory_manifests_missing() {
        let manifests = MemoryManifests::new();
        let fmri = Fmri::parse("pkg://test/a@1.0").unwrap();
        let err = manifests.manifest(&fmri).unwrap_err();
        assert!(err.is_retryable());
    }
}
