// src/catalog/feed.rs

//! Catalog source feeds
//!
//! A feed supplies raw package metadata for one publisher. Records are JSON
//! objects, one per line in a file feed:
//!
//! ```text
//! {"fmri": "pkg://test/web/app@1.0", "depends": [
//!     {"type": "require", "fmri": "lib/ssl@3.0"},
//!     {"type": "group", "fmri": ["web/nginx", "web/apache"]},
//!     {"type": "conditional", "fmri": "lib/sparc-extra", "predicate": "variant.arch=sparc"},
//!     {"type": "require", "fmri": "dev/headers", "facet": "facet.devel"}],
//!  "variants": {"variant.arch": ["i386", "sparc"]},
//!  "mediators": [{"mediator": "python", "version": "3.11"}]}
//! ```
//!
//! Conversion to typed entries happens in [`RawEntry::into_entry`]; a record
//! that fails conversion is reported to the caller and never aborts the load.

use super::CatalogEntry;
use super::dependency::{
    Dependency, DependencyDecl, DependencyKind, MediatorClaim, Predicate, Target,
};
use crate::error::{Error, Result};
use crate::fmri::{Fmri, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// One target or a list of alternatives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTargets {
    One(String),
    Many(Vec<String>),
}

impl RawTargets {
    fn as_slice(&self) -> Vec<&str> {
        match self {
            RawTargets::One(s) => vec![s.as_str()],
            RawTargets::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// A dependency record as it appears in a feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDepend {
    #[serde(rename = "type")]
    pub kind: String,
    pub fmri: RawTargets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet: Option<String>,
    #[serde(default, rename = "root-image", skip_serializing_if = "Option::is_none")]
    pub root_image: Option<bool>,
}

/// A mediator record as it appears in a feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMediator {
    pub mediator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
}

/// A package metadata record as supplied by a feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEntry {
    pub fmri: String,
    #[serde(default)]
    pub depends: Vec<RawDepend>,
    #[serde(default)]
    pub variants: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub mediators: Vec<RawMediator>,
    #[serde(default)]
    pub obsolete: bool,
}

impl RawEntry {
    /// Convert to a typed entry, assigning `publisher` when the FMRI has none
    pub fn into_entry(self, publisher: &str) -> Result<CatalogEntry> {
        let mut fmri = Fmri::parse(&self.fmri)?;
        if fmri.publisher.is_none() {
            fmri = fmri.with_publisher(publisher);
        }

        let dependencies = self
            .depends
            .iter()
            .map(convert_depend)
            .collect::<Result<Vec<_>>>()?;

        let variants = self
            .variants
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect::<BTreeSet<_>>()))
            .collect();

        let mediations = self
            .mediators
            .into_iter()
            .map(|m| {
                Ok(MediatorClaim {
                    mediator: m.mediator,
                    version: m.version.as_deref().map(Version::parse).transpose()?,
                    implementation: m.implementation,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CatalogEntry {
            fmri,
            dependencies,
            variants,
            mediations,
            obsolete: self.obsolete,
        })
    }
}

fn convert_depend(raw: &RawDepend) -> Result<DependencyDecl> {
    let kind = DependencyKind::from_str(&raw.kind)
        .map_err(|_| Error::InvalidOperation(format!("unknown dependency type '{}'", raw.kind)))?;

    let targets = raw.fmri.as_slice();
    let single = || -> Result<Target> {
        match targets.as_slice() {
            [one] => Target::parse(one, kind),
            _ => Err(Error::InvalidOperation(format!(
                "{} dependency takes exactly one target",
                kind
            ))),
        }
    };

    let dependency = match kind {
        DependencyKind::Require => Dependency::Require(single()?),
        DependencyKind::Optional => Dependency::Optional(single()?),
        DependencyKind::Incorporate => Dependency::Incorporate(single()?),
        DependencyKind::Group => {
            if targets.is_empty() {
                return Err(Error::InvalidOperation(
                    "group dependency has no alternatives".to_string(),
                ));
            }
            Dependency::Group(
                targets
                    .iter()
                    .map(|t| Target::parse(t, kind))
                    .collect::<Result<Vec<_>>>()?,
            )
        }
        DependencyKind::Conditional => {
            let predicate = raw.predicate.as_deref().ok_or_else(|| {
                Error::InvalidOperation("conditional dependency without predicate".to_string())
            })?;
            Dependency::Conditional {
                target: single()?,
                predicate: Predicate::from_str(predicate)?,
            }
        }
        DependencyKind::Origin => Dependency::Origin {
            target: single()?,
            root_image: raw.root_image.unwrap_or(false),
        },
        DependencyKind::Parent => Dependency::Parent(single()?),
    };

    Ok(DependencyDecl {
        dependency,
        facet: raw.facet.clone(),
    })
}

/// A source of raw catalog records for one publisher
pub trait CatalogFeed: Send + Sync {
    /// Publisher whose packages this feed supplies
    fn publisher(&self) -> &str;

    /// Fetch all records
    ///
    /// Each item is either a decoded record or a description of a record that
    /// could not be decoded. A whole-feed failure is a `TransportFailure`.
    fn entries(&self) -> Result<Vec<std::result::Result<RawEntry, String>>>;
}

/// A feed read from a JSON-lines file
pub struct FileFeed {
    publisher: String,
    path: PathBuf,
}

impl FileFeed {
    pub fn new(publisher: &str, path: impl AsRef<Path>) -> Self {
        Self {
            publisher: publisher.to_string(),
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl CatalogFeed for FileFeed {
    fn publisher(&self) -> &str {
        &self.publisher
    }

    fn entries(&self) -> Result<Vec<std::result::Result<RawEntry, String>>> {
        let content = fs::read_to_string(&self.path).map_err(|e| Error::TransportFailure {
            what: format!("catalog {}", self.path.display()),
            reason: e.to_string(),
        })?;

        debug!("Read catalog feed {}", self.path.display());

        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
            .map(|(i, line)| {
                serde_json::from_str::<RawEntry>(line)
                    .map_err(|e| format!("{}:{}: {}", self.path.display(), i + 1, e))
            })
            .collect())
    }
}

/// A feed held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryFeed {
    publisher: String,
    entries: Vec<RawEntry>,
}

impl MemoryFeed {
    pub fn new(publisher: &str) -> Self {
        Self {
            publisher: publisher.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: RawEntry) {
        self.entries.push(entry);
    }

    /// Parse and add one JSON record
    pub fn push_json(&mut self, json: &str) -> Result<()> {
        self.entries.push(serde_json::from_str(json)?);
        Ok(())
    }
}

impl CatalogFeed for MemoryFeed {
    fn publisher(&self) -> &str {
        &self.publisher
    }

    fn entries(&self) -> Result<Vec<std::result::Result<RawEntry, String>>> {
        Ok(self.entries.iter().cloned().map(Ok).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> RawEntry {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_into_entry_assigns_publisher() {
        let entry = raw(r#"{"fmri": "a@1.0"}"#).into_entry("test").unwrap();
        assert_eq!(entry.fmri.to_string(), "pkg://test/a@1.0");

        let entry = raw(r#"{"fmri": "pkg://other/a@1.0"}"#)
            .into_entry("test")
            .unwrap();
        assert_eq!(entry.fmri.publisher.as_deref(), Some("other"));
    }

    #[test]
    fn test_convert_all_kinds() {
        let entry = raw(
            r#"{"fmri": "a@1.0", "depends": [
                {"type": "require", "fmri": "b@1.0"},
                {"type": "optional", "fmri": "c@2"},
                {"type": "incorporate", "fmri": "d@3"},
                {"type": "group", "fmri": ["e", "f"]},
                {"type": "conditional", "fmri": "g", "predicate": "variant.arch=sparc"},
                {"type": "origin", "fmri": "h@1", "root-image": true},
                {"type": "parent", "fmri": "feature/package/dependency/self"},
                {"type": "require", "fmri": "i", "facet": "facet.devel"}
            ]}"#,
        )
        .into_entry("test")
        .unwrap();

        let kinds: Vec<DependencyKind> = entry
            .dependencies
            .iter()
            .map(|d| d.dependency.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                DependencyKind::Require,
                DependencyKind::Optional,
                DependencyKind::Incorporate,
                DependencyKind::Group,
                DependencyKind::Conditional,
                DependencyKind::Origin,
                DependencyKind::Parent,
                DependencyKind::Require,
            ]
        );
        assert_eq!(entry.dependencies[7].facet.as_deref(), Some("facet.devel"));
        assert!(matches!(
            entry.dependencies[5].dependency,
            Dependency::Origin {
                root_image: true,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_kind_is_error() {
        let err = raw(r#"{"fmri": "a@1.0", "depends": [{"type": "suggests", "fmri": "b"}]}"#)
            .into_entry("test")
            .unwrap_err();
        assert!(err.to_string().contains("suggests"));
    }

    #[test]
    fn test_conditional_requires_predicate() {
        assert!(
            raw(r#"{"fmri": "a@1.0", "depends": [{"type": "conditional", "fmri": "b"}]}"#)
                .into_entry("test")
                .is_err()
        );
    }

    #[test]
    fn test_file_feed_reports_bad_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.jsonl");
        std::fs::write(
            &path,
            "{\"fmri\": \"a@1.0\"}\n\n# comment\nnot json\n{\"fmri\": \"b@1.0\"}\n",
        )
        .unwrap();

        let feed = FileFeed::new("test", &path);
        let entries = feed.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_ok());
        assert!(entries[1].as_ref().unwrap_err().contains(":4:"));
        assert!(entries[2].is_ok());
    }

    #[test]
    fn test_missing_file_is_transport_failure() {
        let feed = FileFeed::new("test", "/nonexistent/catalog.jsonl");
        assert!(matches!(
            feed.entries(),
            Err(Error::TransportFailure { .. })
        ));
    }
}
