// src/catalog/dependency.rs

//! Typed dependency actions
//!
//! Every dependency kind a catalog entry can declare is one variant of
//! [`Dependency`]; the solver matches on it exhaustively. Raw feed records are
//! converted here and an unknown kind is a load anomaly, never skipped silently.

use crate::error::{Error, Result};
use crate::fmri::{DefaultOp, PackageSpec, VersionRange};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Dependency target of a `parent` dependency meaning "this package itself"
pub const PARENT_SELF: &str = "feature/package/dependency/self";

/// Dependency kind as written in feed records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum DependencyKind {
    Require,
    Optional,
    Incorporate,
    Group,
    Conditional,
    Origin,
    Parent,
}

impl DependencyKind {
    /// Operator applied to `name@version` targets of this kind
    pub fn default_op(self) -> DefaultOp {
        match self {
            DependencyKind::Incorporate | DependencyKind::Parent => DefaultOp::Prefix,
            _ => DefaultOp::AtLeast,
        }
    }
}

/// A named package with a version range
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub range: VersionRange,
}

impl Target {
    pub fn parse(s: &str, kind: DependencyKind) -> Result<Self> {
        let s = s.trim();
        let stripped = s
            .strip_prefix("pkg://")
            .and_then(|r| r.split_once('/').map(|(_, rest)| rest))
            .or_else(|| s.strip_prefix("pkg:/"))
            .unwrap_or(s);

        let (name, range) = match stripped.split_once('@') {
            Some((name, range)) => (
                name,
                VersionRange::parse_with_default(range, kind.default_op())?,
            ),
            None => (stripped, VersionRange::Any),
        };

        // name validation is shared with request patterns
        let spec = PackageSpec::parse(name)?;
        Ok(Self {
            name: spec.name,
            range,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.range.is_any() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} {}", self.name, self.range)
        }
    }
}

/// Condition guarding a conditional dependency
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    /// `variant.<name>=<value>`
    Variant { name: String, value: String },
    /// `facet.<name>=true|false`
    Facet { name: String, enabled: bool },
    /// A package selected in the same solution
    Package(Target),
}

impl FromStr for Predicate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((key, value)) = s.split_once('=')
            && (key.starts_with("variant.") || key.starts_with("facet."))
        {
            if key.starts_with("variant.") {
                return Ok(Predicate::Variant {
                    name: key.to_string(),
                    value: value.to_string(),
                });
            }
            let enabled = match value {
                "true" => true,
                "false" => false,
                other => {
                    return Err(Error::InvalidOperation(format!(
                        "facet predicate '{}' must be true or false, got '{}'",
                        key, other
                    )));
                }
            };
            return Ok(Predicate::Facet {
                name: key.to_string(),
                enabled,
            });
        }
        Target::parse(s, DependencyKind::Conditional).map(Predicate::Package)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Variant { name, value } => write!(f, "{}={}", name, value),
            Predicate::Facet { name, enabled } => write!(f, "{}={}", name, enabled),
            Predicate::Package(t) => write!(f, "{}", t),
        }
    }
}

/// A dependency declared by a catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dependency {
    /// Target must be installed at a satisfying version
    Require(Target),
    /// If target is installed, it must satisfy the range
    Optional(Target),
    /// Pins the allowed range of another package without installing it
    Incorporate(Target),
    /// One of the alternatives must be installed; an installed one is kept
    Group(Vec<Target>),
    /// Require `target` when `predicate` holds
    Conditional { target: Target, predicate: Predicate },
    /// The image must already contain target before this operation
    Origin { target: Target, root_image: bool },
    /// The parent image must contain target ([`PARENT_SELF`] means this package)
    Parent(Target),
}

impl Dependency {
    pub fn kind(&self) -> DependencyKind {
        match self {
            Dependency::Require(_) => DependencyKind::Require,
            Dependency::Optional(_) => DependencyKind::Optional,
            Dependency::Incorporate(_) => DependencyKind::Incorporate,
            Dependency::Group(_) => DependencyKind::Group,
            Dependency::Conditional { .. } => DependencyKind::Conditional,
            Dependency::Origin { .. } => DependencyKind::Origin,
            Dependency::Parent(_) => DependencyKind::Parent,
        }
    }

    /// Names this dependency can pull into the solve
    pub fn target_names(&self) -> Vec<&str> {
        match self {
            Dependency::Require(t)
            | Dependency::Optional(t)
            | Dependency::Incorporate(t)
            | Dependency::Origin { target: t, .. } => vec![t.name.as_str()],
            Dependency::Group(alts) => alts.iter().map(|t| t.name.as_str()).collect(),
            Dependency::Conditional { target, predicate } => match predicate {
                Predicate::Package(p) => vec![target.name.as_str(), p.name.as_str()],
                _ => vec![target.name.as_str()],
            },
            Dependency::Parent(_) => Vec::new(),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Require(t) => write!(f, "requires {}", t),
            Dependency::Optional(t) => write!(f, "optionally requires {}", t),
            Dependency::Incorporate(t) => write!(f, "incorporates {}", t),
            Dependency::Group(alts) => {
                let names: Vec<String> = alts.iter().map(|t| t.to_string()).collect();
                write!(f, "requires one of [{}]", names.join(", "))
            }
            Dependency::Conditional { target, predicate } => {
                write!(f, "requires {} when {}", target, predicate)
            }
            Dependency::Origin { target, .. } => write!(f, "requires prior install of {}", target),
            Dependency::Parent(t) => write!(f, "requires {} in the parent image", t),
        }
    }
}

/// A dependency plus its optional facet gate
///
/// When the facet is disabled in the image, a gated dependency is treated as
/// optional: it still constrains the version if the target is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyDecl {
    pub dependency: Dependency,
    pub facet: Option<String>,
}

impl DependencyDecl {
    pub fn new(dependency: Dependency) -> Self {
        Self {
            dependency,
            facet: None,
        }
    }

    pub fn gated(dependency: Dependency, facet: &str) -> Self {
        Self {
            dependency,
            facet: Some(facet.to_string()),
        }
    }
}

/// A mediated capability claimed by a package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MediatorClaim {
    pub mediator: String,
    pub version: Option<crate::fmri::Version>,
    pub implementation: Option<String>,
}
