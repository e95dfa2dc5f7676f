// src/fmri/mod.rs

//! Package identity
//!
//! An FMRI names one package version from one publisher:
//!
//! - `pkg://publisher/name@version` (fully qualified)
//! - `pkg:/name@version` (publisher left to search order)
//! - `name@version`
//!
//! The package name is the identity key within one image; publisher and
//! version distinguish candidates for that name.

mod range;
mod version;

pub use range::{DefaultOp, VersionRange};
pub use version::{DotSequence, Segment, Version};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A fully versioned package identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fmri {
    pub publisher: Option<String>,
    pub name: String,
    pub version: Version,
}

impl Fmri {
    pub fn new(publisher: Option<&str>, name: &str, version: Version) -> Result<Self> {
        validate_name(name).map_err(|reason| Error::malformed(name, reason))?;
        if let Some(p) = publisher {
            validate_publisher(p).map_err(|reason| Error::malformed(name, reason))?;
        }
        Ok(Self {
            publisher: publisher.map(str::to_string),
            name: name.to_string(),
            version,
        })
    }

    /// Parse any accepted FMRI form; the version is mandatory
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (publisher, rest) = split_scheme(s).map_err(|reason| Error::malformed(s, reason))?;

        let (name, version) = match rest.split_once('@') {
            Some((name, version)) => (name, version),
            None => return Err(Error::malformed(s, "missing version")),
        };

        if name.is_empty() {
            return Err(Error::malformed(s, "missing package name"));
        }

        let version = Version::parse(version).map_err(|e| match e {
            Error::MalformedFmri { reason, .. } => Error::malformed(s, reason),
            other => other,
        })?;

        Self::new(publisher, name, version).map_err(|e| match e {
            Error::MalformedFmri { reason, .. } => Error::malformed(s, reason),
            other => other,
        })
    }

    /// True if this is the same package at the same or a newer version
    pub fn successor_of(&self, other: &Fmri) -> bool {
        self.name == other.name && self.version.successor_of(&other.version)
    }

    /// Copy of this FMRI with the publisher set
    pub fn with_publisher(&self, publisher: &str) -> Self {
        Self {
            publisher: Some(publisher.to_string()),
            ..self.clone()
        }
    }

    /// `name@version` without scheme or publisher
    pub fn short(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl Ord for Fmri {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.publisher.cmp(&other.publisher))
    }
}

impl PartialOrd for Fmri {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Fmri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.publisher {
            Some(ref p) => write!(f, "pkg://{}/{}@{}", p, self.name, self.version),
            None => write!(f, "pkg:/{}@{}", self.name, self.version),
        }
    }
}

impl FromStr for Fmri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fmri {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Fmri> for String {
    fn from(f: Fmri) -> Self {
        f.to_string()
    }
}

/// A request pattern: a package name with an optional publisher and range
///
/// Written as `[pkg:/|pkg://pub/]name[@range]`. A bare version after `@` is
/// a prefix match, so `web/server@2` selects any 2.x.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub publisher: Option<String>,
    pub name: String,
    pub range: VersionRange,
}

impl PackageSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (publisher, rest) = split_scheme(s).map_err(|reason| Error::malformed(s, reason))?;

        let (name, range) = match rest.split_once('@') {
            Some((name, range)) => (
                name,
                VersionRange::parse_with_default(range, DefaultOp::Prefix)?,
            ),
            None => (rest, VersionRange::Any),
        };

        validate_name(name).map_err(|reason| Error::malformed(s, reason))?;

        Ok(Self {
            publisher: publisher.map(str::to_string),
            name: name.to_string(),
            range,
        })
    }

    /// Pattern for any version of `name`
    pub fn name(name: &str) -> Self {
        Self {
            publisher: None,
            name: name.to_string(),
            range: VersionRange::Any,
        }
    }

    /// True when `fmri` is a package this pattern selects
    pub fn matches(&self, fmri: &Fmri) -> bool {
        self.name == fmri.name
            && self
                .publisher
                .as_ref()
                .is_none_or(|p| fmri.publisher.as_deref() == Some(p.as_str()))
            && self.range.satisfies(&fmri.version)
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref p) = self.publisher {
            write!(f, "pkg://{}/", p)?;
        }
        write!(f, "{}", self.name)?;
        match self.range {
            VersionRange::Any => {}
            VersionRange::Prefix(ref v) => write!(f, "@{}", v)?,
            ref other => write!(f, "@{}", other)?,
        }
        Ok(())
    }
}

impl FromStr for PackageSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Strip the `pkg:` scheme, returning the publisher (if any) and the remainder
fn split_scheme(s: &str) -> std::result::Result<(Option<&str>, &str), String> {
    if let Some(rest) = s.strip_prefix("pkg://") {
        let (publisher, rest) = rest
            .split_once('/')
            .ok_or_else(|| "missing package name after publisher".to_string())?;
        validate_publisher(publisher)?;
        Ok((Some(publisher), rest))
    } else if let Some(rest) = s.strip_prefix("pkg:/") {
        Ok((None, rest))
    } else {
        Ok((None, s))
    }
}

fn validate_publisher(p: &str) -> std::result::Result<(), String> {
    if p.is_empty() {
        return Err("empty publisher".to_string());
    }
    if !p
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!("invalid publisher '{}'", p));
    }
    Ok(())
}

fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("missing package name".to_string());
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(format!("invalid package name '{}'", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '+'))
    {
        return Err(format!("invalid characters in package name '{}'", name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let full = Fmri::parse("pkg://solaris/web/server@2.4,5.11-0.1").unwrap();
        assert_eq!(full.publisher.as_deref(), Some("solaris"));
        assert_eq!(full.name, "web/server");
        assert_eq!(full.version.to_string(), "2.4,5.11-0.1");

        let anon = Fmri::parse("pkg:/web/server@2.4").unwrap();
        assert_eq!(anon.publisher, None);

        let bare = Fmri::parse("web/server@2.4").unwrap();
        assert_eq!(bare, anon);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Fmri::parse("pkg:/@1.0"),
            Err(Error::MalformedFmri { .. })
        ));
        assert!(matches!(
            Fmri::parse("web/server"),
            Err(Error::MalformedFmri { .. })
        ));
        assert!(matches!(
            Fmri::parse("web/server@1..0"),
            Err(Error::MalformedFmri { .. })
        ));
        assert!(Fmri::parse("pkg://bad pub/x@1").is_err());
        assert!(Fmri::parse("pkg://pub").is_err());
    }

    #[test]
    fn test_canonical_display() {
        let f = Fmri::parse("  pkg://test/a@1.0 ").unwrap();
        assert_eq!(f.to_string(), "pkg://test/a@1.0");
        assert_eq!(Fmri::parse(&f.to_string()).unwrap(), f);
        assert_eq!(Fmri::parse("a@1.0").unwrap().to_string(), "pkg:/a@1.0");
    }

    #[test]
    fn test_ordering() {
        let a1 = Fmri::parse("pkg://z/a@1.0").unwrap();
        let a2 = Fmri::parse("pkg://a/a@2.0").unwrap();
        let b1 = Fmri::parse("pkg://a/b@0.1").unwrap();
        let mut list = vec![b1.clone(), a2.clone(), a1.clone()];
        list.sort();
        assert_eq!(list, vec![a1, a2, b1]);
    }

    #[test]
    fn test_successor_of() {
        let old = Fmri::parse("a@1.0").unwrap();
        let new = Fmri::parse("pkg://x/a@1.1").unwrap();
        let other = Fmri::parse("b@9").unwrap();
        assert!(new.successor_of(&old));
        assert!(old.successor_of(&old));
        assert!(!old.successor_of(&new));
        assert!(!other.successor_of(&old));
    }

    #[test]
    fn test_package_spec() {
        let spec = PackageSpec::parse("web/server@2").unwrap();
        assert!(spec.matches(&Fmri::parse("web/server@2.4").unwrap()));
        assert!(!spec.matches(&Fmri::parse("web/server@3.0").unwrap()));

        let spec = PackageSpec::parse("pkg://extra/tool").unwrap();
        assert!(spec.matches(&Fmri::parse("pkg://extra/tool@1").unwrap()));
        assert!(!spec.matches(&Fmri::parse("pkg://other/tool@1").unwrap()));

        assert_eq!(PackageSpec::parse("web/server@2").unwrap().to_string(), "web/server@2");
        let spec = PackageSpec::parse("tool@>=1.5").unwrap();
        assert!(spec.matches(&Fmri::parse("tool@2").unwrap()));
        assert_eq!(spec.to_string(), "tool@>=1.5");
    }
}
