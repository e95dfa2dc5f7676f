// src/fmri/range.rs

//! Version range expressions
//!
//! Ranges are what dependency actions and request patterns compare candidate
//! versions against. A range is one clause (`>=1.0`, `<2`, `@5.11`) or a
//! comma-joined conjunction of clauses (`>=1.0, <2.0`). Because a version may
//! itself contain a comma (the build separator), a comma only starts a new
//! clause when the text after it begins with an operator.

use super::version::Version;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator applied to a bare version with no explicit operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultOp {
    /// `=V`
    Exact,
    /// `>=V`
    AtLeast,
    /// `@V`
    Prefix,
}

/// A constraint on package versions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionRange {
    /// Any version satisfies
    Any,
    /// Exact version match
    Exact(Version),
    /// Greater than
    GreaterThan(Version),
    /// Greater than or equal
    GreaterOrEqual(Version),
    /// Less than
    LessThan(Version),
    /// Less than or equal
    LessOrEqual(Version),
    /// Not equal
    NotEqual(Version),
    /// Every component named by the version must match
    Prefix(Version),
    /// All clauses must be satisfied (`>=1.0, <2.0`)
    And(Vec<VersionRange>),
}

impl VersionRange {
    /// Parse a range where a bare version means an exact match
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_with_default(s, DefaultOp::Exact)
    }

    /// Parse a range, applying `default` to clauses that carry no operator
    ///
    /// Examples:
    /// - ">= 1.2" → GreaterOrEqual(1.2)
    /// - ">=1.0, <2.0" → And([GreaterOrEqual(1.0), LessThan(2.0)])
    /// - "@5.11" → Prefix(5.11)
    /// - "1.0,5.11" with `DefaultOp::AtLeast` → GreaterOrEqual(1.0,5.11)
    pub fn parse_with_default(s: &str, default: DefaultOp) -> Result<Self> {
        let s = s.trim();

        if s.is_empty() || s == "*" {
            return Ok(VersionRange::Any);
        }

        let clauses = split_clauses(s);
        if clauses.len() == 1 {
            return Self::parse_clause(&clauses[0], default, s);
        }

        let parsed = clauses
            .iter()
            .map(|c| Self::parse_clause(c, default, s))
            .collect::<Result<Vec<_>>>()?;
        Ok(VersionRange::And(parsed))
    }

    fn parse_clause(clause: &str, default: DefaultOp, whole: &str) -> Result<Self> {
        let invalid = |e: Error| Error::InvalidRange {
            range: whole.to_string(),
            reason: e.to_string(),
        };
        let version = |rest: &str| Version::parse(rest.trim()).map_err(invalid);

        let clause = clause.trim();
        if clause == "*" {
            return Err(Error::InvalidRange {
                range: whole.to_string(),
                reason: "'*' cannot be combined with other clauses".to_string(),
            });
        }

        if let Some(rest) = clause.strip_prefix(">=") {
            Ok(VersionRange::GreaterOrEqual(version(rest)?))
        } else if let Some(rest) = clause.strip_prefix("<=") {
            Ok(VersionRange::LessOrEqual(version(rest)?))
        } else if let Some(rest) = clause.strip_prefix("!=") {
            Ok(VersionRange::NotEqual(version(rest)?))
        } else if let Some(rest) = clause.strip_prefix('>') {
            Ok(VersionRange::GreaterThan(version(rest)?))
        } else if let Some(rest) = clause.strip_prefix('<') {
            Ok(VersionRange::LessThan(version(rest)?))
        } else if let Some(rest) = clause.strip_prefix('=') {
            Ok(VersionRange::Exact(version(rest)?))
        } else if let Some(rest) = clause.strip_prefix('@') {
            Ok(VersionRange::Prefix(version(rest)?))
        } else {
            let v = version(clause)?;
            Ok(match default {
                DefaultOp::Exact => VersionRange::Exact(v),
                DefaultOp::AtLeast => VersionRange::GreaterOrEqual(v),
                DefaultOp::Prefix => VersionRange::Prefix(v),
            })
        }
    }

    /// Check if a version satisfies this range
    pub fn satisfies(&self, version: &Version) -> bool {
        match self {
            VersionRange::Any => true,
            VersionRange::Exact(v) => version == v,
            VersionRange::GreaterThan(v) => version > v,
            VersionRange::GreaterOrEqual(v) => version >= v,
            VersionRange::LessThan(v) => version < v,
            VersionRange::LessOrEqual(v) => version <= v,
            VersionRange::NotEqual(v) => version != v,
            VersionRange::Prefix(v) => version.matches_prefix(v),
            VersionRange::And(clauses) => clauses.iter().all(|c| c.satisfies(version)),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, VersionRange::Any)
    }
}

/// Split on commas that begin a new operator clause
fn split_clauses(s: &str) -> Vec<String> {
    let mut clauses: Vec<String> = Vec::new();
    for piece in s.split(',') {
        let starts_clause = piece
            .trim_start()
            .starts_with(['<', '>', '=', '!', '@', '*']);
        match clauses.last_mut() {
            Some(last) if !starts_clause => {
                last.push(',');
                last.push_str(piece.trim());
            }
            _ => clauses.push(piece.trim().to_string()),
        }
    }
    clauses
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRange::Any => write!(f, "*"),
            VersionRange::Exact(v) => write!(f, "={}", v),
            VersionRange::GreaterThan(v) => write!(f, ">{}", v),
            VersionRange::GreaterOrEqual(v) => write!(f, ">={}", v),
            VersionRange::LessThan(v) => write!(f, "<{}", v),
            VersionRange::LessOrEqual(v) => write!(f, "<={}", v),
            VersionRange::NotEqual(v) => write!(f, "!={}", v),
            VersionRange::Prefix(v) => write!(f, "@{}", v),
            VersionRange::And(clauses) => {
                for (i, c) in clauses.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", c)?;
                }
                Ok(())
            }
        }
    }
}

impl TryFrom<String> for VersionRange {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<VersionRange> for String {
    fn from(r: VersionRange) -> Self {
        r.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_operators() {
        assert_eq!(
            VersionRange::parse(">= 1.2").unwrap(),
            VersionRange::GreaterOrEqual(v("1.2"))
        );
        assert_eq!(
            VersionRange::parse("<2").unwrap(),
            VersionRange::LessThan(v("2"))
        );
        assert_eq!(
            VersionRange::parse("@5.11").unwrap(),
            VersionRange::Prefix(v("5.11"))
        );
        assert_eq!(VersionRange::parse("*").unwrap(), VersionRange::Any);
        assert_eq!(VersionRange::parse("").unwrap(), VersionRange::Any);
    }

    #[test]
    fn test_bare_version_uses_default() {
        let r = VersionRange::parse_with_default("1.0", DefaultOp::AtLeast).unwrap();
        assert!(r.satisfies(&v("2.0")));
        assert!(!r.satisfies(&v("0.9")));

        let r = VersionRange::parse("1.0").unwrap();
        assert!(r.satisfies(&v("1.0")));
        assert!(!r.satisfies(&v("1.0.1")));

        let r = VersionRange::parse_with_default("1.0", DefaultOp::Prefix).unwrap();
        assert!(r.satisfies(&v("1.0.1")));
        assert!(!r.satisfies(&v("1.1")));
    }

    #[test]
    fn test_open_interval() {
        let r = VersionRange::parse(">1.0, <2.0").unwrap();
        assert!(r.satisfies(&v("1.5")));
        assert!(!r.satisfies(&v("1.0")));
        assert!(!r.satisfies(&v("2.0")));
    }

    #[test]
    fn test_build_comma_is_not_a_clause() {
        let r = VersionRange::parse(">=1.0,5.11, <2.0").unwrap();
        match &r {
            VersionRange::And(clauses) => {
                assert_eq!(clauses.len(), 2);
                assert_eq!(clauses[0], VersionRange::GreaterOrEqual(v("1.0,5.11")));
            }
            other => panic!("expected conjunction, got {:?}", other),
        }
        assert!(r.satisfies(&v("1.0,5.12")));
        assert!(!r.satisfies(&v("1.0")));
    }

    #[test]
    fn test_display_reparses() {
        let r = VersionRange::parse(">=1.0, !=1.5, <=2").unwrap();
        assert_eq!(r.to_string(), ">=1.0, !=1.5, <=2");
        assert_eq!(VersionRange::parse(&r.to_string()).unwrap(), r);
    }

    #[test]
    fn test_invalid_range() {
        let err = VersionRange::parse(">=abc..1").unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));
        assert!(VersionRange::parse(">=1, *").is_err());
    }
}
