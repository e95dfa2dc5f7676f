// src/fmri/version.rs

//! Package version tuples
//!
//! A version has the form `release[,build][-branch][:timestamp]`, for example
//! `5.12.1,5.11-0.175.3:20240101T120000Z`. Release, build and branch are dot
//! sequences; each segment is either numeric (compared numerically) or
//! alphabetic (compared lexicographically). At the same position a numeric
//! segment sorts before an alphabetic one, and a shorter sequence sorts before
//! any longer sequence it prefixes. Absent components sort before present ones.

use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// One component of a dot sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Numeric(u64),
    Alpha(String),
}

impl Segment {
    fn parse(s: &str) -> std::result::Result<Self, String> {
        if s.is_empty() {
            return Err("empty version segment".to_string());
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            if s.len() > 1 && s.starts_with('0') {
                return Err(format!("segment '{}' has a leading zero", s));
            }
            return s
                .parse::<u64>()
                .map(Segment::Numeric)
                .map_err(|e| format!("segment '{}': {}", s, e));
        }

        if s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            Ok(Segment::Alpha(s.to_string()))
        } else {
            Err(format!("segment '{}' contains invalid characters", s))
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Numeric(n) => write!(f, "{}", n),
            Segment::Alpha(s) => write!(f, "{}", s),
        }
    }
}

/// A dot-separated sequence of segments (`5.11`, `0.175.3`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DotSequence(Vec<Segment>);

impl DotSequence {
    /// Parse a dot sequence, rejecting empty segments
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        if s.is_empty() {
            return Err("empty dot sequence".to_string());
        }
        let segments = s
            .split('.')
            .map(Segment::parse)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self(segments))
    }

    /// Segments of this sequence
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// True if `prefix` is a leading part of this sequence
    pub fn starts_with(&self, prefix: &DotSequence) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for DotSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

/// A package version: (release, build, branch, timestamp)
///
/// Field order matters: the derived `Ord` compares release first, then build,
/// branch and timestamp, with `None` before `Some`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub release: DotSequence,
    pub build: Option<DotSequence>,
    pub branch: Option<DotSequence>,
    pub timestamp: Option<NaiveDateTime>,
}

impl Version {
    /// Parse a version string
    ///
    /// Examples:
    /// - "1.0" → release=1.0
    /// - "1.0,5.11" → release=1.0, build=5.11
    /// - "1.0,5.11-0.1" → ... branch=0.1
    /// - "1.0-0.1:20240101T000000Z" → release=1.0, branch=0.1, timestamp
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: String| Error::malformed(s, reason);

        let s_trim = s.trim();
        if s_trim.is_empty() {
            return Err(invalid("empty version".to_string()));
        }

        let (rest, timestamp) = match s_trim.split_once(':') {
            Some((rest, ts)) => {
                let parsed = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
                    .map_err(|e| invalid(format!("timestamp '{}': {}", ts, e)))?;
                (rest, Some(parsed))
            }
            None => (s_trim, None),
        };

        let (rest, branch) = match rest.split_once('-') {
            Some((rest, branch)) => (rest, Some(DotSequence::parse(branch).map_err(invalid)?)),
            None => (rest, None),
        };

        let (release, build) = match rest.split_once(',') {
            Some((release, build)) => (release, Some(DotSequence::parse(build).map_err(invalid)?)),
            None => (rest, None),
        };

        let release = DotSequence::parse(release).map_err(invalid)?;

        Ok(Self {
            release,
            build,
            branch,
            timestamp,
        })
    }

    /// Prefix ("auto") match used by incorporations, freezes and `name@ver` patterns
    ///
    /// Every component present in `pattern` must match. When the pattern only
    /// names a release, any release it prefixes matches (`1.2` matches `1.2.4`);
    /// once the pattern names a build, branch or timestamp, the release must be
    /// equal and the later components are prefix-matched.
    pub fn matches_prefix(&self, pattern: &Version) -> bool {
        let release_only =
            pattern.build.is_none() && pattern.branch.is_none() && pattern.timestamp.is_none();

        if release_only {
            return self.release.starts_with(&pattern.release);
        }

        if self.release != pattern.release {
            return false;
        }

        let seq_matches = |mine: &Option<DotSequence>, theirs: &Option<DotSequence>| match theirs {
            None => true,
            Some(p) => mine.as_ref().is_some_and(|m| m.starts_with(p)),
        };

        seq_matches(&self.build, &pattern.build)
            && seq_matches(&self.branch, &pattern.branch)
            && pattern.timestamp.is_none_or(|ts| self.timestamp == Some(ts))
    }

    /// True when this version is the same as or newer than `other`
    pub fn successor_of(&self, other: &Version) -> bool {
        self >= other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.release)?;
        if let Some(ref build) = self.build {
            write!(f, ",{}", build)?;
        }
        if let Some(ref branch) = self.branch {
            write!(f, "-{}", branch)?;
        }
        if let Some(ref ts) = self.timestamp {
            write!(f, ":{}", ts.format(TIMESTAMP_FORMAT))?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}
