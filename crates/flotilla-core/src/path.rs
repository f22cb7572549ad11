//! Hierarchical path identifiers for groups, apps, and pods.
//!
//! A `PathId` is a slash-separated absolute path (`/prod/web/api`). The
//! group tree, the repository keys, and every spec reference use these.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Absolute path naming a group, application, or pod.
///
/// Paths are ordered lexicographically by segment, so sibling entries sort
/// the way they render.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathId {
    segments: Vec<String>,
}

impl PathId {
    /// The root path `/`.
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Parse an absolute path. Relative input is rejected.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if !raw.starts_with('/') {
            return Err(ValidationError::RelativePath(raw.to_string()));
        }
        Self::from_segments(raw.split('/').filter(|s| !s.is_empty()))
    }

    fn from_segments<'a>(parts: impl Iterator<Item = &'a str>) -> Result<Self, ValidationError> {
        let mut segments = Vec::new();
        for part in parts {
            if !part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return Err(ValidationError::InvalidPathSegment(part.to_string()));
            }
            segments.push(part.to_string());
        }
        Ok(Self { segments })
    }

    /// Resolve a possibly-relative path against this one.
    pub fn canonicalize(&self, raw: &str) -> Result<Self, ValidationError> {
        if raw.starts_with('/') {
            return Self::parse(raw);
        }
        let mut segments = self.segments.clone();
        for part in raw.split('/').filter(|s| !s.is_empty()) {
            match part {
                "." => {}
                ".." => {
                    segments.pop();
                }
                other => {
                    let child = Self::from_segments(std::iter::once(other))?;
                    segments.extend(child.segments);
                }
            }
        }
        Ok(Self { segments })
    }

    /// Parent path; the root is its own parent.
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// Append a single segment.
    pub fn child(&self, segment: &str) -> Result<Self, ValidationError> {
        let mut out = self.clone();
        let tail = Self::from_segments(std::iter::once(segment))?;
        out.segments.extend(tail.segments);
        Ok(out)
    }

    /// Last segment, or empty for the root.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `self` is a strict or non-strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &PathId) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Encoding safe for embedding in task ids: segments joined with `_`.
    pub fn safe_id(&self) -> String {
        self.segments.join("_")
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl FromStr for PathId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PathId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PathId> for String {
    fn from(value: PathId) -> Self {
        value.to_string()
    }
}
