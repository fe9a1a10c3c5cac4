//! Package definitions and the references between them.
//!
//! A [`Package`] is identified by `(category, name, version)`. Dependency and
//! conflict edges are [`PackageRef`]s: plain identities resolved through a
//! package database whenever they are followed, never live pointers.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors parsing a `category/name[-version]` string.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PackageParseError {
    /// No `category/` prefix.
    #[error("missing category in '{0}', expected category/name[-version]")]
    MissingCategory(String),

    /// Nothing between the category and the version.
    #[error("empty package name in '{0}'")]
    EmptyName(String),
}

/// A reference to a package: `category/name`, optionally pinned to a version.
///
/// An empty `version` matches any version of the package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageRef {
    /// Category the package lives under, like `sys-libs`.
    pub category: String,
    /// Package name within its category.
    pub name: String,
    /// Exact version, or empty for any.
    #[serde(default)]
    pub version: String,
}

impl PackageRef {
    /// A reference pinned to `version`.
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// A reference matching any version of `category/name`.
    pub fn any(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(category, name, "")
    }

    /// Whether the reference leaves the version open.
    pub fn is_unversioned(&self) -> bool {
        self.version.is_empty()
    }

    /// `name-category-version`, the same key [`Package::fingerprint`] produces.
    pub fn fingerprint(&self) -> String {
        format!("{}-{}-{}", self.name, self.category, self.version)
    }

    /// Whether `package` is a version this reference accepts.
    pub fn matches(&self, package: &Package) -> bool {
        self.category == package.category
            && self.name == package.name
            && (self.version.is_empty() || self.version == package.version)
    }

    /// Same category and name, regardless of version.
    pub fn same_name(&self, package: &Package) -> bool {
        self.category == package.category && self.name == package.name
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}/{}", self.category, self.name)
        } else {
            write!(f, "{}/{}-{}", self.category, self.name, self.version)
        }
    }
}

impl FromStr for PackageRef {
    type Err = PackageParseError;

    /// Parses `category/name-version` or `category/name`.
    ///
    /// The version starts at the last `-` followed by a digit, so names may
    /// contain dashes themselves (`sys-libs/foo-bar-1.2`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (category, rest) = s
            .split_once('/')
            .filter(|(c, _)| !c.is_empty())
            .ok_or_else(|| PackageParseError::MissingCategory(s.to_string()))?;

        let split = rest
            .rmatch_indices('-')
            .map(|(idx, _)| idx)
            .find(|&idx| {
                rest[idx + 1..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit())
            });

        let (name, version) = match split {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };

        if name.is_empty() {
            return Err(PackageParseError::EmptyName(s.to_string()));
        }

        Ok(Self::new(category, name, version))
    }
}

/// A package definition as read from a tree or a repository index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Package name within its category.
    pub name: String,
    /// Category the package lives under.
    pub category: String,
    /// Version string, compared with [`compare_versions`].
    pub version: String,
    /// Packages that must be present for this one to build and run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<PackageRef>,
    /// Packages that must not be installed alongside this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<PackageRef>,
    /// One-line summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// SPDX license expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Directory the definition was loaded from. Not part of the identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Package {
    /// A package without requires, conflicts or location.
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            version: version.into(),
            requires: Vec::new(),
            conflicts: Vec::new(),
            description: None,
            license: None,
            path: None,
        }
    }

    /// Builder-style helper to add a runtime/build requirement.
    pub fn with_requires(mut self, requires: impl IntoIterator<Item = PackageRef>) -> Self {
        self.requires.extend(requires);
        self
    }

    /// Builder-style helper to add conflicting packages.
    pub fn with_conflicts(mut self, conflicts: impl IntoIterator<Item = PackageRef>) -> Self {
        self.conflicts.extend(conflicts);
        self
    }

    /// Record the directory the definition lives in.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Deterministic identity string: `name-category-version`.
    pub fn fingerprint(&self) -> String {
        format!("{}-{}-{}", self.name, self.category, self.version)
    }

    /// A reference pinned to exactly this package.
    pub fn to_ref(&self) -> PackageRef {
        PackageRef::new(&self.category, &self.name, &self.version)
    }

    /// Path of `file` inside the definition directory, if the package has one.
    pub fn rel(&self, file: &str) -> Option<PathBuf> {
        self.path.as_deref().map(|p| p.join(file))
    }

    /// The directory holding the definition and build sources.
    pub fn definition_dir(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Same package with the on-disk location stripped, as published in indexes.
    pub fn without_path(&self) -> Self {
        Self {
            path: None,
            ..self.clone()
        }
    }

    /// Whether this package declares a conflict with `other`.
    pub fn conflicts_with(&self, other: &Package) -> bool {
        self.conflicts.iter().any(|c| c.matches(other))
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.category, self.name, self.version)
    }
}

/// Order two version strings.
///
/// Semver is used when both sides parse (a missing minor or patch counts as
/// zero). Anything else falls back to comparing `.`/`-`/`_` separated
/// segments, numerically where both segments are numbers.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_lenient(a), parse_lenient(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => compare_segments(a, b),
    }
}

fn parse_lenient(version: &str) -> Option<semver::Version> {
    if let Ok(v) = semver::Version::parse(version) {
        return Some(v);
    }
    let padded = match version.split('.').count() {
        1 => format!("{version}.0.0"),
        2 => format!("{version}.0"),
        _ => return None,
    };
    semver::Version::parse(&padded).ok()
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let split = |s: &str| -> Vec<String> {
        s.split(['.', '-', '_'])
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };
    let (left, right) = (split(a), split(b));

    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}
