//! Solver assertions and the operations the build pipeline performs on them.
//!
//! A solver result is a list of [`PackageAssert`]s: every package it
//! considered, tagged present (`true`) or absent (`false`). Requires edges are
//! followed against the list itself, so the list alone is enough to order,
//! cut and hash it.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::package::{Package, PackageRef, compare_versions};

/// Errors ordering an assertion list.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum OrderError {
    /// A requires edge leads back to the named package.
    #[error("dependency cycle detected at {0}")]
    Cycle(String),
}

/// Cache keys attached to an assertion once its dependency tree is computed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageHash {
    /// Hash of the ordered dependency set without the package itself.
    pub build_hash: String,
    /// Hash of the ordered dependency set including the package.
    pub package_hash: String,
}

/// One package the solver decided on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageAssert {
    /// The exact package version.
    pub package: Package,
    /// Present (`true`) or absent (`false`).
    pub value: bool,
    /// Cache keys, filled in by the compiler.
    #[serde(default)]
    pub hash: PackageHash,
}

impl PackageAssert {
    /// An assertion with empty hashes.
    pub fn new(package: Package, value: bool) -> Self {
        Self {
            package,
            value,
            hash: PackageHash::default(),
        }
    }

    /// Fingerprint of the asserted package.
    pub fn fingerprint(&self) -> String {
        self.package.fingerprint()
    }
}

impl fmt::Display for PackageAssert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.value { "+" } else { "-" };
        write!(f, "{mark}{}", self.package)
    }
}

/// An ordered list of assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackagesAssertions(Vec<PackageAssert>);

impl PackagesAssertions {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `assertion` at the end.
    pub fn push(&mut self, assertion: PackageAssert) {
        self.0.push(assertion);
    }

    /// Number of assertions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing was asserted.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Assertions in list order.
    pub fn iter(&self) -> std::slice::Iter<'_, PackageAssert> {
        self.0.iter()
    }

    /// Mutable access in list order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, PackageAssert> {
        self.0.iter_mut()
    }

    /// The assertions as a slice.
    pub fn as_slice(&self) -> &[PackageAssert] {
        &self.0
    }

    /// The assertion for the package with this fingerprint.
    pub fn search(&self, fingerprint: &str) -> Option<&PackageAssert> {
        self.0.iter().find(|a| a.fingerprint() == fingerprint)
    }

    /// Packages asserted present, in list order.
    pub fn to_install(&self) -> impl Iterator<Item = &Package> {
        self.0.iter().filter(|a| a.value).map(|a| &a.package)
    }

    /// Packages asserted absent, in list order.
    pub fn to_remove(&self) -> impl Iterator<Item = &Package> {
        self.0.iter().filter(|a| !a.value).map(|a| &a.package)
    }

    /// Topologically order the assertions around `fingerprint`.
    ///
    /// Absent packages come first, untouched. Then the requires closure of
    /// the anchor in depth-first post-order (requires walked in declared
    /// order), then any other present package in its current position, each
    /// preceded by whatever it requires.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::Cycle`] if the requires edges loop.
    pub fn order(&self, fingerprint: &str) -> Result<Self, OrderError> {
        let mut walk = Walk {
            list: &self.0,
            visiting: HashSet::new(),
            placed: HashSet::new(),
            out: Vec::with_capacity(self.0.len()),
        };

        for (idx, assertion) in self.0.iter().enumerate() {
            if !assertion.value {
                walk.placed.insert(idx);
                walk.out.push(assertion.clone());
            }
        }

        if let Some(root) = self.0.iter().position(|a| a.fingerprint() == fingerprint) {
            walk.visit(root)?;
        }

        for idx in 0..self.0.len() {
            walk.visit(idx)?;
        }

        Ok(Self(walk.out))
    }

    /// The same list without `package`.
    pub fn drop_package(&self, package: &Package) -> Self {
        let fingerprint = package.fingerprint();
        self.0
            .iter()
            .filter(|a| a.fingerprint() != fingerprint)
            .cloned()
            .collect()
    }

    /// Only `package` and what it transitively requires, order preserved.
    ///
    /// Empty if `package` is not present in the list.
    pub fn cut(&self, package: &Package) -> Self {
        let fingerprint = package.fingerprint();
        let Some(root) = self.0.iter().position(|a| a.fingerprint() == fingerprint) else {
            return Self::new();
        };

        let mut keep = HashSet::new();
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            if !keep.insert(idx) {
                continue;
            }
            for req in &self.0[idx].package.requires {
                if let Some(dep) = resolve(&self.0, req) {
                    stack.push(dep);
                }
            }
        }

        self.0
            .iter()
            .enumerate()
            .filter(|(idx, _)| keep.contains(idx))
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// Content hash of the ordered `(fingerprint, value)` sequence.
    pub fn assertion_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for assertion in &self.0 {
            hasher.update(assertion.fingerprint().as_bytes());
            let value = if assertion.value { ":true\n" } else { ":false\n" };
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Index of the present assertion satisfying `req`; the highest version wins
/// when the reference is unversioned.
fn resolve(list: &[PackageAssert], req: &PackageRef) -> Option<usize> {
    list.iter()
        .enumerate()
        .filter(|(_, a)| a.value && req.matches(&a.package))
        .max_by(|(_, a), (_, b)| compare_versions(&a.package.version, &b.package.version))
        .map(|(idx, _)| idx)
}

struct Walk<'a> {
    list: &'a [PackageAssert],
    visiting: HashSet<usize>,
    placed: HashSet<usize>,
    out: Vec<PackageAssert>,
}

impl Walk<'_> {
    fn visit(&mut self, idx: usize) -> Result<(), OrderError> {
        if self.placed.contains(&idx) {
            return Ok(());
        }
        if !self.visiting.insert(idx) {
            return Err(OrderError::Cycle(self.list[idx].fingerprint()));
        }

        for req in &self.list[idx].package.requires {
            if let Some(dep) = resolve(self.list, req) {
                self.visit(dep)?;
            }
        }

        self.visiting.remove(&idx);
        self.placed.insert(idx);
        self.out.push(self.list[idx].clone());
        Ok(())
    }
}

impl FromIterator<PackageAssert> for PackagesAssertions {
    fn from_iter<I: IntoIterator<Item = PackageAssert>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for PackagesAssertions {
    type Item = PackageAssert;
    type IntoIter = std::vec::IntoIter<PackageAssert>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a PackagesAssertions {
    type Item = &'a PackageAssert;
    type IntoIter = std::slice::Iter<'a, PackageAssert>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<Vec<PackageAssert>> for PackagesAssertions {
    fn from(v: Vec<PackageAssert>) -> Self {
        Self(v)
    }
}
