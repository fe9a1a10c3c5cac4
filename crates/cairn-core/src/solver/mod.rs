//! Dependency solver.
//!
//! Turns a set of requested packages into assertions over every package it
//! had to consider: what must be present, what must be absent. Requested
//! packages and everything they pull in are hard decisions and any
//! contradiction between them is an error. Packages already installed are
//! kept where they do not get in the way, and dropped where they do.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use cairn_schema::{Package, PackageAssert, PackageRef, PackagesAssertions, compare_versions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::database::{DbError, PackageDatabase};

/// Errors resolving a request.
#[derive(Error, Debug)]
pub enum SolverError {
    /// A requirement names a package no definition provides.
    #[error("no definition found for {package} (required by {required_by})")]
    MissingDefinition {
        /// The missing package.
        package: String,
        /// The package requiring it.
        required_by: String,
    },

    /// The same package was decided both present and absent.
    #[error("{package} is both required and excluded: {reason}")]
    Contradiction {
        /// The package.
        package: String,
        /// The decisions that clashed.
        reason: String,
    },

    /// A present package is left with a requirement nothing present matches.
    #[error("{package} requires {requirement}, which cannot be satisfied")]
    Unsatisfied {
        /// The requiring package.
        package: String,
        /// The requirement.
        requirement: String,
    },

    /// A package conflicts with another that must be present.
    #[error("{package} conflicts with {other}")]
    Conflict {
        /// The requested package.
        package: String,
        /// The package it conflicts with.
        other: String,
    },

    /// Removal of a package that is not installed.
    #[error("package {0} is not installed")]
    NotInstalled(String),

    /// Strategy name other than `strict` or `relaxed`.
    #[error("unknown solver strategy '{0}'")]
    UnknownStrategy(String),

    /// A database lookup failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// What to do when the request as a whole cannot be satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverStrategy {
    /// Fail.
    #[default]
    Strict,
    /// Install as much of the request as can be satisfied together.
    Relaxed,
}

impl fmt::Display for SolverStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Relaxed => write!(f, "relaxed"),
        }
    }
}

impl FromStr for SolverStrategy {
    type Err = SolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "relaxed" => Ok(Self::Relaxed),
            other => Err(SolverError::UnknownStrategy(other.to_string())),
        }
    }
}

/// How requests are solved; the `[solver]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// What to do when the request cannot be satisfied as a whole.
    pub strategy: SolverStrategy,
    /// Upper bound on re-solves the relaxed strategy may run.
    pub max_attempts: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            strategy: SolverStrategy::Strict,
            max_attempts: 9000,
        }
    }
}

/// Result of [`Solver::upgrade`].
#[derive(Debug, Clone, Default)]
pub struct Upgrade {
    /// Installed packages superseded by a newer definition.
    pub remove: Vec<Package>,
    /// Assertions for installing the replacements.
    pub install: PackagesAssertions,
}

impl Upgrade {
    /// True when nothing needs replacing.
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty()
    }
}

/// Resolves requests against package definitions and the installed world.
///
/// Definitions supply what can be installed; the installed database supplies
/// what is already there and is kept unless it gets in the way.
pub struct Solver {
    installed: Arc<dyn PackageDatabase>,
    definitions: Arc<dyn PackageDatabase>,
    options: SolverOptions,
}

impl fmt::Debug for Solver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Solver")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Solver {
    /// A solver over `installed` and `definitions`.
    pub fn new(
        installed: Arc<dyn PackageDatabase>,
        definitions: Arc<dyn PackageDatabase>,
        options: SolverOptions,
    ) -> Self {
        Self {
            installed,
            definitions,
            options,
        }
    }

    /// Options this solver was built with.
    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Solve for installing `requested` on top of the installed world.
    ///
    /// The result is in discovery order; use
    /// [`PackagesAssertions::order`] for a build or install order.
    ///
    /// # Errors
    ///
    /// Fails if a requested or required package has no definition, if the
    /// request contradicts itself, or (strict strategy) if any requested
    /// package cannot be satisfied.
    pub fn install(&self, requested: &[PackageRef]) -> Result<PackagesAssertions, SolverError> {
        match self.options.strategy {
            SolverStrategy::Strict => self.resolve(requested),
            SolverStrategy::Relaxed => self.resolve_relaxed(requested),
        }
    }

    /// Installed packages to remove for uninstalling `target`: everything
    /// installed that depends on it, outermost first, then `target` itself.
    ///
    /// # Errors
    ///
    /// Returns [`SolverError::NotInstalled`] if no installed package matches.
    pub fn uninstall(&self, target: &PackageRef) -> Result<Vec<Package>, SolverError> {
        let package = self
            .installed
            .get_package(target)?
            .ok_or_else(|| SolverError::NotInstalled(target.to_string()))?;

        let mut removal = self.installed.revdeps(&package)?;
        removal.reverse();
        removal.push(package);
        debug!("Uninstalling {target} removes {} package(s)", removal.len());
        Ok(removal)
    }

    /// Replace every installed package that has a newer definition.
    ///
    /// # Errors
    ///
    /// Propagates solver failures for the set of replacements.
    pub fn upgrade(&self) -> Result<Upgrade, SolverError> {
        let mut upgrade = Upgrade::default();
        let mut targets = Vec::new();

        for installed in self.installed.world()? {
            let newest = self
                .definitions
                .find_packages(&installed.category, &installed.name)?
                .into_iter()
                .max_by(|a, b| compare_versions(&a.version, &b.version));

            if let Some(newest) = newest {
                if compare_versions(&newest.version, &installed.version).is_gt() {
                    debug!("Upgrade available: {installed} -> {}", newest.version);
                    targets.push(newest.to_ref());
                    upgrade.remove.push(installed);
                }
            }
        }

        if !targets.is_empty() {
            upgrade.install = self.install(&targets)?;
        }
        Ok(upgrade)
    }

    fn resolve_relaxed(&self, requested: &[PackageRef]) -> Result<PackagesAssertions, SolverError> {
        let first_error = match self.resolve(requested) {
            Ok(solution) => return Ok(solution),
            Err(e) => e,
        };

        let mut admitted: Vec<PackageRef> = Vec::new();
        let mut attempts = 1;
        for reference in requested {
            if attempts >= self.options.max_attempts {
                warn!("Giving up after {attempts} attempts");
                break;
            }
            attempts += 1;

            let mut candidate = admitted.clone();
            candidate.push(reference.clone());
            match self.resolve(&candidate) {
                Ok(_) => admitted.push(reference.clone()),
                Err(e) => warn!("Skipping {reference}: {e}"),
            }
        }

        if admitted.is_empty() {
            return Err(first_error);
        }
        self.resolve(&admitted)
    }

    fn resolve(&self, requested: &[PackageRef]) -> Result<PackagesAssertions, SolverError> {
        debug!("Solving for {} requested package(s)", requested.len());
        let mut state = State::default();

        // Requested packages and their closure: hard decisions.
        let mut chosen = Vec::with_capacity(requested.len());
        for reference in requested {
            let package = self.definitions.get_package(reference)?.ok_or_else(|| {
                SolverError::MissingDefinition {
                    package: reference.to_string(),
                    required_by: "request".to_string(),
                }
            })?;
            chosen.push(package);
        }

        let mut queue = VecDeque::new();
        for package in &chosen {
            if state.assert_hard(package, true, "requested")? {
                queue.push_back(package.clone());
            }
        }

        // Upgrade in place: other installed versions of a requested package go.
        for package in &chosen {
            self.supersede(&mut state, package)?;
        }

        while let Some(package) = queue.pop_front() {
            for requirement in &package.requires {
                if state.satisfied(requirement) {
                    continue;
                }
                // An installed match satisfies the requirement as it is.
                let dep = match self.installed.get_package(requirement)? {
                    Some(installed) => installed,
                    None => self.definitions.get_package(requirement)?.ok_or_else(|| {
                        SolverError::MissingDefinition {
                            package: requirement.to_string(),
                            required_by: package.to_string(),
                        }
                    })?,
                };
                if state.assert_hard(&dep, true, &format!("required by {package}"))? {
                    self.supersede(&mut state, &dep)?;
                    queue.push_back(dep);
                }
            }

            for conflict in &package.conflicts {
                for target in self.conflict_targets(conflict)? {
                    state.assert_hard(&target, false, &format!("conflicts with {package}"))?;
                }
            }
        }

        // Installed world: kept where it fits.
        let mut soft_queue = VecDeque::new();
        for installed in self.installed.world()? {
            if state.insert_soft(&installed) {
                soft_queue.push_back(installed);
            }
        }
        while let Some(package) = soft_queue.pop_front() {
            for requirement in &package.requires {
                if state.mentions(requirement) {
                    continue;
                }
                let dep = match self.installed.get_package(requirement)? {
                    Some(dep) => Some(dep),
                    None => self.definitions.get_package(requirement)?,
                };
                if let Some(dep) = dep {
                    if state.insert_soft(&dep) {
                        soft_queue.push_back(dep);
                    }
                }
            }
        }
        state.settle_soft();

        state.validate()?;
        Ok(state.into_assertions())
    }

    /// Assert absent every installed version of `package`'s name other than
    /// `package` itself.
    fn supersede(&self, state: &mut State, package: &Package) -> Result<(), SolverError> {
        for installed in self
            .installed
            .find_packages(&package.category, &package.name)?
        {
            if installed.version != package.version {
                state.assert_hard(&installed, false, &format!("replaced by {package}"))?;
            }
        }
        Ok(())
    }

    /// Every known package a conflict reference points at.
    fn conflict_targets(&self, conflict: &PackageRef) -> Result<Vec<Package>, SolverError> {
        let mut targets: Vec<Package> = Vec::new();
        let known = self
            .definitions
            .find_packages(&conflict.category, &conflict.name)?
            .into_iter()
            .chain(
                self.installed
                    .find_packages(&conflict.category, &conflict.name)?,
            );
        for package in known {
            if conflict.matches(&package)
                && !targets.iter().any(|t| t.fingerprint() == package.fingerprint())
            {
                targets.push(package);
            }
        }
        Ok(targets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strength {
    Hard,
    Soft,
}

#[derive(Debug)]
struct Decision {
    package: Package,
    value: bool,
    strength: Strength,
}

#[derive(Debug, Default)]
struct State {
    order: Vec<String>,
    decisions: HashMap<String, Decision>,
}

impl State {
    /// Returns whether the package became newly present.
    fn assert_hard(
        &mut self,
        package: &Package,
        value: bool,
        reason: &str,
    ) -> Result<bool, SolverError> {
        let fingerprint = package.fingerprint();
        match self.decisions.get_mut(&fingerprint) {
            Some(decision) if decision.value == value => {
                decision.strength = Strength::Hard;
                Ok(false)
            }
            Some(_) => Err(SolverError::Contradiction {
                package: package.to_string(),
                reason: reason.to_string(),
            }),
            None => {
                self.order.push(fingerprint.clone());
                self.decisions.insert(
                    fingerprint,
                    Decision {
                        package: package.clone(),
                        value,
                        strength: Strength::Hard,
                    },
                );
                Ok(value)
            }
        }
    }

    /// Tentatively keep `package`. Returns false if it was already decided.
    fn insert_soft(&mut self, package: &Package) -> bool {
        let fingerprint = package.fingerprint();
        if self.decisions.contains_key(&fingerprint) {
            return false;
        }
        self.order.push(fingerprint.clone());
        self.decisions.insert(
            fingerprint,
            Decision {
                package: package.clone(),
                value: true,
                strength: Strength::Soft,
            },
        );
        true
    }

    fn present(&self) -> impl Iterator<Item = &Package> {
        self.order
            .iter()
            .filter_map(|fp| self.decisions.get(fp))
            .filter(|d| d.value)
            .map(|d| &d.package)
    }

    fn satisfied(&self, requirement: &PackageRef) -> bool {
        self.present().any(|p| requirement.matches(p))
    }

    fn mentions(&self, requirement: &PackageRef) -> bool {
        self.decisions.values().any(|d| requirement.matches(&d.package))
    }

    /// Drop kept packages that need something absent or clash with
    /// something present, until nothing changes.
    fn settle_soft(&mut self) {
        loop {
            let mut dropped = None;
            for fingerprint in &self.order {
                let Some(decision) = self.decisions.get(fingerprint) else {
                    continue;
                };
                if decision.strength != Strength::Soft || !decision.value {
                    continue;
                }
                let package = &decision.package;
                let broken = package.requires.iter().any(|r| !self.satisfied(r));
                let clashing = self.present().any(|other| {
                    other.fingerprint() != *fingerprint
                        && (package.conflicts_with(other) || other.conflicts_with(package))
                });
                if broken || clashing {
                    dropped = Some(fingerprint.clone());
                    break;
                }
            }

            match dropped.and_then(|fp| self.decisions.get_mut(&fp)) {
                Some(decision) => {
                    debug!("Dropping installed {}", decision.package);
                    decision.value = false;
                }
                None => break,
            }
        }
    }

    fn validate(&self) -> Result<(), SolverError> {
        for package in self.present() {
            if let Some(requirement) = package.requires.iter().find(|r| !self.satisfied(r)) {
                return Err(SolverError::Unsatisfied {
                    package: package.to_string(),
                    requirement: requirement.to_string(),
                });
            }
            if let Some(other) = self.present().find(|o| package.conflicts_with(o)) {
                return Err(SolverError::Conflict {
                    package: package.to_string(),
                    other: other.to_string(),
                });
            }
        }
        Ok(())
    }

    fn into_assertions(mut self) -> PackagesAssertions {
        self.order
            .iter()
            .filter_map(|fp| self.decisions.remove(fp))
            .map(|d| PackageAssert::new(d.package, d.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryDatabase;

    fn pkg(name: &str, version: &str, requires: &[&str]) -> Package {
        Package::new("test", name, version)
            .with_requires(requires.iter().map(|r| PackageRef::any("test", *r)))
    }

    fn solver(definitions: &[Package], installed: &[Package]) -> Solver {
        Solver::new(
            Arc::new(InMemoryDatabase::with_packages(installed)),
            Arc::new(InMemoryDatabase::with_packages(definitions)),
            SolverOptions::default(),
        )
    }

    fn r(name: &str) -> PackageRef {
        PackageRef::any("test", name)
    }

    fn names(list: &PackagesAssertions) -> Vec<(String, bool)> {
        list.iter()
            .map(|a| (a.package.name.clone(), a.value))
            .collect()
    }

    #[test]
    fn test_chain_with_installed_package() {
        let c = pkg("c", "1.0", &[]);
        let definitions = [
            pkg("a", "1.0", &["b"]),
            pkg("b", "1.0", &["d"]),
            pkg("d", "1.0", &["h"]),
            pkg("h", "1.0", &["g"]),
            pkg("g", "1.0", &[]),
            c.clone(),
        ];
        let solver = solver(&definitions, &[c]);

        let solution = solver.install(&[r("a")]).unwrap();
        assert_eq!(solution.len(), 6);
        assert!(solution.iter().all(|a| a.value));

        let ordered = solution.order("a-test-1.0").unwrap();
        let order: Vec<_> = ordered.iter().map(|a| a.package.name.as_str()).collect();
        assert_eq!(order, ["g", "h", "d", "b", "a", "c"]);
    }

    #[test]
    fn test_missing_definition() {
        let solver = solver(&[pkg("a", "1.0", &["nope"])], &[]);
        let err = solver.install(&[r("a")]).unwrap_err();
        assert!(matches!(err, SolverError::MissingDefinition { ref package, .. } if package == "test/nope"));

        assert!(matches!(
            solver.install(&[r("ghost")]),
            Err(SolverError::MissingDefinition { .. })
        ));
    }

    #[test]
    fn test_conflicting_request_fails() {
        let a = pkg("a", "1.0", &["b"]);
        let b = pkg("b", "1.0", &[]);
        let c = pkg("c", "1.0", &[]).with_conflicts([r("b")]);
        let solver = solver(&[a, b, c], &[]);

        let err = solver.install(&[r("a"), r("c")]).unwrap_err();
        assert!(matches!(err, SolverError::Contradiction { .. }));
    }

    #[test]
    fn test_conflict_asserted_false() {
        let a = pkg("a", "1.0", &[]).with_conflicts([r("x")]);
        let x = pkg("x", "1.0", &[]);
        let solver = solver(&[a, x], &[]);

        let solution = solver.install(&[r("a")]).unwrap();
        assert_eq!(
            names(&solution),
            [("a".to_string(), true), ("x".to_string(), false)]
        );
    }

    #[test]
    fn test_already_installed_not_duplicated() {
        let a = pkg("a", "1.0", &[]);
        let solver = solver(std::slice::from_ref(&a), std::slice::from_ref(&a));

        let solution = solver.install(&[r("a")]).unwrap();
        assert_eq!(names(&solution), [("a".to_string(), true)]);
    }

    #[test]
    fn test_upgrade_in_place() {
        let old = pkg("a", "1.0", &[]);
        let new = pkg("a", "2.0", &[]);
        let solver = solver(&[old.clone(), new], &[old]);

        let solution = solver.install(&[r("a")]).unwrap();
        let present: Vec<_> = solution.to_install().map(|p| p.version.clone()).collect();
        let absent: Vec<_> = solution.to_remove().map(|p| p.version.clone()).collect();
        assert_eq!(present, ["2.0"]);
        assert_eq!(absent, ["1.0"]);
    }

    #[test]
    fn test_installed_version_satisfies_requirement() {
        let installed = pkg("c", "1.0", &[]);
        let definitions = [
            installed.clone(),
            pkg("c", "2.0", &[]),
            pkg("a", "1.0", &["c"]),
        ];
        let solver = solver(&definitions, &[installed]);

        let solution = solver.install(&[r("a")]).unwrap();
        let present: Vec<_> = solution
            .to_install()
            .filter(|p| p.name == "c")
            .map(|p| p.version.clone())
            .collect();
        assert_eq!(present, ["1.0"]);
        assert_eq!(solution.to_remove().count(), 0);
    }

    #[test]
    fn test_pinned_requirement_replaces_installed_version() {
        let installed = pkg("c", "1.0", &[]);
        let a = Package::new("test", "a", "1.0")
            .with_requires([PackageRef::new("test", "c", "2.0")]);
        let solver = solver(&[installed.clone(), pkg("c", "2.0", &[]), a], &[installed]);

        let solution = solver.install(&[r("a")]).unwrap();
        let present: Vec<_> = solution
            .to_install()
            .filter(|p| p.name == "c")
            .map(|p| p.version.clone())
            .collect();
        let absent: Vec<_> = solution.to_remove().map(|p| p.version.clone()).collect();
        assert_eq!(present, ["2.0"]);
        assert_eq!(absent, ["1.0"]);
    }

    #[test]
    fn test_installed_package_in_the_way_is_dropped() {
        let a = pkg("a", "1.0", &[]).with_conflicts([r("old")]);
        let old = pkg("old", "1.0", &[]);
        let user = pkg("user", "1.0", &["old"]);
        let keep = pkg("keep", "1.0", &[]);
        let solver = solver(&[a], &[old, user, keep]);

        let solution = solver.install(&[r("a")]).unwrap();
        assert_eq!(
            names(&solution),
            [
                ("a".to_string(), true),
                ("old".to_string(), false),
                ("user".to_string(), false),
                ("keep".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_unversioned_requirement_reuses_decision() {
        let pinned = PackageRef::new("test", "lib", "1.0");
        let app = pkg("app", "1.0", &["lib"]);
        let solver = solver(
            &[pkg("lib", "1.0", &[]), pkg("lib", "2.0", &[]), app],
            &[],
        );

        let solution = solver.install(&[pinned, r("app")]).unwrap();
        let libs: Vec<_> = solution
            .to_install()
            .filter(|p| p.name == "lib")
            .map(|p| p.version.clone())
            .collect();
        assert_eq!(libs, ["1.0"]);
    }

    #[test]
    fn test_solution_is_deterministic() {
        let definitions = [
            pkg("a", "1.0", &["b", "c"]),
            pkg("b", "1.0", &["c"]),
            pkg("c", "1.0", &[]),
        ];
        let solver = solver(&definitions, &[]);
        let first = solver.install(&[r("a")]).unwrap();
        for _ in 0..5 {
            assert_eq!(solver.install(&[r("a")]).unwrap(), first);
        }
    }

    #[test]
    fn test_relaxed_skips_unsatisfiable_request() {
        let definitions = [
            pkg("a", "1.0", &[]),
            pkg("broken", "1.0", &["missing"]),
        ];
        let relaxed = Solver::new(
            Arc::new(InMemoryDatabase::new()),
            Arc::new(InMemoryDatabase::with_packages(&definitions)),
            SolverOptions {
                strategy: SolverStrategy::Relaxed,
                max_attempts: 10,
            },
        );

        let solution = relaxed.install(&[r("broken"), r("a")]).unwrap();
        assert_eq!(names(&solution), [("a".to_string(), true)]);

        let strict = solver(&definitions, &[]);
        assert!(strict.install(&[r("broken"), r("a")]).is_err());
    }

    #[test]
    fn test_uninstall_removes_dependents_first() {
        let base = pkg("base", "1.0", &[]);
        let mid = pkg("mid", "1.0", &["base"]);
        let top = pkg("top", "1.0", &["mid"]);
        let solver = solver(&[], &[base, mid, top, pkg("other", "1.0", &[])]);

        let removal: Vec<_> = solver
            .uninstall(&r("base"))
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(removal, ["top", "mid", "base"]);

        assert!(matches!(
            solver.uninstall(&r("ghost")),
            Err(SolverError::NotInstalled(_))
        ));
    }

    #[test]
    fn test_upgrade_picks_newest() {
        let installed = [pkg("a", "1.0", &[]), pkg("b", "1.0", &[])];
        let definitions = [
            pkg("a", "1.0", &[]),
            pkg("a", "1.5", &[]),
            pkg("a", "1.2", &[]),
            pkg("b", "1.0", &[]),
        ];
        let solver = solver(&definitions, &installed);

        let upgrade = solver.upgrade().unwrap();
        assert_eq!(upgrade.remove.len(), 1);
        assert_eq!(upgrade.remove[0].version, "1.0");
        assert!(upgrade.install.search("a-test-1.5").is_some_and(|a| a.value));
        assert!(upgrade.install.search("a-test-1.0").is_some_and(|a| !a.value));
        assert!(upgrade.install.search("b-test-1.0").is_some_and(|a| a.value));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("Relaxed".parse::<SolverStrategy>().unwrap(), SolverStrategy::Relaxed);
        assert!("greedy".parse::<SolverStrategy>().is_err());
    }
}
