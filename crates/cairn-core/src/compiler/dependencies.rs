//! Dependency trees with per-package cache hashes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use cairn_schema::{Package, PackageAssert, PackageHash, PackagesAssertions};
use tracing::debug;

use super::CompileError;
use crate::database::{InMemoryDatabase, PackageDatabase};
use crate::solver::{Solver, SolverOptions};

/// Ordered, hashed dependency trees over a set of definitions.
///
/// Per-package hashes are remembered by fingerprint, so the definitions
/// must not change while a `DependencyTree` is in use.
pub struct DependencyTree {
    definitions: Arc<dyn PackageDatabase>,
    solver: SolverOptions,
    hashes: Mutex<HashMap<String, PackageHash>>,
}

impl fmt::Debug for DependencyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyTree")
            .field("solver", &self.solver)
            .finish_non_exhaustive()
    }
}

impl DependencyTree {
    /// Trees over `definitions`, solved with `solver`.
    pub fn new(definitions: Arc<dyn PackageDatabase>, solver: SolverOptions) -> Self {
        Self {
            definitions,
            solver,
            hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Everything `package` needs present, dependencies first and `package`
    /// last, each with its build and package hash.
    ///
    /// The build hash of an entry covers the ordered tree below it; the
    /// package hash also covers the entry itself.
    pub fn compute(&self, package: &Package) -> Result<PackagesAssertions, CompileError> {
        let solver = self.solver();
        let fingerprint = package.fingerprint();
        let solution = solver.install(&[package.to_ref()])?.order(&fingerprint)?;

        let mut tree = PackagesAssertions::new();
        for assertion in solution {
            if !assertion.value {
                continue;
            }
            let hash = self.hash(&solver, &assertion)?;
            debug!(
                "{}: build {} package {}",
                assertion.package, hash.build_hash, hash.package_hash
            );
            tree.push(PackageAssert { hash, ..assertion });
        }
        Ok(tree)
    }

    fn solver(&self) -> Solver {
        Solver::new(
            Arc::new(InMemoryDatabase::new()),
            Arc::clone(&self.definitions),
            self.solver.clone(),
        )
    }

    fn hash(&self, solver: &Solver, assertion: &PackageAssert) -> Result<PackageHash, CompileError> {
        let fingerprint = assertion.fingerprint();
        if let Some(hash) = self
            .hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fingerprint)
        {
            return Ok(hash.clone());
        }

        let own = solver
            .install(&[assertion.package.to_ref()])?
            .order(&fingerprint)?
            .cut(&assertion.package);
        let hash = PackageHash {
            build_hash: own.drop_package(&assertion.package).assertion_hash(),
            package_hash: own.assertion_hash(),
        };

        self.hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint, hash.clone());
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_schema::PackageRef;

    fn definitions() -> Arc<InMemoryDatabase> {
        let r = |n: &str| PackageRef::any("test", n);
        let packages = [
            Package::new("test", "g", "1.0"),
            Package::new("test", "h", "1.0").with_requires([r("g")]),
            Package::new("test", "d", "1.0").with_requires([r("h")]),
            Package::new("test", "b", "1.0").with_requires([r("d")]),
            Package::new("test", "a", "1.0").with_requires([r("b")]),
        ];
        Arc::new(InMemoryDatabase::with_packages(&packages))
    }

    #[test]
    fn test_chain_order_and_hashes() {
        let tree = DependencyTree::new(definitions(), SolverOptions::default());
        let a = Package::new("test", "a", "1.0").with_requires([PackageRef::any("test", "b")]);

        let result = tree.compute(&a).unwrap();
        let names: Vec<_> = result.iter().map(|x| x.package.name.as_str()).collect();
        assert_eq!(names, ["g", "h", "d", "b", "a"]);

        // Each entry's build hash is the previous entry's package hash.
        for pair in result.as_slice().windows(2) {
            assert_eq!(pair[1].hash.build_hash, pair[0].hash.package_hash);
        }
        assert!(result.iter().all(|x| x.value));
    }

    #[test]
    fn test_hashes_are_stable() {
        let a = Package::new("test", "a", "1.0").with_requires([PackageRef::any("test", "b")]);
        let first = DependencyTree::new(definitions(), SolverOptions::default())
            .compute(&a)
            .unwrap();
        let second = DependencyTree::new(definitions(), SolverOptions::default())
            .compute(&a)
            .unwrap();
        assert_eq!(first, second);
    }
}
