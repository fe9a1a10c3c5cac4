//! Package databases.
//!
//! The same interface backs three roles: the definitions loaded from a tree
//! or repository, the packages installed on a system, and the scratch world
//! the compiler solves against. Lookups are keyed by fingerprint.

use std::collections::{HashSet, VecDeque};

use cairn_schema::{Package, PackageRef, compare_versions};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryDatabase;
pub use sqlite::SqliteDatabase;

/// Errors from a package database.
#[derive(Error, Debug)]
pub enum DbError {
    /// The SQLite store failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored package could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Creating the database directory failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No stored package matches the reference.
    #[error("Package not found: {0}")]
    NotFound(String),
}

/// Storage for package definitions and the files installed packages own.
///
/// Implementations must be safe to share between build workers.
pub trait PackageDatabase: Send + Sync {
    /// All stored versions of `category/name`.
    fn find_packages(&self, category: &str, name: &str) -> Result<Vec<Package>, DbError>;

    /// Every stored package, in insertion order.
    fn world(&self) -> Result<Vec<Package>, DbError>;

    /// Store `package`, replacing any entry with the same fingerprint.
    /// Returns the fingerprint it is stored under.
    fn create_package(&self, package: &Package) -> Result<String, DbError>;

    /// Remove the package the reference resolves to, with its file list.
    fn remove_package(&self, reference: &PackageRef) -> Result<(), DbError>;

    /// Record the files a package owns on disk.
    fn set_package_files(&self, fingerprint: &str, files: &[String]) -> Result<(), DbError>;

    /// Files recorded for `fingerprint`; empty when none were.
    fn get_package_files(&self, fingerprint: &str) -> Result<Vec<String>, DbError>;

    /// Resolve a reference. Unversioned references resolve to the highest
    /// stored version.
    fn find_package(&self, reference: &PackageRef) -> Result<Package, DbError> {
        self.find_packages(&reference.category, &reference.name)?
            .into_iter()
            .filter(|p| reference.matches(p))
            .max_by(|a, b| compare_versions(&a.version, &b.version))
            .ok_or_else(|| DbError::NotFound(reference.to_string()))
    }

    /// Like [`find_package`](Self::find_package) but a miss is `None`.
    fn get_package(&self, reference: &PackageRef) -> Result<Option<Package>, DbError> {
        match self.find_package(reference) {
            Ok(p) => Ok(Some(p)),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Packages that require `package`, directly or through other packages,
    /// closest first.
    fn revdeps(&self, package: &Package) -> Result<Vec<Package>, DbError> {
        let world = self.world()?;
        let mut seen = HashSet::from([package.fingerprint()]);
        let mut queue = VecDeque::from([package.clone()]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            for candidate in &world {
                if candidate.requires.iter().any(|r| r.matches(&current))
                    && seen.insert(candidate.fingerprint())
                {
                    out.push(candidate.clone());
                    queue.push_back(candidate.clone());
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, version: &str, requires: &[&str]) -> Package {
        Package::new("test", name, version)
            .with_requires(requires.iter().map(|r| PackageRef::any("test", *r)))
    }

    #[test]
    fn test_find_package_picks_highest_version() {
        let db = InMemoryDatabase::new();
        db.create_package(&pkg("a", "1.0", &[])).unwrap();
        db.create_package(&pkg("a", "1.10", &[])).unwrap();
        db.create_package(&pkg("a", "1.2", &[])).unwrap();

        let found = db.find_package(&PackageRef::any("test", "a")).unwrap();
        assert_eq!(found.version, "1.10");

        let pinned = db.find_package(&PackageRef::new("test", "a", "1.2")).unwrap();
        assert_eq!(pinned.version, "1.2");

        assert!(matches!(
            db.find_package(&PackageRef::new("test", "a", "9")),
            Err(DbError::NotFound(_))
        ));
        assert!(db.get_package(&PackageRef::any("test", "zz")).unwrap().is_none());
    }

    #[test]
    fn test_revdeps_transitive() {
        let db = InMemoryDatabase::new();
        db.create_package(&pkg("q", "1.0", &[])).unwrap();
        db.create_package(&pkg("r", "1.0", &["q"])).unwrap();
        db.create_package(&pkg("s", "1.0", &["q"])).unwrap();
        db.create_package(&pkg("t", "1.0", &["r"])).unwrap();
        db.create_package(&pkg("u", "1.0", &[])).unwrap();

        let names: Vec<_> = db
            .revdeps(&pkg("q", "1.0", &[]))
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, ["r", "s", "t"]);
    }

    #[test]
    fn test_revdeps_tolerates_cycles() {
        let db = InMemoryDatabase::new();
        db.create_package(&pkg("a", "1.0", &["b"])).unwrap();
        db.create_package(&pkg("b", "1.0", &["a"])).unwrap();

        let deps = db.revdeps(&pkg("a", "1.0", &["b"])).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name, "b");
    }
}
