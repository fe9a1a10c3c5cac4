//! In-memory package database.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use cairn_schema::{Package, PackageRef};

use super::{DbError, PackageDatabase};

#[derive(Debug, Default)]
struct Inner {
    order: Vec<String>,
    packages: HashMap<String, Package>,
    files: HashMap<String, Vec<String>>,
}

/// Process-local database, used for scratch solves and tree definitions.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    inner: RwLock<Inner>,
}

impl InMemoryDatabase {
    /// An empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a database pre-populated with `packages`.
    pub fn with_packages<'a>(packages: impl IntoIterator<Item = &'a Package>) -> Self {
        let db = Self::new();
        {
            let mut inner = db.inner.write().unwrap_or_else(PoisonError::into_inner);
            for package in packages {
                Self::insert(&mut inner, package);
            }
        }
        db
    }

    fn insert(inner: &mut Inner, package: &Package) -> String {
        let fingerprint = package.fingerprint();
        if inner
            .packages
            .insert(fingerprint.clone(), package.clone())
            .is_none()
        {
            inner.order.push(fingerprint.clone());
        }
        fingerprint
    }
}

impl PackageDatabase for InMemoryDatabase {
    fn find_packages(&self, category: &str, name: &str) -> Result<Vec<Package>, DbError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .order
            .iter()
            .filter_map(|fp| inner.packages.get(fp))
            .filter(|p| p.category == category && p.name == name)
            .cloned()
            .collect())
    }

    fn find_package(&self, reference: &PackageRef) -> Result<Package, DbError> {
        if !reference.is_unversioned() {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            return inner
                .packages
                .get(&reference.fingerprint())
                .cloned()
                .ok_or_else(|| DbError::NotFound(reference.to_string()));
        }

        self.find_packages(&reference.category, &reference.name)?
            .into_iter()
            .max_by(|a, b| cairn_schema::compare_versions(&a.version, &b.version))
            .ok_or_else(|| DbError::NotFound(reference.to_string()))
    }

    fn world(&self) -> Result<Vec<Package>, DbError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .order
            .iter()
            .filter_map(|fp| inner.packages.get(fp))
            .cloned()
            .collect())
    }

    fn create_package(&self, package: &Package) -> Result<String, DbError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Self::insert(&mut inner, package))
    }

    fn remove_package(&self, reference: &PackageRef) -> Result<(), DbError> {
        let package = self.find_package(reference)?;
        let fingerprint = package.fingerprint();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.packages.remove(&fingerprint);
        inner.files.remove(&fingerprint);
        inner.order.retain(|fp| fp != &fingerprint);
        Ok(())
    }

    fn set_package_files(&self, fingerprint: &str, files: &[String]) -> Result<(), DbError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.packages.contains_key(fingerprint) {
            return Err(DbError::NotFound(fingerprint.to_string()));
        }
        inner.files.insert(fingerprint.to_string(), files.to_vec());
        Ok(())
    }

    fn get_package_files(&self, fingerprint: &str) -> Result<Vec<String>, DbError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.files.get(fingerprint).cloned().unwrap_or_default())
    }
}
