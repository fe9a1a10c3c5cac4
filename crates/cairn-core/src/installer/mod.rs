//! Installing built artifacts onto a system.
//!
//! Repositories provide both the package definitions the solver works
//! against and the archives that get unpacked. What is installed where is
//! recorded in the system database, file by file, so it can be removed
//! again.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_schema::{ArtifactMetadata, OrderError, Package, PackageRef, PackagesAssertions};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveError};
use crate::config::RepositoryConfig;
use crate::database::{DbError, InMemoryDatabase, PackageDatabase};
use crate::solver::{Solver, SolverError, SolverOptions};

pub mod client;
pub mod repository;

pub use client::{ClientError, HttpClient, LocalClient, RepositoryClient, client_for};
pub use repository::{
    REPOSITORY_FILE, Repository, RepositoryError, RepositoryIndex, TREE_FILE,
    generate_repository,
};

/// Errors installing, removing or upgrading packages.
#[derive(Error, Debug)]
pub enum InstallError {
    /// No consistent set of packages satisfies the request.
    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    /// The chosen packages cannot be ordered.
    #[error("Ordering error: {0}")]
    Order(#[from] OrderError),

    /// The system database failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Fetching an artifact or index failed.
    #[error("Download failed: {0}")]
    Client(#[from] ClientError),

    /// A repository index is unusable.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// An artifact could not be unpacked.
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Writing to the target failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A package was chosen that no synced repository has an artifact for.
    #[error("no repository provides an artifact for {0}")]
    MissingArtifact(String),

    /// A blocking unpack task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The machine being installed into.
#[derive(Clone)]
pub struct System {
    /// Packages installed on this machine and the files they own.
    pub database: Arc<dyn PackageDatabase>,
    /// Root directory packages are unpacked under.
    pub target: PathBuf,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Settings for an [`Installer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerOptions {
    /// Concurrent artifact downloads.
    pub concurrency: usize,
    /// How install and upgrade requests are solved.
    pub solver: SolverOptions,
    /// Where repository indexes and artifacts are cached.
    pub cache_dir: PathBuf,
    /// Restore owners when unpacking; needs root.
    pub preserve_ownership: bool,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            solver: SolverOptions::default(),
            cache_dir: crate::paths::cache_path(),
            preserve_ownership: false,
        }
    }
}

/// Installs, removes and upgrades packages from synced repositories.
///
/// Repository order is preference order: the first one carrying a package wins.
#[derive(Debug)]
pub struct Installer {
    options: InstallerOptions,
    /// Preferred first.
    repositories: Vec<Repository>,
}

impl Installer {
    /// An installer without repositories.
    pub fn new(options: InstallerOptions) -> Self {
        Self {
            options,
            repositories: Vec::new(),
        }
    }

    /// Use already synced repositories, preferred first.
    pub fn with_repositories(mut self, repositories: Vec<Repository>) -> Self {
        self.repositories = repositories;
        self
    }

    /// Synced repositories, preferred first.
    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    /// Fetch the index of every enabled repository in `configs`.
    pub async fn sync_repositories(
        &mut self,
        configs: &[RepositoryConfig],
    ) -> Result<(), InstallError> {
        let mut configs: Vec<_> = configs.iter().filter(|c| c.enable).cloned().collect();
        configs.sort_by_key(|c| c.priority);

        let mut synced = Vec::with_capacity(configs.len());
        for config in configs {
            let client = client_for(&config)?;
            let dir = self.options.cache_dir.join("repos").join(&config.name);
            let index_path = client.download_file(REPOSITORY_FILE, &dir).await?;
            let index = RepositoryIndex::load(&index_path)?;
            info!(
                "Synced {} (revision {}, {} packages)",
                config.name,
                index.revision,
                index.artifacts.len()
            );
            synced.push(Repository {
                config,
                index,
                client,
            });
        }
        self.repositories = synced;
        Ok(())
    }

    /// Install `packages` and whatever they require.
    ///
    /// Installed packages the solution excludes are removed first. Returns
    /// the packages newly installed, in install order.
    pub async fn install(
        &self,
        packages: &[PackageRef],
        system: &System,
    ) -> Result<Vec<Package>, InstallError> {
        let solution = self.solver(system)?.install(packages)?;
        self.apply(&solution, system).await
    }

    /// Remove `package` and everything installed that depends on it.
    pub fn uninstall(
        &self,
        package: &PackageRef,
        system: &System,
    ) -> Result<Vec<Package>, InstallError> {
        let removal = self.solver(system)?.uninstall(package)?;
        for package in &removal {
            remove_package(package, system)?;
        }
        Ok(removal)
    }

    /// Replace installed packages that have newer definitions.
    pub async fn upgrade(&self, system: &System) -> Result<Vec<Package>, InstallError> {
        let upgrade = self.solver(system)?.upgrade()?;
        if upgrade.is_empty() {
            info!("Everything is up to date");
            return Ok(Vec::new());
        }

        for package in &upgrade.remove {
            remove_package(package, system)?;
        }
        self.apply(&upgrade.install, system).await
    }

    fn solver(&self, system: &System) -> Result<Solver, InstallError> {
        let definitions = InMemoryDatabase::new();
        for repository in &self.repositories {
            for package in repository.index.packages() {
                if definitions.get_package(&package.to_ref())?.is_none() {
                    definitions.create_package(package)?;
                }
            }
        }
        Ok(Solver::new(
            Arc::clone(&system.database),
            Arc::new(definitions),
            self.options.solver.clone(),
        ))
    }

    fn locate(&self, package: &Package) -> Option<(&Repository, &ArtifactMetadata)> {
        self.repositories
            .iter()
            .find_map(|r| r.index.find_artifact(package).map(|a| (r, a)))
    }

    async fn apply(
        &self,
        solution: &PackagesAssertions,
        system: &System,
    ) -> Result<Vec<Package>, InstallError> {
        let ordered = solution.order("")?;

        for assertion in ordered.iter().filter(|a| !a.value) {
            if is_installed(&assertion.package, system)? {
                remove_package(&assertion.package, system)?;
            }
        }

        let mut pending = Vec::new();
        for assertion in ordered.iter().filter(|a| a.value) {
            if !is_installed(&assertion.package, system)? {
                pending.push(assertion.package.clone());
            }
        }
        if pending.is_empty() {
            info!("Nothing to install");
            return Ok(pending);
        }

        let archives = self.download(&pending).await?;
        for package in &pending {
            let fingerprint = package.fingerprint();
            let archive_path = archives
                .get(&fingerprint)
                .ok_or_else(|| InstallError::MissingArtifact(package.to_string()))?;

            info!("Installing {package}");
            let files = archive::untar(
                archive_path,
                &system.target,
                self.options.preserve_ownership,
            )?;
            system.database.create_package(&package.without_path())?;
            system.database.set_package_files(&fingerprint, &files)?;
            debug!("{package}: {} file(s)", files.len());
        }
        Ok(pending)
    }

    /// Fetch the archives for `packages` concurrently, keyed by fingerprint.
    async fn download(
        &self,
        packages: &[Package],
    ) -> Result<HashMap<String, PathBuf>, InstallError> {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut set: JoinSet<Result<(String, PathBuf), InstallError>> = JoinSet::new();

        for package in packages {
            let (repository, artifact) = self
                .locate(package)
                .ok_or_else(|| InstallError::MissingArtifact(package.to_string()))?;
            let client = Arc::clone(&repository.client);
            let artifact = artifact.clone();
            let cache_dir = self.options.cache_dir.join("packages");
            let semaphore = Arc::clone(&semaphore);
            let fingerprint = package.fingerprint();

            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                debug!("Downloading {}", artifact.path);
                let path = client.download_artifact(&artifact, &cache_dir).await?;
                Ok((fingerprint, path))
            });
        }

        let mut archives = HashMap::new();
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined? {
                Ok((fingerprint, path)) => {
                    archives.insert(fingerprint, path);
                }
                Err(e) => {
                    warn!("{e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(archives),
        }
    }
}

fn is_installed(package: &Package, system: &System) -> Result<bool, DbError> {
    Ok(system
        .database
        .get_package(&package.to_ref())?
        .is_some_and(|p| p.fingerprint() == package.fingerprint()))
}

/// Delete the files `package` owns under the target, then its record.
fn remove_package(package: &Package, system: &System) -> Result<(), InstallError> {
    let fingerprint = package.fingerprint();
    let files = system.database.get_package_files(&fingerprint)?;
    info!("Removing {package}");

    let mut parents = Vec::new();
    for file in files.iter().rev() {
        let path = system.target.join(file);
        if !archive::exists(&path) {
            continue;
        }
        if fs::symlink_metadata(&path)?.is_dir() {
            parents.push(path);
            continue;
        }
        fs::remove_file(&path)?;
        if let Some(parent) = path.parent() {
            parents.push(parent.to_path_buf());
        }
    }
    prune_empty_dirs(parents, &system.target);

    system.database.remove_package(&package.to_ref())?;
    Ok(())
}

/// Remove directories left empty, walking up but never past `root`.
fn prune_empty_dirs(mut dirs: Vec<PathBuf>, root: &Path) {
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    dirs.dedup();
    for dir in dirs {
        let mut current = Some(dir.as_path());
        while let Some(dir) = current {
            if dir == root || !dir.starts_with(root) || fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}
