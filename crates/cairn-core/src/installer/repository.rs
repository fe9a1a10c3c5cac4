//! Repository indexes.
//!
//! A repository is a directory (or the same directory served over HTTP)
//! holding package archives, their `.metadata.json` files and a
//! `repository.json` index listing every artifact.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_schema::{ArtifactMetadata, MetadataError, Package};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::client::RepositoryClient;
use crate::archive::{self, ArchiveError};
use crate::config::{RepositoryConfig, RepositoryKind};

/// Index file at the root of every repository.
pub const REPOSITORY_FILE: &str = "repository.json";

/// Optional archive of the package tree the repository was built from.
pub const TREE_FILE: &str = "tree.tar";

const METADATA_SUFFIX: &str = ".metadata.json";

/// Errors reading or writing repository indexes.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Reading or writing index files failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The index is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An artifact's metadata could not be read.
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Packing the tree archive failed.
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),
}

/// The `repository.json` document published with a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryIndex {
    /// Repository name.
    pub name: String,
    /// `local` or `http`.
    #[serde(rename = "type")]
    pub kind: RepositoryKind,
    /// Locations clients fetch from, tried in order.
    pub urls: Vec<String>,
    /// Bumped every time the index is regenerated in place.
    pub revision: u64,
    /// When the index was generated.
    pub last_update: DateTime<Utc>,
    /// Metadata of every artifact the repository carries.
    pub artifacts: Vec<ArtifactMetadata>,
}

impl RepositoryIndex {
    /// Read an index from `path`.
    pub fn load(path: &Path) -> Result<Self, RepositoryError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every package the repository carries.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.artifacts.iter().map(|a| &a.package)
    }

    /// The artifact built for exactly `package`.
    pub fn find_artifact(&self, package: &Package) -> Option<&ArtifactMetadata> {
        let fingerprint = package.fingerprint();
        self.artifacts
            .iter()
            .find(|a| a.package.fingerprint() == fingerprint)
    }

    /// Write `repository.json` into `dir`, and `tree.tar` when `tree` is given.
    pub fn write(&self, dir: &Path, tree: Option<&Path>) -> Result<PathBuf, RepositoryError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(REPOSITORY_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        if let Some(tree) = tree {
            archive::tar(tree, &dir.join(TREE_FILE))?;
        }
        info!(
            "Wrote repository {} (revision {}, {} artifacts) to {}",
            self.name,
            self.revision,
            self.artifacts.len(),
            dir.display()
        );
        Ok(path)
    }
}

/// Index every `*.metadata.json` in `artifacts_dir`.
///
/// The revision continues from an index already present in `artifacts_dir`.
pub fn generate_repository(
    name: &str,
    kind: RepositoryKind,
    urls: Vec<String>,
    artifacts_dir: &Path,
) -> Result<RepositoryIndex, RepositoryError> {
    let mut files: Vec<PathBuf> = fs::read_dir(artifacts_dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(METADATA_SUFFIX))
        })
        .collect();
    files.sort();

    let mut artifacts = Vec::with_capacity(files.len());
    for file in files {
        debug!("Indexing {}", file.display());
        artifacts.push(ArtifactMetadata::load(&file)?);
    }

    let existing = artifacts_dir.join(REPOSITORY_FILE);
    let revision = if existing.is_file() {
        RepositoryIndex::load(&existing)?.revision + 1
    } else {
        1
    };

    Ok(RepositoryIndex {
        name: name.to_string(),
        kind,
        urls,
        revision,
        last_update: Utc::now(),
        artifacts,
    })
}

/// A synced repository: its index and a client able to fetch from it.
#[derive(Clone)]
pub struct Repository {
    /// Configuration the repository was synced from.
    pub config: RepositoryConfig,
    /// Its index, as fetched.
    pub index: RepositoryIndex,
    /// Client over its locations.
    pub client: Arc<dyn RepositoryClient>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.config.name)
            .field("revision", &self.index.revision)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_schema::{BuildRecipe, CompressionType, PackagesAssertions, Sha256Hash};
    use tempfile::tempdir;

    fn metadata(name: &str, version: &str) -> ArtifactMetadata {
        let package = Package::new("test", name, version);
        ArtifactMetadata {
            path: format!("{}.package.tar", package.fingerprint()),
            package,
            recipe: BuildRecipe::default(),
            dependencies: Vec::new(),
            source_assertion: PackagesAssertions::new(),
            compression: CompressionType::None,
            checksum: Sha256Hash::digest(name.as_bytes()),
        }
    }

    #[test]
    fn test_generate_and_bump_revision() {
        let dir = tempdir().unwrap();
        metadata("b", "1.0").save(dir.path()).unwrap();
        metadata("a", "2.0").save(dir.path()).unwrap();
        fs::write(dir.path().join("a-test-2.0.package.tar"), "x").unwrap();

        let index = generate_repository("main", RepositoryKind::Local, vec![], dir.path()).unwrap();
        assert_eq!(index.revision, 1);
        let names: Vec<_> = index.packages().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);

        index.write(dir.path(), None).unwrap();
        let again = generate_repository("main", RepositoryKind::Local, vec![], dir.path()).unwrap();
        assert_eq!(again.revision, 2);

        let loaded = RepositoryIndex::load(&dir.path().join(REPOSITORY_FILE)).unwrap();
        assert_eq!(loaded, index);
    }

    #[test]
    fn test_write_tree_archive() {
        let tree = tempdir().unwrap();
        fs::create_dir_all(tree.path().join("a")).unwrap();
        fs::write(tree.path().join("a/definition.toml"), "name = \"a\"").unwrap();
        let out = tempdir().unwrap();

        let index = generate_repository("main", RepositoryKind::Local, vec![], out.path()).unwrap();
        index.write(out.path(), Some(tree.path())).unwrap();
        assert!(out.path().join(TREE_FILE).is_file());
    }

    #[test]
    fn test_find_artifact_by_fingerprint() {
        let index = RepositoryIndex {
            name: "main".into(),
            kind: RepositoryKind::Local,
            urls: vec![],
            revision: 1,
            last_update: Utc::now(),
            artifacts: vec![metadata("a", "1.0"), metadata("a", "2.0")],
        };
        let found = index
            .find_artifact(&Package::new("test", "a", "2.0"))
            .unwrap();
        assert_eq!(found.path, "a-test-2.0.package.tar");
        assert!(index.find_artifact(&Package::new("test", "a", "3.0")).is_none());
    }
}
