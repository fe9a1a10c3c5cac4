//! Artifact metadata and image layer changes.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assertion::PackagesAssertions;
use crate::hash::Sha256Hash;
use crate::package::{Package, PackageRef};
use crate::recipe::BuildRecipe;

/// Errors reading or writing artifact metadata.
#[derive(Error, Debug)]
pub enum MetadataError {
    /// Reading or writing the metadata file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid metadata JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression name other than `none` or `gzip`.
    #[error("unknown compression type '{0}'")]
    UnknownCompression(String),
}

/// Compression applied to a package archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// Plain tar.
    #[default]
    None,
    /// Gzip-compressed tar.
    Gzip,
}

impl CompressionType {
    /// Suffix appended after `.tar`.
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
        }
    }
}

impl FromStr for CompressionType {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            other => Err(MetadataError::UnknownCompression(other.to_string())),
        }
    }
}

/// How a [`LayerChange`] touched its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Not present in the older image.
    Added,
    /// Present in both, with different content.
    Modified,
    /// Removed by a whiteout entry.
    Deleted,
}

/// One path touched by the layers an image adds on top of another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerChange {
    /// Path relative to the image root, without a leading `/`.
    pub path: String,
    /// What happened to the path.
    pub kind: ChangeKind,
    /// Size in bytes of the new content; zero for deletions.
    pub size: u64,
}

/// A dependency an artifact was built on top of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDependency {
    /// Archive file name of the dependency's artifact.
    pub path: String,
    /// The dependency's exact version.
    pub package: PackageRef,
}

/// The `<fingerprint>.metadata.json` document written beside every archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Archive file name, relative to the metadata file.
    pub path: String,
    /// The package built, with its requires and conflicts.
    pub package: Package,
    /// Recipe the package was built with.
    #[serde(default)]
    pub recipe: BuildRecipe,
    /// Artifacts this one was built on top of, in build order.
    #[serde(default)]
    pub dependencies: Vec<ArtifactDependency>,
    /// Ordered dependency tree with its cache hashes.
    #[serde(default)]
    pub source_assertion: PackagesAssertions,
    /// Compression applied to the archive.
    #[serde(default)]
    pub compression: CompressionType,
    /// Checksum of the archive at `path`.
    #[serde(default)]
    pub checksum: Sha256Hash,
}

impl ArtifactMetadata {
    /// `<fingerprint>.metadata.json`.
    pub fn file_name(fingerprint: &str) -> String {
        format!("{fingerprint}.metadata.json")
    }

    /// Write the document into `dir`, returning its path.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] on serialization or write failure.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, MetadataError> {
        let path = dir.join(Self::file_name(&self.package.fingerprint()));
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(&path, data)?;
        Ok(path)
    }

    /// Read a document written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] if the file is missing or not valid metadata.
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}
