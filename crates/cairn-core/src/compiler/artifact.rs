//! Built archives and the metadata written beside them.

use std::fs;
use std::path::{Path, PathBuf};

use cairn_schema::{
    ArtifactDependency, ArtifactMetadata, ChangeKind, CompressionType, LayerChange,
    MetadataError, PackagesAssertions, Sha256Hash,
};
use regex::Regex;
use tracing::debug;

use super::spec::CompilationSpec;
use crate::archive::{self, ArchiveError};

/// A built package archive.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// The archive on disk.
    pub path: PathBuf,
    /// The spec it was built from, dependency tree included.
    pub spec: CompilationSpec,
    /// Artifacts built on the way, in build order.
    pub dependencies: Vec<Artifact>,
    /// Compression of the archive.
    pub compression: CompressionType,
}

impl Artifact {
    /// An artifact without dependencies.
    pub fn new(path: PathBuf, spec: CompilationSpec, compression: CompressionType) -> Self {
        Self {
            path,
            spec,
            dependencies: Vec::new(),
            compression,
        }
    }

    /// Ordered dependency tree the artifact was built from.
    pub fn source_assertion(&self) -> &PackagesAssertions {
        &self.spec.source_assertion
    }

    /// File name of the archive.
    pub fn file_name(&self) -> String {
        file_name(&self.path)
    }

    /// Describe this artifact, checksumming the archive.
    pub fn to_metadata(&self) -> Result<ArtifactMetadata, MetadataError> {
        Ok(ArtifactMetadata {
            path: self.file_name(),
            package: self.spec.package.without_path(),
            recipe: self.spec.recipe.clone(),
            dependencies: self
                .dependencies
                .iter()
                .map(|d| ArtifactDependency {
                    path: d.file_name(),
                    package: d.spec.package.to_ref(),
                })
                .collect(),
            source_assertion: self
                .spec
                .source_assertion
                .iter()
                .map(|a| {
                    let mut a = a.clone();
                    a.package = a.package.without_path();
                    a
                })
                .collect(),
            compression: self.compression,
            checksum: Sha256Hash::of_file(&self.path)?,
        })
    }

    /// Write `<fingerprint>.metadata.json` into `dir`.
    pub fn write_metadata(&self, dir: &Path) -> Result<PathBuf, MetadataError> {
        self.to_metadata()?.save(dir)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Package the changed files of `rootfs` into `dest`.
///
/// Deleted paths and directories are skipped. With `includes`, only paths
/// (as absolute `/`-rooted strings) matching one of the patterns are kept.
pub fn extract_artifact_from_delta(
    rootfs: &Path,
    dest: &Path,
    changes: &[LayerChange],
    includes: &[Regex],
    compression: CompressionType,
) -> Result<(), ArchiveError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new().prefix("archive").tempdir_in(parent)?;

    let mut copied = 0usize;
    for change in changes {
        if change.kind == ChangeKind::Deleted {
            continue;
        }
        let absolute = format!("/{}", change.path);
        if !includes.is_empty() && !includes.iter().any(|r| r.is_match(&absolute)) {
            continue;
        }

        let source = rootfs.join(&change.path);
        match fs::symlink_metadata(&source) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => {}
            Err(_) => {
                debug!("{} vanished from rootfs, skipping", change.path);
                continue;
            }
        }
        archive::copy_file(&source, &staging.path().join(&change.path))?;
        copied += 1;
    }

    debug!("Packing {copied} file(s) into {}", dest.display());
    archive::tar_with(staging.path(), dest, compression)
}
