//! Package tree loading.
//!
//! A tree is any directory hierarchy; each directory holding a
//! `definition.toml` is one package, with its `build.toml` beside it.

use std::fs;
use std::path::{Path, PathBuf};

use cairn_schema::{DEFINITION_FILE, Package};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::database::{DbError, PackageDatabase};

/// Errors loading a package tree.
#[derive(Error, Debug)]
pub enum TreeError {
    /// Walking the tree failed.
    #[error("failed to walk {path}: {source}")]
    Walk {
        /// Directory being walked.
        path: PathBuf,
        /// Underlying walk error.
        source: walkdir::Error,
    },

    /// A definition or recipe could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A definition is not valid TOML.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// Storing a definition failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Register every package found under `root` in `db`.
///
/// Returns how many definitions were loaded.
///
/// # Errors
///
/// Fails on the first unreadable or malformed definition, naming the file.
pub fn load_tree(root: &Path, db: &dyn PackageDatabase) -> Result<usize, TreeError> {
    let mut count = 0;

    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|source| TreeError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() || entry.file_name() != DEFINITION_FILE {
            continue;
        }

        let package = read_definition(entry.path())?;
        debug!("Loaded {package} from {}", entry.path().display());
        db.create_package(&package)?;
        count += 1;
    }

    info!("Loaded {count} package(s) from {}", root.display());
    Ok(count)
}

/// Parse a single `definition.toml`, recording its directory on the package.
///
/// # Errors
///
/// Returns [`TreeError::Io`] or [`TreeError::Parse`] naming `path`.
pub fn read_definition(path: &Path) -> Result<Package, TreeError> {
    let content = fs::read_to_string(path).map_err(|source| TreeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut package: Package = toml::from_str(&content).map_err(|source| TreeError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    package.path = path.parent().map(Path::to_path_buf);
    Ok(package)
}
