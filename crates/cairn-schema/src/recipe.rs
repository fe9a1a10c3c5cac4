//! Build recipes (`build.toml`).
//!
//! ```toml
//! image = "alpine:3.19"    # seed image, optional when the package has requires
//! prelude = ["apk add --no-cache make"]
//! steps = ["make install DESTDIR=/"]
//! env = ["CFLAGS=-O2"]
//! includes = ["^/usr/bin/.*"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a `build.toml`.
#[derive(Error, Debug)]
pub enum RecipeError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not a valid recipe.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}

/// How a package is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildRecipe {
    /// Seed image. Without one the build starts from the last dependency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Package the whole seed image filesystem instead of building.
    pub unpack: bool,
    /// Commands baked into the builder image.
    pub prelude: Vec<String>,
    /// Commands whose filesystem changes become the artifact.
    pub steps: Vec<String>,
    /// `KEY=VALUE` pairs exported to both stages.
    pub env: Vec<String>,
    /// Regexes selecting which changed paths end up in the artifact.
    pub includes: Vec<String>,
}

impl BuildRecipe {
    /// Read a recipe from disk.
    ///
    /// # Errors
    ///
    /// Returns [`RecipeError`] naming `path` if it cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, RecipeError> {
        let content = fs::read_to_string(path).map_err(|source| RecipeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| RecipeError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
