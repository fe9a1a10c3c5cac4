//! Container image backends.
//!
//! The compiler only ever talks to [`ImageBackend`]. Concrete backends drive
//! an external builder CLI; reading the images they export (layer diffs,
//! rootfs extraction) is shared and works on docker-save style archives.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;

use cairn_schema::LayerChange;
use thiserror::Error;
use tracing::{debug, warn};

use crate::archive::ArchiveError;

pub mod docker;
pub mod img;
pub mod layers;

pub use docker::DockerBackend;
pub use img::ImgBackend;

/// Errors from image backends.
#[derive(Error, Debug)]
pub enum BackendError {
    /// An external command exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        /// The command line run.
        command: String,
        /// Its exit status.
        status: String,
        /// What it wrote to stderr.
        stderr: String,
    },

    /// The backend's CLI is not installed.
    #[error("{0} not found in PATH")]
    MissingBinary(String),

    /// An exported image archive is malformed.
    #[error("invalid image archive {path}: {reason}")]
    InvalidImage {
        /// The archive.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// No backend by that name.
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// Reading or writing image files failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unpacking a layer failed.
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// An image manifest is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Arguments shared by every backend operation. Which fields matter depends
/// on the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendOptions {
    /// Image reference (`repo:tag`) to build, export, pull or remove.
    pub image_name: String,
    /// Build context directory, or the image archive to extract.
    pub source_path: PathBuf,
    /// Image definition file name inside `source_path`.
    pub definition_file: String,
    /// Where exports and extractions land.
    pub destination: PathBuf,
}

/// Builds, exports and inspects container images.
///
/// Diffing and extraction work on exported archives and have shared defaults.
pub trait ImageBackend: Send + Sync {
    /// Build `image_name` from `definition_file` with `source_path` as context.
    fn build_image(&self, opts: &BackendOptions) -> Result<(), BackendError>;

    /// Save `image_name` as an archive at `destination`.
    fn export_image(&self, opts: &BackendOptions) -> Result<(), BackendError>;

    /// Pull `image_name` from its registry.
    fn download_image(&self, opts: &BackendOptions) -> Result<(), BackendError>;

    /// Tag `src` as `dst`.
    fn copy_image(&self, src: &str, dst: &str) -> Result<(), BackendError>;

    /// Untag `image_name`.
    fn remove_image(&self, opts: &BackendOptions) -> Result<(), BackendError>;

    /// Build, export and forget an image in one go.
    ///
    /// A failed removal is logged; the export result is what counts.
    fn image_definition_to_tar(&self, opts: &BackendOptions) -> Result<(), BackendError> {
        self.build_image(opts)?;
        let exported = self.export_image(opts);
        if let Err(e) = self.remove_image(opts) {
            warn!("Could not remove {}: {e}", opts.image_name);
        }
        exported
    }

    /// Replay the image archive at `source_path` into `destination`.
    fn extract_rootfs(
        &self,
        opts: &BackendOptions,
        keep_permissions: bool,
    ) -> Result<(), BackendError> {
        layers::extract_rootfs(&opts.source_path, &opts.destination, keep_permissions)
    }

    /// Files touched by the layers `new` adds over `old` (both exported archives).
    fn changes(&self, old: &Path, new: &Path) -> Result<Vec<LayerChange>, BackendError> {
        layers::changes(old, new)
    }
}

/// Backend selection, parsed from configuration or the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// The `docker` CLI.
    #[default]
    Docker,
    /// The daemonless `img` builder.
    Img,
}

impl BackendKind {
    /// Instantiate the backend, checking its CLI is available.
    pub fn build(self) -> Result<Arc<dyn ImageBackend>, BackendError> {
        Ok(match self {
            Self::Docker => Arc::new(DockerBackend::new()?),
            Self::Img => Arc::new(ImgBackend::new()?),
        })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Img => write!(f, "img"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "img" => Ok(Self::Img),
            other => Err(BackendError::UnknownBackend(other.to_string())),
        }
    }
}

/// Locate a builder binary on `PATH`.
pub(crate) fn find_binary(name: &str) -> Result<PathBuf, BackendError> {
    which::which(name).map_err(|_| BackendError::MissingBinary(name.to_string()))
}

/// Run a builder command to completion, returning its stdout.
pub(crate) fn run(program: &Path, args: &[&str], cwd: Option<&Path>) -> Result<String, BackendError> {
    let rendered = format!("{} {}", program.display(), args.join(" "));
    debug!("Running {rendered}");

    let mut command = Command::new(program);
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command.output()?;
    if !output.status.success() {
        return Err(BackendError::Command {
            command: rendered,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
