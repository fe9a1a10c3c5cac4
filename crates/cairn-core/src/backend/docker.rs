//! Docker CLI backend.

use std::path::PathBuf;

use super::{BackendError, BackendOptions, ImageBackend, find_binary, run};

/// Builds through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    binary: PathBuf,
}

impl DockerBackend {
    /// Locate `docker` in `PATH`.
    pub fn new() -> Result<Self, BackendError> {
        Ok(Self {
            binary: find_binary("docker")?,
        })
    }
}

impl ImageBackend for DockerBackend {
    fn build_image(&self, opts: &BackendOptions) -> Result<(), BackendError> {
        let definition = opts.source_path.join(&opts.definition_file);
        let definition = definition.to_string_lossy();
        run(
            &self.binary,
            &["build", "-f", &definition, "-t", &opts.image_name, "."],
            Some(&opts.source_path),
        )?;
        Ok(())
    }

    fn export_image(&self, opts: &BackendOptions) -> Result<(), BackendError> {
        let destination = opts.destination.to_string_lossy();
        run(
            &self.binary,
            &["save", &opts.image_name, "-o", &destination],
            None,
        )?;
        Ok(())
    }

    fn download_image(&self, opts: &BackendOptions) -> Result<(), BackendError> {
        run(&self.binary, &["pull", &opts.image_name], None)?;
        Ok(())
    }

    fn copy_image(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        run(&self.binary, &["tag", src, dst], None)?;
        Ok(())
    }

    fn remove_image(&self, opts: &BackendOptions) -> Result<(), BackendError> {
        run(&self.binary, &["rmi", &opts.image_name], None)?;
        Ok(())
    }
}
