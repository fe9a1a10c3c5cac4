//! `img` CLI backend.

use std::path::PathBuf;

use super::{BackendError, BackendOptions, ImageBackend, find_binary, run};

/// Builds through the daemonless `img` builder.
///
/// `img save` writes the same archive layout as `docker save`, so layer
/// inspection is shared with [`DockerBackend`](super::DockerBackend).
#[derive(Debug, Clone)]
pub struct ImgBackend {
    binary: PathBuf,
}

impl ImgBackend {
    /// Locate `img` in `PATH`.
    pub fn new() -> Result<Self, BackendError> {
        Ok(Self {
            binary: find_binary("img")?,
        })
    }
}

impl ImageBackend for ImgBackend {
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
            &["save", "-o", &destination, &opts.image_name],
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
        run(&self.binary, &["rm", &opts.image_name], None)?;
        Ok(())
    }
}
