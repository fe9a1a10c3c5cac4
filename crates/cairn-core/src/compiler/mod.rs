//! Build orchestration.
//!
//! A package is built in two image stages: a builder image holding the seed
//! image, the package sources and the prelude, and a package image running
//! the build steps on top of it. The artifact is whatever the second stage
//! changed. Dependencies are built first, in order, each seeded from the
//! previous one's package image, so the chain doubles as a cache keyed by
//! the dependency tree hashes.

use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use cairn_schema::{
    BUILD_FILE, BuildRecipe, CompressionType, MetadataError, OrderError, Package,
    PackagesAssertions, RecipeError,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::archive::{self, ArchiveError};
use crate::backend::{BackendError, BackendOptions, ImageBackend};
use crate::database::{DbError, PackageDatabase};
use crate::solver::{SolverError, SolverOptions};

pub mod artifact;
pub mod dependencies;
pub mod spec;

pub use artifact::{Artifact, extract_artifact_from_delta};
pub use dependencies::DependencyTree;
pub use spec::{CompilationSpec, CompilationSpecs};

/// Errors building packages.
#[derive(Error, Debug)]
pub enum CompileError {
    /// A package with neither a seed image nor requirements to build on.
    #[error("{package}: nothing to build (no requirements and no seed image)")]
    NothingToBuild {
        /// The package.
        package: String,
    },

    /// A definition without a `build.toml`.
    #[error("{package}: no build recipe at {path}")]
    MissingRecipe {
        /// The package.
        package: String,
        /// Where the recipe was expected.
        path: String,
    },

    /// An image backend call failed.
    #[error("{package}: {stage} failed: {source}")]
    Backend {
        /// The package being built.
        package: String,
        /// Which build stage failed.
        stage: &'static str,
        /// The backend error.
        source: BackendError,
    },

    /// An `includes` entry is not a valid regex.
    #[error("{package}: invalid include pattern: {source}")]
    Include {
        /// The package being built.
        package: String,
        /// The regex error.
        source: regex::Error,
    },

    /// Solving the dependency tree failed.
    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    /// The dependency tree cannot be ordered.
    #[error("Ordering error: {0}")]
    Order(#[from] OrderError),

    /// A recipe could not be loaded.
    #[error("Recipe error: {0}")]
    Recipe(#[from] RecipeError),

    /// A definition lookup failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Packing the artifact failed.
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Writing artifact metadata failed.
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Preparing build directories failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings for a [`Compiler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOptions {
    /// Specs built at the same time by the parallel entry points.
    pub concurrency: usize,
    /// Keep ownership and modes when extracting image filesystems.
    pub keep_permissions: bool,
    /// Keep intermediate images that would otherwise be removed.
    pub keep_images: bool,
    /// Repository dependency images are tagged under.
    pub image_repository: String,
    /// Artifact compression.
    pub compression: CompressionType,
    /// Solver settings for dependency trees.
    pub solver: SolverOptions,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            keep_permissions: false,
            keep_images: false,
            image_repository: "cairn/cache".to_string(),
            compression: CompressionType::Gzip,
            solver: SolverOptions::default(),
        }
    }
}

/// Builds packages in container images and packages what their steps change.
///
/// Cloning is cheap and clones share their dependency-tree cache.
#[derive(Clone)]
pub struct Compiler {
    backend: Arc<dyn ImageBackend>,
    database: Arc<dyn PackageDatabase>,
    options: CompilerOptions,
    tree: Arc<DependencyTree>,
}

impl fmt::Debug for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Compiler {
    /// `database` holds the package definitions to build from.
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        database: Arc<dyn PackageDatabase>,
        options: CompilerOptions,
    ) -> Self {
        let tree = Arc::new(DependencyTree::new(
            Arc::clone(&database),
            options.solver.clone(),
        ));
        Self {
            backend,
            database,
            options,
            tree,
        }
    }

    /// Options this compiler was built with.
    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Load the definition and build recipe for `package`.
    pub fn from_package(&self, package: &Package) -> Result<CompilationSpec, CompileError> {
        let definition = self.database.find_package(&package.to_ref())?;
        let recipe_path = definition
            .rel(BUILD_FILE)
            .filter(|p| p.is_file())
            .ok_or_else(|| CompileError::MissingRecipe {
                package: definition.to_string(),
                path: definition
                    .rel(BUILD_FILE)
                    .map_or_else(|| BUILD_FILE.to_string(), |p| p.display().to_string()),
            })?;
        let recipe = BuildRecipe::from_file(&recipe_path)?;
        Ok(CompilationSpec::new(definition, recipe))
    }

    /// The ordered dependency tree of `spec`'s package, itself last, with
    /// build and package hashes attached to every entry.
    ///
    /// Only packages that must be present are returned.
    pub fn compute_dep_tree(
        &self,
        spec: &CompilationSpec,
    ) -> Result<PackagesAssertions, CompileError> {
        self.tree.compute(&spec.package)
    }

    /// Compute the dependency tree of `spec` and build it.
    pub fn compile(&self, spec: CompilationSpec) -> Result<Artifact, CompileError> {
        info!("Compiling {}", spec.package);
        let mut spec = spec;
        spec.source_assertion = self.compute_dep_tree(&spec)?;
        self.compile_spec(spec)
    }

    /// Build every spec with up to `concurrency` workers.
    ///
    /// One failing spec never stops the others; every artifact produced and
    /// every error raised is returned, in completion order.
    pub fn compile_parallel(&self, specs: CompilationSpecs) -> (Vec<Artifact>, Vec<CompileError>) {
        let (tx, rx) = mpsc::channel();
        for spec in specs {
            if tx.send(spec).is_err() {
                break;
            }
        }
        drop(tx);

        let queue = Mutex::new(rx);
        let artifacts = Mutex::new(Vec::new());
        let errors = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for worker in 0..self.options.concurrency.max(1) {
                let (queue, artifacts, errors) = (&queue, &artifacts, &errors);
                scope.spawn(move || {
                    loop {
                        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).recv();
                        let Ok(spec) = next else { break };
                        debug!("Worker {worker} picked up {}", spec.package);

                        match self.compile(spec) {
                            Ok(artifact) => artifacts
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(artifact),
                            Err(e) => {
                                error!("{e}");
                                errors.lock().unwrap_or_else(PoisonError::into_inner).push(e);
                            }
                        }
                    }
                });
            }
        });

        (
            artifacts.into_inner().unwrap_or_else(PoisonError::into_inner),
            errors.into_inner().unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Build `specs`, then rebuild every package that transitively requires
    /// one of the packages just built.
    pub fn compile_with_reverse_deps(
        &self,
        specs: CompilationSpecs,
    ) -> (Vec<Artifact>, Vec<CompileError>) {
        let output_path = specs
            .first()
            .map(|s| s.output_path.clone())
            .unwrap_or_default();
        let (mut artifacts, mut errors) = self.compile_parallel(specs.clone());

        let mut dependents = CompilationSpecs::new();
        for artifact in &artifacts {
            let revdeps = match self.database.revdeps(&artifact.spec.package) {
                Ok(revdeps) => revdeps,
                Err(e) => {
                    errors.push(e.into());
                    continue;
                }
            };
            for package in revdeps {
                match self.from_package(&package) {
                    Ok(spec) => dependents.add(spec.with_output_path(&output_path)),
                    Err(e) => errors.push(e),
                }
            }
        }

        let dependents = dependents.unique().remove(&specs);
        if dependents.is_empty() {
            return (artifacts, errors);
        }
        info!("Rebuilding {} reverse dependencies", dependents.len());

        let (more, more_errors) = self.compile_parallel(dependents);
        artifacts.extend(more);
        errors.extend(more_errors);
        (artifacts, errors)
    }

    fn image_tag(&self, hash: &str) -> String {
        format!("{}:{hash}", self.options.image_repository)
    }

    fn builder_tag(&self, hash: &str) -> String {
        format!("{}:builder-{hash}", self.options.image_repository)
    }

    /// Build `spec` from its computed dependency tree.
    fn compile_spec(&self, spec: CompilationSpec) -> Result<Artifact, CompileError> {
        if let Some(image) = spec.image().map(str::to_string) {
            let artifact = if spec.unpack() {
                self.package_from_image(spec, &image, None)?
            } else {
                self.compile_with_image(spec, &image, None, None)?
            };
            artifact.write_metadata(&artifact.spec.output_path)?;
            return Ok(artifact);
        }

        if spec.package.requires.is_empty() {
            return Err(CompileError::NothingToBuild {
                package: spec.package.to_string(),
            });
        }

        let dependencies = spec.source_assertion.drop_package(&spec.package);
        let total = dependencies.len();
        let mut built = Vec::with_capacity(total);
        let mut previous: Option<String> = None;

        for (idx, assertion) in dependencies.iter().enumerate() {
            let mut dependency = self
                .from_package(&assertion.package)?
                .with_output_path(&spec.output_path);
            dependency.source_assertion = spec.source_assertion.cut(&assertion.package);

            let builder_tag = self.builder_tag(&assertion.hash.build_hash);
            let package_tag = self.image_tag(&assertion.hash.package_hash);
            info!(
                "[{}/{total}] Building dependency {} as {package_tag}",
                idx + 1,
                assertion.package
            );

            let artifact = match dependency.image().map(str::to_string) {
                Some(image) if dependency.unpack() => {
                    self.package_from_image(dependency, &image, Some(&package_tag))?
                }
                Some(image) => self.compile_with_image(
                    dependency,
                    &image,
                    Some(&builder_tag),
                    Some(&package_tag),
                )?,
                None => {
                    let seed = previous.clone().ok_or_else(|| CompileError::NothingToBuild {
                        package: assertion.package.to_string(),
                    })?;
                    self.compile_with_image(
                        dependency,
                        &seed,
                        Some(&builder_tag),
                        Some(&package_tag),
                    )?
                }
            };
            artifact.write_metadata(&artifact.spec.output_path)?;
            previous = Some(package_tag);
            built.push(artifact);
        }

        let seed = previous.ok_or_else(|| CompileError::NothingToBuild {
            package: spec.package.to_string(),
        })?;
        info!("Building {} on top of {seed}", spec.package);
        let mut artifact = self.compile_with_image(spec, &seed, None, None)?;
        artifact.dependencies = built;
        artifact.write_metadata(&artifact.spec.output_path)?;
        Ok(artifact)
    }

    /// Run both build stages for `spec` on top of `image` and package what
    /// the steps changed.
    ///
    /// Tagged stages are kept so later builds can start from them; untagged
    /// ones are removed unless `keep_images` is set.
    fn compile_with_image(
        &self,
        spec: CompilationSpec,
        image: &str,
        builder_tag: Option<&str>,
        package_tag: Option<&str>,
    ) -> Result<Artifact, CompileError> {
        let spec = spec.with_image(image);
        let package = spec.package.to_string();
        let fingerprint = spec.fingerprint();
        let stage = |stage: &'static str| {
            let package = package.clone();
            move |source: BackendError| CompileError::Backend {
                package,
                stage,
                source,
            }
        };

        let keep_builder = builder_tag.is_some() || self.options.keep_images;
        let keep_package = package_tag.is_some() || self.options.keep_images;
        let builder_tag =
            builder_tag.map_or_else(|| format!("cairn/{fingerprint}-builder"), str::to_string);
        let package_tag = package_tag.map_or_else(|| format!("cairn/{fingerprint}"), str::to_string);

        fs::create_dir_all(&spec.output_path)?;
        let context = tempfile::Builder::new()
            .prefix("build")
            .tempdir_in(&spec.output_path)?;
        let images = tempfile::Builder::new()
            .prefix("images")
            .tempdir_in(&spec.output_path)?;
        if let Some(sources) = spec.package.definition_dir() {
            archive::copy_dir(sources, context.path())?;
        }

        let builder = BackendOptions {
            image_name: builder_tag,
            source_path: context.path().to_path_buf(),
            definition_file: format!("{fingerprint}-builder.dockerfile"),
            destination: images.path().join(format!("{fingerprint}-builder.image.tar")),
        };
        let runner = BackendOptions {
            image_name: package_tag,
            source_path: context.path().to_path_buf(),
            definition_file: format!("{fingerprint}.dockerfile"),
            destination: images.path().join(format!("{fingerprint}.image.tar")),
        };
        fs::write(
            context.path().join(&builder.definition_file),
            spec.builder_definition(),
        )?;
        fs::write(
            context.path().join(&runner.definition_file),
            spec.step_definition(&builder.image_name),
        )?;

        debug!("Building builder image {}", builder.image_name);
        self.backend
            .build_image(&builder)
            .map_err(stage("building builder image"))?;
        let _discard_builder = DiscardImage {
            backend: self.backend.as_ref(),
            opts: (!keep_builder).then(|| builder.clone()),
        };
        self.backend
            .export_image(&builder)
            .map_err(stage("exporting builder image"))?;

        debug!("Building package image {}", runner.image_name);
        if keep_package {
            self.backend
                .build_image(&runner)
                .and_then(|()| self.backend.export_image(&runner))
                .map_err(stage("building package image"))?;
        } else {
            self.backend
                .image_definition_to_tar(&runner)
                .map_err(stage("building package image"))?;
        }

        let changes = self
            .backend
            .changes(&builder.destination, &runner.destination)
            .map_err(stage("diffing images"))?;
        debug!("{package}: {} changed path(s)", changes.len());

        let rootfs = tempfile::Builder::new()
            .prefix("rootfs")
            .tempdir_in(&spec.output_path)?;
        self.backend
            .extract_rootfs(
                &BackendOptions {
                    source_path: runner.destination.clone(),
                    destination: rootfs.path().to_path_buf(),
                    ..BackendOptions::default()
                },
                self.options.keep_permissions,
            )
            .map_err(stage("extracting package image"))?;

        let includes = spec
            .include_patterns()
            .map_err(|source| CompileError::Include {
                package: package.clone(),
                source,
            })?;
        let compression = self.options.compression;
        let archive_path = spec.rel(&format!(
            "{fingerprint}.package.tar{}",
            compression.extension()
        ));
        extract_artifact_from_delta(
            rootfs.path(),
            &archive_path,
            &changes,
            &includes,
            compression,
        )?;

        info!("Built {package} -> {}", archive_path.display());
        Ok(Artifact::new(archive_path, spec, compression))
    }

    /// Package an image's whole filesystem as `spec`'s artifact.
    fn package_from_image(
        &self,
        spec: CompilationSpec,
        image: &str,
        tag: Option<&str>,
    ) -> Result<Artifact, CompileError> {
        let package = spec.package.to_string();
        let fingerprint = spec.fingerprint();
        let stage = |stage: &'static str| {
            let package = package.clone();
            move |source: BackendError| CompileError::Backend {
                package,
                stage,
                source,
            }
        };

        fs::create_dir_all(&spec.output_path)?;
        let images = tempfile::Builder::new()
            .prefix("images")
            .tempdir_in(&spec.output_path)?;
        let source = BackendOptions {
            image_name: image.to_string(),
            destination: images.path().join(format!("{fingerprint}.image.tar")),
            ..BackendOptions::default()
        };
        self.backend
            .download_image(&source)
            .map_err(stage("pulling image"))?;
        if let Some(tag) = tag {
            self.backend
                .copy_image(image, tag)
                .map_err(stage("tagging image"))?;
        }

        self.backend
            .export_image(&source)
            .map_err(stage("exporting image"))?;

        let rootfs = tempfile::Builder::new()
            .prefix("rootfs")
            .tempdir_in(&spec.output_path)?;
        self.backend
            .extract_rootfs(
                &BackendOptions {
                    source_path: source.destination.clone(),
                    destination: rootfs.path().to_path_buf(),
                    ..BackendOptions::default()
                },
                self.options.keep_permissions,
            )
            .map_err(stage("extracting image"))?;

        let compression = self.options.compression;
        let archive_path = spec.rel(&format!(
            "{fingerprint}.package.tar{}",
            compression.extension()
        ));
        archive::tar_with(rootfs.path(), &archive_path, compression)?;

        info!("Unpacked {image} into {}", archive_path.display());
        Ok(Artifact::new(archive_path, spec.with_image(image), compression))
    }
}

/// Removes an intermediate image when dropped, whichever way the build ends.
///
/// Removal failures are only logged.
struct DiscardImage<'a> {
    backend: &'a dyn ImageBackend,
    opts: Option<BackendOptions>,
}

impl Drop for DiscardImage<'_> {
    fn drop(&mut self) {
        if let Some(opts) = self.opts.take() {
            if let Err(e) = self.backend.remove_image(&opts) {
                warn!("Could not remove {}: {e}", opts.image_name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = CompilerOptions::default();
        assert!(options.concurrency >= 1);
        assert_eq!(options.image_repository, "cairn/cache");
        assert_eq!(options.compression, CompressionType::Gzip);
        assert!(!options.keep_images);
    }

    #[test]
    fn test_nothing_to_build_error_names_package() {
        let err = CompileError::NothingToBuild {
            package: "test/a-1.0".into(),
        };
        assert!(err.to_string().starts_with("test/a-1.0: nothing to build"));
    }
}
