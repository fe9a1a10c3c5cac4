//! Build command
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use cairn_core::config::DatabaseEngine;
use cairn_core::{
    BackendKind, CairnConfig, CompilationSpecs, Compiler, CompilerOptions, PackageDatabase, tree,
};
use cairn_schema::{CompressionType, Package};
use tracing::debug;

use crate::BuildArgs;

/// Build the requested packages (or the whole tree) into `--destination`.
pub async fn build(args: BuildArgs, config: &CairnConfig) -> Result<()> {
    let backend_kind: BackendKind = args.backend.parse()?;
    let engine: DatabaseEngine = args.database.parse()?;
    let compression: CompressionType = args.compression.parse()?;

    let mut solver = config.solver.clone();
    if let Some(strategy) = &args.solver_strategy {
        solver.strategy = strategy.parse()?;
    }
    if let Some(attempts) = args.solver_attempts {
        solver.max_attempts = attempts;
    }

    let scratch_root = cairn_core::tmp_path();
    std::fs::create_dir_all(&scratch_root)
        .with_context(|| format!("Failed to create {}", scratch_root.display()))?;
    let scratch = tempfile::Builder::new()
        .prefix("tree")
        .tempdir_in(&scratch_root)?;
    let database: Arc<dyn PackageDatabase> = engine
        .open(&scratch.path().join("tree.db"))
        .context("Failed to open definitions database")?;

    tree::load_tree(&args.tree, database.as_ref())
        .with_context(|| format!("Failed to load tree {}", args.tree.display()))?;

    let packages: Vec<Package> = if args.all {
        database.world()?
    } else {
        super::parse_refs(&args.packages)?
            .iter()
            .map(|r| database.find_package(r).with_context(|| format!("Unknown package {r}")))
            .collect::<Result<_>>()?
    };
    if packages.is_empty() {
        bail!("Nothing to build in {}", args.tree.display());
    }

    let backend = backend_kind
        .build()
        .with_context(|| format!("Backend {backend_kind} is not usable"))?;
    let compiler = Compiler::new(
        backend,
        Arc::clone(&database),
        CompilerOptions {
            concurrency: args.concurrency.unwrap_or(config.general.concurrency),
            keep_permissions: args.privileged,
            keep_images: args.keep_images,
            image_repository: args.image_repository,
            compression,
            solver,
        },
    );

    let mut specs = CompilationSpecs::new();
    for package in &packages {
        let spec = compiler
            .from_package(package)
            .with_context(|| format!("Cannot build {package}"))?;
        specs.add(spec.with_output_path(&args.destination));
    }
    let requested = specs.len();
    debug!(
        "{requested} spec(s), {} worker(s), revdeps: {}",
        compiler.options().concurrency,
        args.revdeps
    );

    let revdeps = args.revdeps;
    let (artifacts, errors) = tokio::task::spawn_blocking(move || {
        if revdeps {
            compiler.compile_with_reverse_deps(specs)
        } else {
            compiler.compile_parallel(specs)
        }
    })
    .await?;

    for artifact in &artifacts {
        println!("  {} -> {}", artifact.spec.package, artifact.path.display());
    }
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("  error: {error}");
        }
        bail!("{} build(s) failed", errors.len());
    }

    println!(
        "Built {} package(s) ({requested} requested) into {}",
        artifacts.len(),
        args.destination.display()
    );
    Ok(())
}
