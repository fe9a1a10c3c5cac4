//! Tree command
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cairn_core::{CairnConfig, DependencyTree, InMemoryDatabase, PackageDatabase, tree};
use cairn_schema::PackageRef;

/// Print the build order of `package` with the hashes its images are cached under.
pub fn tree(package: &str, tree_dir: &Path, config: &CairnConfig) -> Result<()> {
    let reference: PackageRef = package
        .parse()
        .with_context(|| format!("Invalid package '{package}'"))?;

    let database = Arc::new(InMemoryDatabase::new());
    tree::load_tree(tree_dir, database.as_ref())
        .with_context(|| format!("Failed to load tree {}", tree_dir.display()))?;
    let package = database
        .find_package(&reference)
        .with_context(|| format!("Unknown package {reference}"))?;

    let assertions = DependencyTree::new(database, config.solver.clone()).compute(&package)?;
    for assertion in &assertions {
        println!(
            "{}  build {}  package {}",
            assertion.package,
            short(&assertion.hash.build_hash),
            short(&assertion.hash.package_hash)
        );
    }
    Ok(())
}

fn short(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}
