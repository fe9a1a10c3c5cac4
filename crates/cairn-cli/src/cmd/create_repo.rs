//! Create-repo command
use std::fs;

use anyhow::{Context, Result};
use cairn_core::config::RepositoryKind;
use cairn_core::installer::generate_repository;
use cairn_schema::ArtifactMetadata;

use crate::CreateRepoArgs;

/// Index the artifacts under `--packages` and write the repository.
///
/// With a separate `--output`, archives and metadata are copied there first.
pub fn create_repo(args: &CreateRepoArgs) -> Result<()> {
    let kind: RepositoryKind = args.kind.parse()?;
    let output = args.output.as_ref().unwrap_or(&args.packages);

    let index = generate_repository(&args.name, kind, args.urls.clone(), &args.packages)
        .with_context(|| format!("Failed to index {}", args.packages.display()))?;

    if output != &args.packages {
        fs::create_dir_all(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        for artifact in &index.artifacts {
            let metadata = ArtifactMetadata::file_name(&artifact.package.fingerprint());
            for file in [artifact.path.as_str(), metadata.as_str()] {
                fs::copy(args.packages.join(file), output.join(file))
                    .with_context(|| format!("Failed to copy {file}"))?;
            }
        }
    }

    let path = index
        .write(output, args.tree.as_deref())
        .context("Failed to write repository index")?;
    println!(
        "Repository {} revision {} ({} packages) -> {}",
        index.name,
        index.revision,
        index.artifacts.len(),
        path.display()
    );
    Ok(())
}
