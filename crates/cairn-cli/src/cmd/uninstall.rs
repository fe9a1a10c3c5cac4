//! Uninstall command
use anyhow::{Context, Result};
use cairn_core::CairnConfig;

/// Remove packages, dependents first.
pub fn uninstall(packages: &[String], config: &CairnConfig) -> Result<()> {
    let refs = super::parse_refs(packages)?;
    let system = super::system(config)?;
    let installer = super::installer(config);

    for reference in &refs {
        let removed = installer
            .uninstall(reference, &system)
            .with_context(|| format!("Failed to uninstall {reference}"))?;
        for package in &removed {
            println!("  - {package}");
        }
    }
    Ok(())
}
