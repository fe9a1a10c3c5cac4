//! Upgrade command
use anyhow::{Context, Result};
use cairn_core::CairnConfig;

/// Upgrade every installed package with a newer version in the repositories.
pub async fn upgrade(config: &CairnConfig) -> Result<()> {
    let system = super::system(config)?;
    let installer = super::synced_installer(config).await?;

    let installed = installer
        .upgrade(&system)
        .await
        .context("Upgrade failed")?;

    if installed.is_empty() {
        println!("Everything is up to date");
    } else {
        for package in &installed {
            println!("  ^ {package}");
        }
    }
    Ok(())
}
