//! Install command
use anyhow::{Context, Result};
use cairn_core::CairnConfig;

/// Install packages and their requirements into the configured root.
pub async fn install(packages: &[String], config: &CairnConfig) -> Result<()> {
    let refs = super::parse_refs(packages)?;
    let system = super::system(config)?;
    let installer = super::synced_installer(config).await?;

    let installed = installer
        .install(&refs, &system)
        .await
        .context("Install failed")?;

    if installed.is_empty() {
        println!("Nothing to do");
        return Ok(());
    }
    for package in &installed {
        println!("  + {package}");
    }
    println!(
        "Installed {} package(s) into {}",
        installed.len(),
        system.target.display()
    );
    Ok(())
}
