//! Subcommand implementations

pub mod build;
pub mod create_repo;
pub mod install;
pub mod tree;
pub mod uninstall;
pub mod upgrade;

use anyhow::{Context, Result};
use cairn_core::CairnConfig;
use cairn_core::installer::{Installer, InstallerOptions, System};
use cairn_schema::PackageRef;

/// Parse `category/name[-version]` arguments.
pub(crate) fn parse_refs(packages: &[String]) -> Result<Vec<PackageRef>> {
    packages
        .iter()
        .map(|p| {
            p.parse::<PackageRef>()
                .with_context(|| format!("Invalid package '{p}'"))
        })
        .collect()
}

/// The installed system described by `config`.
pub(crate) fn system(config: &CairnConfig) -> Result<System> {
    let database = config.system.open_database().with_context(|| {
        format!(
            "Failed to open system database {}",
            config.system.database_path.display()
        )
    })?;
    Ok(System {
        database,
        target: config.system.rootfs.clone(),
    })
}

pub(crate) fn installer(config: &CairnConfig) -> Installer {
    Installer::new(InstallerOptions {
        concurrency: config.general.concurrency,
        solver: config.solver.clone(),
        cache_dir: config.system.pkgs_cache_path.clone(),
        preserve_ownership: false,
    })
}

/// An installer with every enabled repository synced.
pub(crate) async fn synced_installer(config: &CairnConfig) -> Result<Installer> {
    let mut installer = installer(config);
    installer
        .sync_repositories(&config.enabled_repositories())
        .await
        .context("Failed to sync repositories")?;
    Ok(installer)
}
