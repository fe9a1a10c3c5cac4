//! cairn CLI

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cairn_cli::cmd;
use cairn_cli::{Cli, Commands};
use cairn_core::CairnConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Repository directories are read once logging is up so their warnings show.
    let mut config = match &cli.config {
        Some(path) => CairnConfig::read(path),
        None => CairnConfig::read_default(),
    }
    .context("Failed to load configuration")?;

    let level = if cli.debug || config.general.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    config.load_repository_dirs();

    match cli.command {
        Commands::Build(args) => cmd::build::build(args, &config).await,
        Commands::Tree { package, tree } => cmd::tree::tree(&package, &tree, &config),
        Commands::Install { packages } => cmd::install::install(&packages, &config).await,
        Commands::Uninstall { packages } => cmd::uninstall::uninstall(&packages, &config),
        Commands::Upgrade => cmd::upgrade::upgrade(&config).await,
        Commands::CreateRepo(args) => cmd::create_repo::create_repo(&args),
    }
}
