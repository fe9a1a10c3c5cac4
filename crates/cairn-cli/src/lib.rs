//! cairn - build packages in containers and install them
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! # Overview
//!
//! Package definitions live in a tree of directories, each holding a
//! `definition.toml` and a `build.toml`. `cairn build` resolves a package's
//! dependencies, builds each one in a container image on top of the previous
//! one and keeps only the files every build step changed. The resulting
//! archives are published with `cairn create-repo` and installed with
//! `cairn install`.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.cairn/
//! ├── config.toml  # General, solver, system and repository settings
//! ├── cache/       # Repository indexes and downloaded artifacts
//! └── system.db    # Installed packages and their files
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub mod cmd;

#[derive(Debug, Parser)]
#[command(name = "cairn")]
#[command(author, version, about = "Build packages in containers and install them", long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.cairn/config.toml)
    #[arg(long, global = true, env = "CAIRN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build packages from a tree
    Build(BuildArgs),
    /// Print the ordered dependency tree of a package with its hashes
    Tree {
        /// Package: category/name or category/name-version
        package: String,
        /// Package tree to read definitions from
        #[arg(long, default_value = ".")]
        tree: PathBuf,
    },
    /// Install packages from the configured repositories
    Install {
        /// Packages: category/name or category/name-version
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Remove installed packages and everything depending on them
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Replace installed packages that have newer versions
    Upgrade,
    /// Generate a repository index from built artifacts
    CreateRepo(CreateRepoArgs),
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Packages: category/name or category/name-version
    #[arg(required_unless_present = "all")]
    pub packages: Vec<String>,

    /// Package tree to read definitions from
    #[arg(long, default_value = ".")]
    pub tree: PathBuf,

    /// Where archives and metadata are written
    #[arg(long, default_value = "build")]
    pub destination: PathBuf,

    /// Image backend: docker or img
    #[arg(long, default_value = "docker")]
    pub backend: String,

    /// Definitions database: memory or sqlite
    #[arg(long, default_value = "memory")]
    pub database: String,

    /// Also rebuild every package depending on the ones built
    #[arg(long)]
    pub revdeps: bool,

    /// Build every package in the tree
    #[arg(long, conflicts_with = "packages")]
    pub all: bool,

    /// Keep ownership and modes of the files produced
    #[arg(long)]
    pub privileged: bool,

    /// Keep intermediate images
    #[arg(long)]
    pub keep_images: bool,

    /// Artifact compression: none or gzip
    #[arg(long, default_value = "gzip")]
    pub compression: String,

    /// Packages built at once (default: general.concurrency)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// strict or relaxed (default: solver.strategy)
    #[arg(long)]
    pub solver_strategy: Option<String>,

    /// Re-solves the relaxed strategy may run (default: solver.max_attempts)
    #[arg(long)]
    pub solver_attempts: Option<usize>,

    /// Repository dependency images are tagged under
    #[arg(long, default_value = "cairn/cache")]
    pub image_repository: String,
}

#[derive(Debug, Args)]
pub struct CreateRepoArgs {
    /// Repository name
    #[arg(long)]
    pub name: String,

    /// Repository type: local or http
    #[arg(long = "type", default_value = "local")]
    pub kind: String,

    /// Locations clients fetch from, tried in order
    #[arg(long, num_args = 1..)]
    pub urls: Vec<String>,

    /// Directory holding built artifacts and their metadata
    #[arg(long, default_value = "build")]
    pub packages: PathBuf,

    /// Directory the repository is written to (default: --packages)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Package tree to publish alongside the index
    #[arg(long)]
    pub tree: Option<PathBuf>,
}
