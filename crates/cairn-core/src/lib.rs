//! Engine behind the `cairn` CLI: package databases, the dependency solver,
//! container-backed build orchestration and the artifact installer.

pub mod archive;
pub mod backend;
pub mod compiler;
pub mod config;
pub mod database;
pub mod installer;
pub mod paths;
pub mod solver;
pub mod tree;

pub use backend::{BackendKind, ImageBackend};
pub use compiler::{
    Artifact, CompilationSpec, CompilationSpecs, Compiler, CompilerOptions, DependencyTree,
};
pub use config::CairnConfig;
pub use database::{InMemoryDatabase, PackageDatabase, SqliteDatabase};
pub use paths::*;
pub use solver::{Solver, SolverOptions, SolverStrategy};

/// User Agent string for repository requests
pub const USER_AGENT: &str = concat!("cairn/", env!("CARGO_PKG_VERSION"));
