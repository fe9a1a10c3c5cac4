//! Shared types for cairn.
//!
//! Everything in here is plain data: package definitions and the references
//! between them, solver assertions, build recipes and the metadata written
//! next to every artifact. The engine in `cairn-core` operates on these.

pub mod artifact;
pub mod assertion;
pub mod hash;
pub mod package;
pub mod recipe;

pub use artifact::{
    ArtifactDependency, ArtifactMetadata, ChangeKind, CompressionType, LayerChange,
    MetadataError,
};
pub use assertion::{OrderError, PackageAssert, PackageHash, PackagesAssertions};
pub use hash::Sha256Hash;
pub use package::{Package, PackageParseError, PackageRef, compare_versions};
pub use recipe::{BuildRecipe, RecipeError};

/// File holding a package definition inside a tree.
pub const DEFINITION_FILE: &str = "definition.toml";

/// File holding the build recipe beside a definition.
pub const BUILD_FILE: &str = "build.toml";
