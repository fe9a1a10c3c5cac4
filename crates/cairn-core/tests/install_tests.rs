//! Integration tests for cairn-core installation.

mod common;

use std::fs;
use std::sync::Arc;

use cairn_core::config::{RepositoryConfig, RepositoryKind};
use cairn_core::installer::{Installer, InstallerOptions, System, generate_repository};
use cairn_core::{Compiler, CompilerOptions, InMemoryDatabase, PackageDatabase};
use cairn_schema::{CompressionType, Package, PackageRef};
use common::{FakeBackend, TestTree};

#[tokio::test]
async fn test_build_publish_install() {
    let tree = TestTree::new();
    tree.package(
        "runtime",
        &[],
        "image = \"alpine\"\nsteps = [\"echo 1 > /usr/lib/libruntime\"]\n",
    )
    .package("app", &["runtime"], "steps = [\"echo 2 > /usr/bin/app\"]\n")
    .load();

    let compiler = Compiler::new(
        FakeBackend::new(),
        tree.db.clone(),
        CompilerOptions {
            compression: CompressionType::Gzip,
            ..CompilerOptions::default()
        },
    );
    let spec = compiler
        .from_package(&Package::new("test", "app", "1.0"))
        .unwrap()
        .with_output_path(tree.output());
    let output = tree.output();
    let artifact = tokio::task::spawn_blocking(move || compiler.compile(spec))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.dependencies.len(), 1);

    let repo_dir = output.clone();
    let index = generate_repository(
        "built",
        RepositoryKind::Local,
        vec![repo_dir.display().to_string()],
        &repo_dir,
    )
    .unwrap();
    assert_eq!(index.artifacts.len(), 2);
    index.write(&repo_dir, Some(&tree.root())).unwrap();

    let mut installer = Installer::new(InstallerOptions {
        cache_dir: tree.dir.path().join("cache"),
        ..InstallerOptions::default()
    });
    installer
        .sync_repositories(&[RepositoryConfig {
            name: "built".into(),
            kind: RepositoryKind::Local,
            urls: vec![repo_dir.display().to_string()],
            enable: true,
            priority: 0,
            auth: None,
        }])
        .await
        .unwrap();

    let system = System {
        database: Arc::new(InMemoryDatabase::new()),
        target: tree.dir.path().join("rootfs"),
    };
    let installed = installer
        .install(&[PackageRef::any("test", "app")], &system)
        .await
        .unwrap();

    let names: Vec<_> = installed.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["runtime", "app"]);
    assert_eq!(
        fs::read_to_string(system.target.join("usr/bin/app")).unwrap(),
        "2\n"
    );
    assert_eq!(
        fs::read_to_string(system.target.join("usr/lib/libruntime")).unwrap(),
        "1\n"
    );
    assert_eq!(system.database.world().unwrap().len(), 2);
}
