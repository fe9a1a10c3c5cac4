//! Integration tests for the `cairn` CLI binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// A scratch cairn home with a configuration installing into a scratch root.
struct TestContext {
    temp_dir: TempDir,
    cairn_home: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let cairn_home = temp_dir.path().join(".cairn");
        fs::create_dir_all(&cairn_home).expect("failed to create cairn home");

        let rootfs = temp_dir.path().join("rootfs");
        fs::write(
            cairn_home.join("config.toml"),
            format!("[system]\nrootfs = {:?}\n", rootfs.display().to_string()),
        )
        .expect("failed to write config");

        Self {
            temp_dir,
            cairn_home,
        }
    }

    fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    fn cairn(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_cairn"));
        cmd.env("HOME", self.temp_dir.path());
        cmd.env("CAIRN_HOME", &self.cairn_home);
        cmd.env_remove("CAIRN_CONFIG");
        cmd.env_remove("RUST_LOG");
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.cairn().args(args).output().expect("failed to run cairn")
    }

    /// Write `test/<name>-1.0` requiring `requires` under `tree/`.
    fn package(&self, name: &str, requires: &[&str]) {
        let dir = self.path().join("tree").join(name);
        fs::create_dir_all(&dir).unwrap();
        let mut definition = format!("name = \"{name}\"\ncategory = \"test\"\nversion = \"1.0\"\n");
        for req in requires {
            definition.push_str(&format!("\n[[requires]]\ncategory = \"test\"\nname = \"{req}\"\n"));
        }
        fs::write(dir.join("definition.toml"), definition).unwrap();
    }
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.run(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("create-repo"));
}

#[test]
fn test_version_command() {
    let ctx = TestContext::new();
    let output = ctx.run(&["--version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("cairn"));
}

#[test]
fn test_tree_prints_build_order() {
    let ctx = TestContext::new();
    ctx.package("base", &[]);
    ctx.package("lib", &["base"]);
    ctx.package("app", &["lib"]);

    let tree = ctx.path().join("tree");
    let output = ctx.run(&["tree", "test/app", "--tree", tree.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let packages: Vec<&str> = stdout
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .collect();
    assert_eq!(packages, ["test/base-1.0", "test/lib-1.0", "test/app-1.0"]);
    assert!(stdout.lines().all(|l| l.contains("build ") && l.contains("package ")));
}

#[test]
fn test_tree_unknown_package() {
    let ctx = TestContext::new();
    ctx.package("base", &[]);

    let tree = ctx.path().join("tree");
    let output = ctx.run(&["tree", "test/nope", "--tree", tree.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("test/nope"));
}

#[test]
fn test_create_repo_bumps_revision() {
    let ctx = TestContext::new();
    let packages = ctx.path().join("packages");
    fs::create_dir_all(&packages).unwrap();

    for expected in [1, 2] {
        let output = ctx.run(&[
            "create-repo",
            "--name",
            "main",
            "--packages",
            packages.to_str().unwrap(),
            "--urls",
            packages.to_str().unwrap(),
        ]);
        assert!(
            output.status.success(),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        let index: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(packages.join("repository.json")).unwrap())
                .unwrap();
        assert_eq!(index["name"], "main");
        assert_eq!(index["type"], "local");
        assert_eq!(index["revision"], expected);
        assert_eq!(index["artifacts"].as_array().unwrap().len(), 0);
    }
}

#[test]
fn test_install_rejects_bad_reference() {
    let ctx = TestContext::new();
    let output = ctx.run(&["install", "no-category"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid package"));
}

#[test]
fn test_install_unknown_package_fails() {
    let ctx = TestContext::new();
    let output = ctx.run(&["install", "test/missing"]);
    assert!(!output.status.success());
    assert!(!ctx.path().join("rootfs").exists());
}

#[test]
fn test_build_unknown_backend() {
    let ctx = TestContext::new();
    let output = ctx.run(&["build", "--all", "--backend", "podman"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("podman"));
}
