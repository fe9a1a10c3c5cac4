#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cairn_core::backend::{BackendError, BackendOptions, ImageBackend};
use cairn_core::{InMemoryDatabase, tree};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Files of one layer; paths are relative to the image root.
type Files = Vec<(String, Vec<u8>)>;

#[derive(Clone)]
struct Layer {
    id: String,
    files: Files,
}

/// An image builder that never leaves the process.
///
/// Images are lists of layers held in memory and exported in the
/// `docker save` layout, so the real layer diffing and rootfs extraction run
/// against them. Definitions understand `FROM`, `COPY . <dir>` and `RUN`,
/// where a command is either `echo <text> > <path>` or `fail`. Unknown base
/// images are "pulled" on first use as a single-file filesystem.
#[derive(Default)]
pub struct FakeBackend {
    images: Mutex<HashMap<String, Vec<Layer>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.images.lock().unwrap().contains_key(name)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn image(&self, name: &str) -> Result<Vec<Layer>, BackendError> {
        let mut images = self.images.lock().unwrap();
        if let Some(layers) = images.get(name) {
            return Ok(layers.clone());
        }
        if name.starts_with("cairn/") {
            return Err(BackendError::Command {
                command: format!("fake pull {name}"),
                status: "exit status: 1".into(),
                stderr: format!("image {name} not found"),
            });
        }
        let base = vec![layer(None, vec![("etc/os-release".into(), name.as_bytes().to_vec())])];
        images.insert(name.to_string(), base.clone());
        Ok(base)
    }
}

fn layer(parent: Option<&Layer>, files: Files) -> Layer {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.id.as_bytes());
    }
    for (path, data) in &files {
        hasher.update(path.as_bytes());
        hasher.update(data);
    }
    Layer {
        id: hex::encode(hasher.finalize()),
        files,
    }
}

fn run(command: &str) -> Result<Files, BackendError> {
    if command == "fail" {
        return Err(BackendError::Command {
            command: format!("RUN {command}"),
            status: "exit status: 1".into(),
            stderr: "step failed".into(),
        });
    }
    let Some((text, path)) = command
        .strip_prefix("echo ")
        .and_then(|rest| rest.split_once(" > "))
    else {
        return Ok(Vec::new());
    };
    Ok(vec![(
        path.trim_start_matches('/').to_string(),
        format!("{text}\n").into_bytes(),
    )])
}

fn copy_context(context: &Path, dest: &str) -> Files {
    let dest = dest.trim_matches('/');
    WalkDir::new(context)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(context).unwrap().to_string_lossy().into_owned();
            (format!("{dest}/{relative}"), fs::read(e.path()).unwrap())
        })
        .collect()
}

fn layer_tar(files: &Files) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, data.as_slice()).unwrap();
    }
    builder.into_inner().unwrap()
}

impl ImageBackend for FakeBackend {
    fn build_image(&self, opts: &BackendOptions) -> Result<(), BackendError> {
        let definition = fs::read_to_string(opts.source_path.join(&opts.definition_file))?;
        let mut layers: Vec<Layer> = Vec::new();

        for line in definition.lines() {
            let (instruction, argument) = line.split_once(' ').unwrap_or((line, ""));
            let files = match instruction {
                "FROM" => {
                    layers = self.image(argument)?;
                    continue;
                }
                "COPY" => {
                    let dest = argument.split_whitespace().last().unwrap_or("/");
                    copy_context(&opts.source_path, dest)
                }
                "RUN" => run(argument)?,
                _ => continue,
            };
            let next = layer(layers.last(), files);
            layers.push(next);
        }

        self.record(format!("build {}", opts.image_name));
        self.images
            .lock()
            .unwrap()
            .insert(opts.image_name.clone(), layers);
        Ok(())
    }

    fn export_image(&self, opts: &BackendOptions) -> Result<(), BackendError> {
        let layers = self.image(&opts.image_name)?;
        let names: Vec<String> = layers.iter().map(|l| format!("{}/layer.tar", l.id)).collect();
        let manifest = serde_json::json!([{
            "Config": "config.json",
            "RepoTags": [opts.image_name],
            "Layers": names,
        }]);

        let mut builder = tar::Builder::new(File::create(&opts.destination)?);
        let mut append = |name: &str, data: &[u8]| -> std::io::Result<()> {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, data)
        };
        append("manifest.json", &serde_json::to_vec(&manifest)?)?;
        for (name, layer) in names.iter().zip(&layers) {
            append(name, &layer_tar(&layer.files))?;
        }
        builder.into_inner()?;

        self.record(format!("export {}", opts.image_name));
        Ok(())
    }

    fn download_image(&self, opts: &BackendOptions) -> Result<(), BackendError> {
        self.image(&opts.image_name)?;
        self.record(format!("pull {}", opts.image_name));
        Ok(())
    }

    fn copy_image(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        let layers = self.image(src)?;
        self.images.lock().unwrap().insert(dst.to_string(), layers);
        self.record(format!("tag {src} {dst}"));
        Ok(())
    }

    fn remove_image(&self, opts: &BackendOptions) -> Result<(), BackendError> {
        self.images.lock().unwrap().remove(&opts.image_name);
        self.record(format!("rm {}", opts.image_name));
        Ok(())
    }
}

/// A package tree on disk, loaded into a definitions database.
pub struct TestTree {
    pub dir: TempDir,
    pub db: Arc<InMemoryDatabase>,
}

impl TestTree {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            db: Arc::new(InMemoryDatabase::new()),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("tree")
    }

    pub fn output(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    /// Add `test/<name>-1.0` requiring `requires` with the given
    /// `build.toml` body.
    pub fn package(&self, name: &str, requires: &[&str], recipe: &str) -> &Self {
        let dir = self.root().join(name);
        fs::create_dir_all(&dir).unwrap();

        let mut definition = format!("name = \"{name}\"\ncategory = \"test\"\nversion = \"1.0\"\n");
        for req in requires {
            definition.push_str(&format!("\n[[requires]]\ncategory = \"test\"\nname = \"{req}\"\n"));
        }
        fs::write(dir.join("definition.toml"), definition).unwrap();
        fs::write(dir.join("build.toml"), recipe).unwrap();
        self
    }

    /// Load everything written so far.
    pub fn load(&self) -> &Self {
        tree::load_tree(&self.root(), self.db.as_ref()).unwrap();
        self
    }
}

/// Relative paths of the regular files inside an artifact archive.
pub fn archive_files(path: &Path) -> Vec<String> {
    let scratch = TempDir::new().unwrap();
    let mut files = cairn_core::archive::untar(path, scratch.path(), false).unwrap();
    files.sort();
    files
}
