//! Reading exported image archives.
//!
//! Both backends export the `docker save` layout: a tar holding
//! `manifest.json` and one tar per layer (optionally gzip-compressed).
//! Deletions inside a layer are `.wh.<name>` whiteout entries, and
//! `.wh..wh..opq` marks a directory whose lower contents are hidden.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use cairn_schema::{ChangeKind, LayerChange};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tempfile::TempDir;
use tracing::debug;

use super::BackendError;
use crate::archive::sanitize;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    layers: Vec<String>,
}

/// An exported image unpacked to a scratch directory.
struct ImageArchive {
    root: TempDir,
    layers: Vec<String>,
}

impl ImageArchive {
    fn open(archive: &Path) -> Result<Self, BackendError> {
        let root = tempfile::Builder::new().prefix("image").tempdir()?;
        tar::Archive::new(BufReader::new(File::open(archive)?)).unpack(root.path())?;

        let manifest = root.path().join("manifest.json");
        let data = fs::read(&manifest).map_err(|_| BackendError::InvalidImage {
            path: archive.to_path_buf(),
            reason: "missing manifest.json".to_string(),
        })?;
        let entries: Vec<ManifestEntry> = serde_json::from_slice(&data)?;
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::InvalidImage {
                path: archive.to_path_buf(),
                reason: "empty manifest".to_string(),
            })?;

        Ok(Self {
            root,
            layers: entry.layers,
        })
    }

    fn layer(&self, name: &str) -> Result<tar::Archive<Box<dyn Read>>, BackendError> {
        let path = self.root.path().join(name);
        let mut file = File::open(&path)?;
        let mut magic = [0u8; 2];
        let gzipped = file.read(&mut magic)? == 2 && magic == [0x1f, 0x8b];
        file.seek(SeekFrom::Start(0))?;

        let reader: Box<dyn Read> = if gzipped {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(tar::Archive::new(reader))
    }
}

enum LayerEntry {
    Opaque(PathBuf),
    Whiteout(PathBuf),
    Dir(PathBuf),
    File(PathBuf, u64),
}

fn classify(path: &Path, is_dir: bool, size: u64) -> Result<Option<LayerEntry>, BackendError> {
    let path = sanitize(path)?;
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();

    Ok(Some(if name == OPAQUE_MARKER {
        LayerEntry::Opaque(parent)
    } else if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
        LayerEntry::Whiteout(parent.join(hidden))
    } else if is_dir {
        LayerEntry::Dir(path)
    } else {
        LayerEntry::File(path, size)
    }))
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Every file touched by the layers `new` has on top of `old`.
///
/// `new` is expected to be built from `old`. Layers are matched by name; if
/// the two exports share no layer names the first `old.layers.len()` layers
/// of `new` are taken to be the shared base. Directories are not reported.
pub fn changes(old: &Path, new: &Path) -> Result<Vec<LayerChange>, BackendError> {
    let before = ImageArchive::open(old)?;
    let after = ImageArchive::open(new)?;

    let shared: HashSet<&String> = before.layers.iter().collect();
    let mut added: Vec<&String> = after.layers.iter().filter(|l| !shared.contains(l)).collect();
    if added.len() == after.layers.len() && after.layers.len() > before.layers.len() {
        added = after.layers[before.layers.len()..].iter().collect();
    }
    debug!(
        "Diffing {} new layer(s) of {} against {}",
        added.len(),
        new.display(),
        old.display()
    );

    let mut existing = HashSet::new();
    for layer in &before.layers {
        for entry in before.layer(layer)?.entries()? {
            let entry = entry?;
            let is_dir = entry.header().entry_type().is_dir();
            match classify(&entry.path()?, is_dir, 0)? {
                Some(LayerEntry::File(path, _)) => {
                    existing.insert(key(&path));
                }
                Some(LayerEntry::Whiteout(path)) => {
                    let gone = key(&path);
                    existing.retain(|p: &String| p != &gone && !p.starts_with(&format!("{gone}/")));
                }
                _ => {}
            }
        }
    }

    let mut diff: BTreeMap<String, LayerChange> = BTreeMap::new();
    for layer in added {
        for entry in after.layer(layer)?.entries()? {
            let entry = entry?;
            let is_dir = entry.header().entry_type().is_dir();
            let size = entry.header().size()?;
            match classify(&entry.path()?, is_dir, size)? {
                Some(LayerEntry::File(path, size)) => {
                    let path = key(&path);
                    let kind = match diff.get(&path) {
                        Some(prev) if prev.kind == ChangeKind::Added => ChangeKind::Added,
                        _ if existing.contains(&path) => ChangeKind::Modified,
                        Some(_) => ChangeKind::Modified,
                        None => ChangeKind::Added,
                    };
                    diff.insert(path.clone(), LayerChange { path, kind, size });
                }
                Some(LayerEntry::Whiteout(path)) => {
                    let path = key(&path);
                    diff.insert(
                        path.clone(),
                        LayerChange {
                            path,
                            kind: ChangeKind::Deleted,
                            size: 0,
                        },
                    );
                }
                Some(LayerEntry::Opaque(_) | LayerEntry::Dir(_)) | None => {}
            }
        }
    }

    Ok(diff.into_values().collect())
}

/// Replay every layer of `archive` into `dest`, honouring whiteouts.
pub fn extract_rootfs(archive: &Path, dest: &Path, keep_permissions: bool) -> Result<(), BackendError> {
    let image = ImageArchive::open(archive)?;
    fs::create_dir_all(dest)?;

    for layer in &image.layers {
        let mut tar = image.layer(layer)?;
        tar.set_preserve_permissions(true);
        tar.set_preserve_ownerships(keep_permissions);
        tar.set_overwrite(true);

        for entry in tar.entries()? {
            let mut entry = entry?;
            let is_dir = entry.header().entry_type().is_dir();
            let Some(kind) = classify(&entry.path()?, is_dir, 0)? else {
                continue;
            };

            match kind {
                LayerEntry::Opaque(dir) => {
                    let target = dest.join(dir);
                    if target.is_dir() {
                        for child in fs::read_dir(&target)? {
                            remove_path(&child?.path())?;
                        }
                    }
                }
                LayerEntry::Whiteout(path) => remove_path(&dest.join(path))?,
                LayerEntry::Dir(path) | LayerEntry::File(path, _) => {
                    if keep_permissions && path.starts_with("dev") {
                        continue;
                    }
                    let target = dest.join(&path);
                    let existing = fs::symlink_metadata(&target).ok();
                    if let Some(meta) = existing {
                        if meta.is_dir() != is_dir {
                            remove_path(&target)?;
                        }
                    }
                    entry.unpack_in(dest)?;
                }
            }
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
