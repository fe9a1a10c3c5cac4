//! Archive and filesystem helpers
//!
//! Packing and unpacking of package archives (plain or gzip tar) and the
//! symlink-preserving copies the build pipeline uses.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use cairn_schema::CompressionType;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;
use walkdir::WalkDir;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors packing or unpacking archives.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Reading or writing a file failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Walking the source directory failed.
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// An entry would land outside the destination.
    #[error("Invalid path in archive: {0}")]
    InvalidPath(String),
}

/// Pack the contents of `src` (not `src` itself) into an uncompressed tar.
pub fn tar(src: &Path, dest: &Path) -> Result<(), ArchiveError> {
    tar_with(src, dest, CompressionType::None)
}

/// Pack the contents of `src` into `dest` with the given compression.
///
/// The archive is written beside `dest` and renamed into place, so readers
/// never see a partial file.
pub fn tar_with(src: &Path, dest: &Path, compression: CompressionType) -> Result<(), ArchiveError> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = tempfile::NamedTempFile::new_in(parent)?;
    let writer = BufWriter::new(staging.as_file());

    match compression {
        CompressionType::None => {
            write_tar(src, writer)?.flush()?;
        }
        CompressionType::Gzip => {
            let encoder = write_tar(src, GzEncoder::new(writer, Compression::default()))?;
            encoder.finish()?.flush()?;
        }
    }
    staging.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

fn write_tar<W: Write>(src: &Path, writer: W) -> Result<W, ArchiveError> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| ArchiveError::InvalidPath(entry.path().display().to_string()))?;
        builder.append_path_with_name(entry.path(), relative)?;
    }

    Ok(builder.into_inner()?)
}

/// Unpack `src` into `dest`, detecting gzip from the file header.
///
/// Returns the relative paths of every non-directory entry written.
/// Entries escaping `dest` are rejected. With `preserve_ownership`, owners
/// and xattrs are restored and `dev/` is left alone.
pub fn untar(
    src: &Path,
    dest: &Path,
    preserve_ownership: bool,
) -> Result<Vec<String>, ArchiveError> {
    let mut file = File::open(src)?;
    let mut magic = [0u8; 2];
    let gzipped = file.read(&mut magic)? == 2 && magic == GZIP_MAGIC;
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    if gzipped {
        unpack(GzDecoder::new(reader), dest, preserve_ownership)
    } else {
        unpack(reader, dest, preserve_ownership)
    }
}

fn unpack<R: Read>(
    reader: R,
    dest: &Path,
    preserve_ownership: bool,
) -> Result<Vec<String>, ArchiveError> {
    fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(preserve_ownership);
    archive.set_unpack_xattrs(preserve_ownership);
    archive.set_overwrite(true);

    let mut files = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let relative = sanitize(&path)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        if preserve_ownership && relative.starts_with("dev") {
            continue;
        }

        let is_dir = entry.header().entry_type().is_dir();
        entry.unpack_in(dest)?;
        if !is_dir {
            files.push(relative.to_string_lossy().into_owned());
        }
    }

    Ok(files)
}

/// Strip root and `.` components; refuse `..`.
pub(crate) fn sanitize(path: &Path) -> Result<PathBuf, ArchiveError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ArchiveError::InvalidPath(path.display().to_string()));
            }
        }
    }
    Ok(out)
}

/// Recursively copy `src` into `dst`, recreating symlinks as symlinks.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| ArchiveError::InvalidPath(entry.path().display().to_string()))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copy one file (or symlink) creating parent directories as needed.
pub fn copy_file(src: &Path, dst: &Path) -> Result<(), ArchiveError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        let link = fs::read_link(src)?;
        if exists(dst) {
            fs::remove_file(dst)?;
        }
        symlink(&link, dst)?;
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

/// Whether anything (including a dangling symlink) sits at `path`.
pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[cfg(unix)]
fn symlink(link: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn symlink(_link: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are only supported on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/tool"), "#!/bin/sh\necho hi\n").unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/tool.conf"), "x=1").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("tool", root.join("usr/bin/t")).unwrap();
    }

    #[test]
    fn test_tar_untar_gzip() {
        let work = tempdir().unwrap();
        let src = work.path().join("src");
        sample_tree(&src);

        let archive = work.path().join("out.tar.gz");
        tar_with(&src, &archive, CompressionType::Gzip).unwrap();

        let mut magic = [0u8; 2];
        File::open(&archive).unwrap().read_exact(&mut magic).unwrap();
        assert_eq!(magic, GZIP_MAGIC);

        let dest = work.path().join("dest");
        let mut files = untar(&archive, &dest, false).unwrap();
        files.sort();

        #[cfg(unix)]
        assert_eq!(files, ["etc/tool.conf", "usr/bin/t", "usr/bin/tool"]);
        assert_eq!(
            fs::read_to_string(dest.join("etc/tool.conf")).unwrap(),
            "x=1"
        );
        #[cfg(unix)]
        assert_eq!(
            fs::read_link(dest.join("usr/bin/t")).unwrap(),
            PathBuf::from("tool")
        );
    }

    #[test]
    fn test_untar_rejects_traversal() {
        let work = tempdir().unwrap();
        let archive = work.path().join("evil.tar");

        let mut header = tar::Header::new_old();
        let name = b"../evil";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();

        let mut builder = tar::Builder::new(File::create(&archive).unwrap());
        builder.append(&header, &b"evil"[..]).unwrap();
        builder.finish().unwrap();

        let err = untar(&archive, &work.path().join("dest"), false).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidPath(_)));
        assert!(!work.path().join("evil").exists());
    }

    #[test]
    fn test_copy_dir_keeps_symlinks() {
        let work = tempdir().unwrap();
        let src = work.path().join("src");
        sample_tree(&src);

        let dst = work.path().join("dst");
        copy_dir(&src, &dst).unwrap();

        assert!(exists(&dst.join("usr/bin/tool")));
        #[cfg(unix)]
        assert!(
            fs::symlink_metadata(dst.join("usr/bin/t"))
                .unwrap()
                .file_type()
                .is_symlink()
        );
    }
}
