//! The byte-handler boundary.
//!
//! Everything the engine knows about storage goes through [`Handler`] and the
//! [`FileIo`] values it hands out, so a remote namespace only has to supply
//! these operations. [`LocalHandler`] is the plain-filesystem implementation.

use positioned_io::{ReadAt, WriteAt};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
    /// Positional read/write on an existing file (`r+`)
    ReadWrite,
    /// Create the file, failing if it already exists (`wx`)
    ExclusiveCreate,
}

/// Positional I/O on one open file. Dropping the value closes it, so every
/// acquisition is released on all exit paths.
pub trait FileIo: Send {
    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_all_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
    fn flush(&mut self) -> io::Result<()>;
}

impl FileIo for File {
    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        ReadAt::read_exact_at(&*self, pos, buf)
    }

    fn write_all_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<()> {
        WriteAt::write_all_at(self, pos, buf)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// A filesystem-like namespace: open/stat/list/unlink/rename plus whole-file
/// reads and writes. `rename` must be atomic within the namespace.
pub trait Handler: Send + Sync {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn FileIo>>;
    fn size(&self, path: &Path) -> io::Result<u64>;
    /// List the entries of `dir` as full paths. A missing directory is an
    /// empty listing, not an error.
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
    fn unlink(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write_file(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool {
        self.size(path).is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool;
}

/// [`Handler`] over the local filesystem
#[derive(Debug, Default, Copy, Clone)]
pub struct LocalHandler;

impl Handler for LocalHandler {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn FileIo>> {
        let file = match mode {
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
            OpenMode::ExclusiveCreate => OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)?,
        };
        Ok(Box::new(file))
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        paths.sort();
        Ok(paths)
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        std::fs::write(path, bytes)
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

/// Join a possibly-relative name onto `dir` and normalize `.`/`..`
/// components. Backslash separators are tolerated because parent names may
/// have been written by a Windows implementation.
pub(crate) fn normalize_join(dir: &Path, name: &str) -> PathBuf {
    let name = name.replace('\\', "/");
    let mut out: Vec<Component> = Vec::new();
    let joined = dir.join(&name);
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(out.last(), None | Some(Component::RootDir)) {
                    out.pop();
                }
            }
            other => out.push(other),
        }
    }
    out.into_iter().collect()
}

/// Express `target` relative to `base` (a directory), preferring the
/// explicit-relative `./name` form used in parent names.
pub(crate) fn relative_path(base: &Path, target: &Path) -> String {
    let base: Vec<Component> = base.components().collect();
    let target: Vec<Component> = target.components().collect();
    let common = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = String::new();
    for _ in common..base.len() {
        out.push_str("../");
    }
    if out.is_empty() {
        out.push_str("./");
    }
    let rest: PathBuf = target[common..].iter().copied().collect();
    out.push_str(&rest.to_string_lossy());
    out
}
