//! Filesystem collaborator
//!
//! Block devices and the filesystem driver belong to the platform. The
//! store only needs path-based open/read/write/seek/stat/unlink, folded
//! here into whole operations so no handle outlives a call.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

pub use crate::error::FsError;

/// Result of `stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub size: u64,
}

/// One regular file in a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
}

/// Path-based file operations on the removable medium.
///
/// Paths are relative, `/`-separated.
pub trait Filesystem: Send {
    fn create_dir_all(&mut self, path: &str) -> Result<(), FsError>;

    /// Create an empty file, truncating an existing one
    fn create(&mut self, path: &str) -> Result<(), FsError>;

    /// Append to an existing file
    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), FsError>;

    /// Write at `offset`, creating the file if needed
    fn write_at(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<(), FsError>;

    /// Read up to `buf.len()` bytes at `offset`; fewer means end of file
    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;

    fn stat(&mut self, path: &str) -> Result<Metadata, FsError>;

    fn unlink(&mut self, path: &str) -> Result<(), FsError>;

    /// Regular files directly under `path`
    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>, FsError>;
}

#[derive(Debug, Default)]
struct MemInner {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    absent: bool,
    fail_writes: bool,
    capacity: Option<usize>,
}

impl MemInner {
    fn check_present(&self) -> Result<(), FsError> {
        if self.absent {
            Err(FsError::MediumAbsent)
        } else {
            Ok(())
        }
    }

    fn check_writable(&self, extra: usize) -> Result<(), FsError> {
        self.check_present()?;
        if self.fail_writes {
            return Err(FsError::Io(std::io::Error::new(
                ErrorKind::Other,
                "injected write failure",
            )));
        }
        if let Some(capacity) = self.capacity {
            let used: usize = self.files.values().map(Vec::len).sum();
            if used + extra > capacity {
                return Err(FsError::NoSpace);
            }
        }
        Ok(())
    }
}

/// In-memory medium.
///
/// Clones share the same contents, so a test can drop every component
/// using the medium and reopen it to simulate a reboot.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    inner: Arc<Mutex<MemInner>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit total file bytes
    pub fn with_capacity(capacity: usize) -> Self {
        let fs = Self::new();
        fs.inner.lock().capacity = Some(capacity);
        fs
    }

    /// Simulate card removal or reinsertion
    pub fn set_absent(&self, absent: bool) {
        self.inner.lock().absent = absent;
    }

    /// Make every write fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Copy of a file's contents
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().files.get(path).cloned()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.inner.lock().files.keys().cloned().collect()
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

impl Filesystem for MemFs {
    fn create_dir_all(&mut self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        inner.check_present()?;
        let mut prefix = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            inner.dirs.insert(prefix.clone());
        }
        Ok(())
    }

    fn create(&mut self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        inner.check_writable(0)?;
        let parent = parent_of(path);
        if !parent.is_empty() && !inner.dirs.contains(parent) {
            return Err(FsError::NotFound(parent.to_string()));
        }
        inner.files.insert(path.to_string(), Vec::new());
        Ok(())
    }

    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        inner.check_writable(data.len())?;
        let file = inner
            .files
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        file.extend_from_slice(data);
        Ok(())
    }

    fn write_at(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        inner.check_writable(data.len())?;
        let file = inner.files.entry(path.to_string()).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let inner = self.inner.lock();
        inner.check_present()?;
        let file = inner
            .files
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let start = (offset as usize).min(file.len());
        let n = buf.len().min(file.len() - start);
        buf[..n].copy_from_slice(&file[start..start + n]);
        Ok(n)
    }

    fn stat(&mut self, path: &str) -> Result<Metadata, FsError> {
        let inner = self.inner.lock();
        inner.check_present()?;
        inner
            .files
            .get(path)
            .map(|f| Metadata { size: f.len() as u64 })
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        inner.check_present()?;
        inner
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let inner = self.inner.lock();
        inner.check_present()?;
        if !inner.dirs.contains(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok(inner
            .files
            .iter()
            .filter(|(name, _)| parent_of(name) == path)
            .map(|(name, data)| DirEntry {
                name: name.rsplit('/').next().unwrap_or(name).to_string(),
                size: data.len() as u64,
            })
            .collect())
    }
}

/// Medium backed by a host directory (simulator and integration use)
#[derive(Debug, Clone)]
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FsError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|p| !p.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }
}

fn map_io(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        _ => FsError::Io(e),
    }
}

impl Filesystem for HostFs {
    fn create_dir_all(&mut self, path: &str) -> Result<(), FsError> {
        fs::create_dir_all(self.resolve(path)).map_err(|e| map_io(path, e))
    }

    fn create(&mut self, path: &str) -> Result<(), FsError> {
        fs::File::create(self.resolve(path))
            .map(|_| ())
            .map_err(|e| map_io(path, e))
    }

    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.resolve(path))
            .map_err(|e| map_io(path, e))?;
        file.write_all(data)?;
        Ok(())
    }

    fn write_at(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<(), FsError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.resolve(path))
            .map_err(|e| map_io(path, e))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut file = fs::File::open(self.resolve(path)).map_err(|e| map_io(path, e))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FsError::Io(e)),
            }
        }
        Ok(total)
    }

    fn stat(&mut self, path: &str) -> Result<Metadata, FsError> {
        let meta = fs::metadata(self.resolve(path)).map_err(|e| map_io(path, e))?;
        Ok(Metadata { size: meta.len() })
    }

    fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        fs::remove_file(self.resolve(path)).map_err(|e| map_io(path, e))
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path)).map_err(|e| map_io(path, e))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                entries.push(DirEntry {
                    name: name.to_string(),
                    size: meta.len(),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
