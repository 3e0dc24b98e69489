//! Persistent storage for report artifacts.
//!
//! Every path handed to a [`Storage`] is relative to the report root. Paths
//! that arrive absolute are normalized first by stripping the root prefix.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Storage provider the report writes attachments and results through.
pub trait Storage: Send + Sync {
    /// Root directory all relative paths resolve against
    fn root_output_dir(&self) -> &Path;

    /// Open (create or truncate) a writable stream for a relative path
    fn open_output_stream(&self, relative: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Open a readable stream for a relative path
    fn open_input_stream(&self, relative: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Delete a relative path. Returns whether something was removed.
    fn delete(&self, relative: &Path) -> bool;

    /// Turn an absolute or root-prefixed path into a path relative to the root.
    fn normalize(&self, path: &Path) -> PathBuf {
        if let Ok(stripped) = path.strip_prefix(self.root_output_dir()) {
            return stripped.to_path_buf();
        }
        path.components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect()
    }
}

/// Filesystem storage rooted at a directory
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute location of a relative path inside the root
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(self.normalize(relative))
    }
}

impl Storage for DirectoryStorage {
    fn root_output_dir(&self) -> &Path {
        &self.root
    }

    fn open_output_stream(&self, relative: &Path) -> io::Result<Box<dyn Write + Send>> {
        let path = self.resolve(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&path)?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn open_input_stream(&self, relative: &Path) -> io::Result<Box<dyn Read + Send>> {
        let file = fs::File::open(self.resolve(relative))?;
        Ok(Box::new(file))
    }

    fn delete(&self, relative: &Path) -> bool {
        let path = self.resolve(relative);
        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "nothing to delete");
                false
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to delete attachment");
                false
            }
        }
    }
}

/// In-memory storage that remembers every delete request.
///
/// Used by tests and by hosts that serialize reports without touching disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    root: PathBuf,
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
    deleted: Arc<Mutex<Vec<PathBuf>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_root("/report")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Store bytes directly, bypassing the stream API
    pub fn insert(&self, relative: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) {
        let key = self.normalize(relative.as_ref());
        self.files.lock().insert(key, bytes.into());
    }

    pub fn contents(&self, relative: impl AsRef<Path>) -> Option<Vec<u8>> {
        let key = self.normalize(relative.as_ref());
        self.files.lock().get(&key).cloned()
    }

    pub fn contains(&self, relative: impl AsRef<Path>) -> bool {
        let key = self.normalize(relative.as_ref());
        self.files.lock().contains_key(&key)
    }

    /// All stored paths in sorted order
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.lock().keys().cloned().collect()
    }

    /// Every path a delete was requested for, in request order
    pub fn deleted(&self) -> Vec<PathBuf> {
        self.deleted.lock().clone()
    }
}

struct MemoryWriter {
    path: PathBuf,
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files
            .lock()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn root_output_dir(&self) -> &Path {
        &self.root
    }

    fn open_output_stream(&self, relative: &Path) -> io::Result<Box<dyn Write + Send>> {
        let path = self.normalize(relative);
        self.files.lock().insert(path.clone(), Vec::new());
        Ok(Box::new(MemoryWriter {
            path,
            files: Arc::clone(&self.files),
        }))
    }

    fn open_input_stream(&self, relative: &Path) -> io::Result<Box<dyn Read + Send>> {
        let path = self.normalize(relative);
        let bytes = self.files.lock().get(&path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} not stored", path.display()))
        })?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    fn delete(&self, relative: &Path) -> bool {
        let path = self.normalize(relative);
        self.deleted.lock().push(path.clone());
        self.files.lock().remove(&path).is_some()
    }
}
