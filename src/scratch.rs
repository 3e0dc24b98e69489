//! Scratch directories for in-progress recordings.
//!
//! A recording is written here first and copied into report storage only
//! once it is finalized. Leftovers are cleared between runs, and a directory
//! that is not kept is removed when its owner goes away.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config;
use crate::ids::sanitize_name;

const METADATA_FILE: &str = ".scratch.json";

/// A scratch directory owned by one recorder
#[derive(Debug)]
pub struct ScratchDir {
    pub id: String,
    pub dir: PathBuf,
    /// Leave the directory in place when dropped
    pub keep: bool,
}

/// Written once per directory so stray scratch areas can be traced to a process
#[derive(Serialize)]
struct ScratchMetadata<'a> {
    id: &'a str,
    created: DateTime<Utc>,
    pid: u32,
}

impl ScratchDir {
    /// A fresh directory under the configured scratch base, removed on drop.
    pub fn with_name(name: &str) -> Self {
        let id = format!(
            "{}_{}_{}",
            sanitize_name(name),
            Utc::now().format("%Y%m%d_%H%M%S"),
            std::process::id()
        );
        Self {
            dir: config::get().capture.scratch_dir.join(&id),
            id,
            keep: false,
        }
    }

    /// Use a caller-chosen directory. These are kept by default.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = match dir.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => format!("scratch_{}_{}", Utc::now().timestamp_millis(), std::process::id()),
        };
        Self { id, dir, keep: true }
    }

    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Create the directory and its metadata file
    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let metadata_path = self.dir.join(METADATA_FILE);
        if !metadata_path.exists() {
            let metadata = ScratchMetadata {
                id: &self.id,
                created: Utc::now(),
                pid: std::process::id(),
            };
            fs::write(metadata_path, serde_json::to_vec_pretty(&metadata)?)?;
        }
        Ok(())
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Scratch files in name order, without the metadata file
    pub fn list_files(&self) -> io::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && !is_metadata(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Remove every file a previous recording left behind
    pub fn clear(&self) {
        match self.list_files() {
            Ok(files) => {
                for file in files {
                    if let Err(err) = fs::remove_file(&file) {
                        warn!(path = %file.display(), error = %err, "failed to remove scratch file");
                    }
                }
            }
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "failed to list scratch files")
            }
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

fn is_metadata(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == METADATA_FILE)
}
