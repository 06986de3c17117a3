//! Storage primitives over the shared database directory.
//!
//! Every state change in the queue is a single `rename(2)` of one document,
//! so the tree must live on one volume. Writes go to a dot-prefixed temporary
//! file in the destination directory and are renamed over the target, which
//! keeps half-written documents invisible to other processes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::{COMPLETED_DIR, FAILED_DIR, JOBS_DIR, LOGS_DIR, QUEUED_DIR, TASKS_DIR, WORKERS_DIR};

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and lay out, if needed) a database rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        for dir in [
            store.jobs_dir(),
            store.queued_dir(),
            store.completed_dir(),
            store.failed_dir(),
            store.workers_dir(),
            store.logs_dir(),
        ] {
            store.create_dir(&dir)?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join(JOBS_DIR)
    }

    pub fn queued_dir(&self) -> PathBuf {
        self.root.join(TASKS_DIR).join(QUEUED_DIR)
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.root.join(TASKS_DIR).join(COMPLETED_DIR)
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join(TASKS_DIR).join(FAILED_DIR)
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.root.join(WORKERS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Read and decode a document.
    pub fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let bytes = fs::read(path).map_err(QueueError::io(path))?;
        serde_json::from_slice(&bytes).map_err(|source| QueueError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Atomically replace `path` with the encoded document.
    pub fn write<T: Serialize>(&self, value: &T, path: &Path) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

        let result = (|| {
            let mut file = File::create(&tmp).map_err(QueueError::io(&tmp))?;
            file.write_all(&bytes).map_err(QueueError::io(&tmp))?;
            file.sync_all().map_err(QueueError::io(&tmp))?;
            fs::rename(&tmp, path).map_err(QueueError::io(path))
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    /// Read, modify and write back a document that is expected to stay put.
    ///
    /// Returns `Ok(false)` when the document is gone, which means another
    /// actor moved it after the caller located it.
    ///
    /// The existence check and the final rename are not one atomic step. A
    /// move that lands between them still leaves a stale copy at `path`;
    /// callers that own `path` (a worker's subtree, a terminal directory)
    /// keep that window to a few syscalls.
    pub fn update<T, F>(&self, path: &Path, f: F) -> Result<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let mut value: T = match self.read(path) {
            Ok(value) => value,
            Err(QueueError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !f(&mut value) {
            return Ok(true);
        }
        if !path.exists() {
            return Ok(false);
        }
        self.write(&value, path)?;
        Ok(true)
    }

    /// Atomically relocate a document into `dest_dir`, keeping its name.
    ///
    /// `QueueError::NotFound(source)` means the document was no longer at
    /// `path`; `QueueError::NotFound(dest_dir)` means the destination is
    /// missing.
    pub fn move_into(&self, path: &Path, dest_dir: &Path) -> Result<PathBuf> {
        let file_name = path
            .file_name()
            .ok_or_else(|| QueueError::NotFound(path.to_path_buf()))?;
        let dest = dest_dir.join(file_name);

        match fs::rename(path, &dest) {
            Ok(()) => Ok(dest),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if path.exists() {
                    Err(QueueError::NotFound(dest_dir.to_path_buf()))
                } else {
                    Err(QueueError::NotFound(path.to_path_buf()))
                }
            }
            Err(e) => Err(QueueError::Io { path: path.to_path_buf(), source: e }),
        }
    }

    /// Create a directory and its parents. Succeeds if it already exists.
    pub fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(QueueError::io(path))
    }

    /// Create a marker file, failing if it already exists.
    /// Returns `Ok(false)` when another actor created it first.
    pub fn create_exclusive(&self, path: &Path, contents: &str) -> Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(contents.as_bytes()).map_err(QueueError::io(path))?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(QueueError::io(path)(e)),
        }
    }

    /// Remove a file or a whole directory tree. Returns `Ok(false)` if there
    /// was nothing to remove.
    pub fn remove(&self, path: &Path) -> Result<bool> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(QueueError::io(path)(e)),
        };
        let result = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(QueueError::io(path)(e)),
        }
    }

    /// JSON documents in `dir`, sorted by name. Temporary and hidden files
    /// are skipped; a missing directory lists as empty.
    pub fn list_documents(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut docs: Vec<PathBuf> = self
            .entries(dir)?
            .into_iter()
            .filter(|p| {
                let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                !name.starts_with('.') && name.ends_with(".json") && p.is_file()
            })
            .collect();
        docs.sort();
        Ok(docs)
    }

    /// Non-hidden subdirectories of `dir`, sorted by name.
    pub fn list_dirs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs: Vec<PathBuf> = self
            .entries(dir)?
            .into_iter()
            .filter(|p| {
                let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                !name.starts_with('.') && p.is_dir()
            })
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    fn entries(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QueueError::io(dir)(e)),
        };
        let mut entries = Vec::new();
        for entry in read_dir {
            match entry {
                Ok(entry) => entries.push(entry.path()),
                Err(e) => return Err(QueueError::io(dir)(e)),
            }
        }
        Ok(entries)
    }
}
