//! File-based key/value store.
//!
//! # Directory Structure
//!
//! ```text
//! base/
//! ├── session-state%3Aexam-1.val        # value for key "session-state:exam-1"
//! ├── session-final-pending%3Aexam-1.val
//! └── offline-sync-queue.val
//! ```
//!
//! Keys are percent-encoded into file names so any string key maps to exactly
//! one file. Values are written to a temp file and renamed into place, so a
//! crash mid-write leaves the previous value intact.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{KeyValueStore, KvError, KvResult};

const VALUE_EXTENSION: &str = "val";
const TEMP_EXTENSION: &str = "val.tmp";

/// File-based implementation of `KeyValueStore`
///
/// Reads go straight to disk. Writes and removals are serialized by an
/// internal lock so concurrent writers to the same key cannot interleave
/// their temp files.
pub struct FileKvStore {
    /// Directory holding one file per key
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKvStore {
    /// Open a store rooted at `base_path`, creating the directory if needed
    pub fn new(base_path: impl AsRef<Path>) -> KvResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the base directory
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Total size of stored values in bytes
    pub fn total_size(&self) -> KvResult<u64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            if Self::is_value_file(&entry.path()) {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }

    fn value_path(&self, key: &str) -> KvResult<PathBuf> {
        if key.is_empty() || key == "." || key == ".." {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        let file_name = format!("{}.{}", urlencoding::encode(key), VALUE_EXTENSION);
        Ok(self.base_path.join(file_name))
    }

    fn is_value_file(path: &Path) -> bool {
        path.extension().map_or(false, |ext| ext == VALUE_EXTENSION)
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, key: &str) -> KvResult<Option<String>> {
        let path = self.value_path(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> KvResult<()> {
        let path = self.value_path(key)?;
        let temp_path = path.with_extension(TEMP_EXTENSION);
        let _guard = self.write_lock.lock().map_err(|_| KvError::Poisoned)?;

        // Write to temp file first
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(value.as_bytes())?;
        writer.flush()?;
        drop(writer);

        // Atomic rename
        fs::rename(&temp_path, &path)?;

        tracing::trace!("Wrote {} bytes to {:?}", value.len(), path);
        Ok(())
    }

    fn remove(&self, key: &str) -> KvResult<()> {
        let path = self.value_path(key)?;
        let _guard = self.write_lock.lock().map_err(|_| KvError::Poisoned)?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> KvResult<Vec<String>> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if !Self::is_value_file(&path) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match urlencoding::decode(stem) {
                Ok(key) => keys.push(key.into_owned()),
                Err(e) => tracing::warn!("Skipping undecodable store file {:?}: {}", path, e),
            }
        }

        keys.sort();
        Ok(keys)
    }
}
