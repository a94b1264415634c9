//! File-backed store: one JSON-ish blob per record under
//! `<root>/<namespace>/<id>`.
//!
//! Writes go through a temp file and an atomic rename, so a crash mid-write
//! never leaves a torn record behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{Store, StoreError};

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, namespace: &str, id: &str) -> Result<PathBuf, StoreError> {
        // Ids come from operators; keep them from escaping the namespace dir.
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(StoreError::Corrupt {
                namespace: namespace.to_string(),
                id: id.to_string(),
                reason: "id must be a plain file name".to_string(),
            });
        }
        Ok(self.root.join(namespace).join(id))
    }
}

fn io_err(err: std::io::Error) -> StoreError {
    StoreError::Io(err.to_string())
}

impl Store for FileStore {
    fn put(&mut self, namespace: &str, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.record_path(namespace, id)?;
        let dir = path.parent().expect("record path has a parent");
        fs::create_dir_all(dir).map_err(io_err)?;

        let tmp = dir.join(format!(".{id}.tmp"));
        {
            let mut f = fs::File::create(&tmp).map_err(io_err)?;
            f.write_all(bytes).map_err(io_err)?;
            f.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }

    fn get(&self, namespace: &str, id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.record_path(namespace, id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                namespace: namespace.to_string(),
                id: id.to_string(),
            }),
            Err(err) => Err(io_err(err)),
        }
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(namespace);
        let mut ids = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(io_err(err)),
        };
        for entry in entries {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Skip leftover temp files from interrupted writes.
            if name.starts_with('.') {
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(ids)
    }

    fn delete(&mut self, namespace: &str, id: &str) -> Result<(), StoreError> {
        let path = self.record_path(namespace, id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                namespace: namespace.to_string(),
                id: id.to_string(),
            }),
            Err(err) => Err(io_err(err)),
        }
    }
}
