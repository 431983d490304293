//! Local filesystem `BlobStore` driver
//!
//! The one concrete backend the spec keeps in scope as a reference
//! implementation (`file:/absolute/path`, spec.md §6 "Backend URL
//! syntax"); SFTP/S3/WebDAV remain external drivers.

use crate::blob_store::{BlobStore, ByteRange, Entry};
use chrono::{DateTime, Utc};
use poolmesh_core::{PoolError, Result};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A `BlobStore` rooted at a directory on the local filesystem.
pub struct LocalFsBlobStore {
    root: PathBuf,
}

impl LocalFsBlobStore {
    /// Root the store at `root`, creating the directory if absent.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    fn entry_for(path: &Path, name: &str) -> Result<Entry> {
        let meta = fs::metadata(path)?;
        let mod_time: DateTime<Utc> = meta.modified()?.into();
        Ok(Entry {
            name: name.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_dir: meta.is_dir(),
            mod_time,
        })
    }
}

impl BlobStore for LocalFsBlobStore {
    fn read(&self, name: &str, range: Option<ByteRange>, sink: &mut dyn Write) -> Result<()> {
        let path = self.resolve(name);
        let mut file = fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PoolError::not_found(format!("{name} not found")),
            _ => PoolError::from(e),
        })?;
        match range {
            Some(r) => {
                file.seek(SeekFrom::Start(r.from))?;
                let mut limited = file.take(r.len());
                std::io::copy(&mut limited, sink)?;
            }
            None => {
                std::io::copy(&mut file, sink)?;
            }
        }
        Ok(())
    }

    fn write(&self, name: &str, source: &mut dyn Read, _size: u64) -> Result<()> {
        let path = self.resolve(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp-write");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            std::io::copy(source, &mut tmp)?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<Entry>> {
        let path = self.resolve(dir);
        let read_dir = fs::read_dir(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PoolError::not_found(format!("{dir} not found")),
            _ => PoolError::from(e),
        })?;
        let mut entries = Vec::new();
        for item in read_dir {
            let item = item?;
            let name = item.file_name().to_string_lossy().to_string();
            entries.push(Self::entry_for(&item.path(), &name)?);
        }
        Ok(entries)
    }

    fn stat(&self, name: &str) -> Result<Entry> {
        let path = self.resolve(name);
        if !path.exists() {
            return Err(PoolError::not_found(format!("{name} not found")));
        }
        let base_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        Self::entry_for(&path, &base_name)
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_path = self.resolve(old);
        let new_path = self.resolve(new);
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(old_path, new_path)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name);
        if !path.exists() {
            return Ok(());
        }
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
