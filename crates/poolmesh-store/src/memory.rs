//! In-memory `BlobStore`, used by tests throughout the workspace.

use crate::blob_store::{BlobStore, ByteRange, Entry};
use chrono::{DateTime, Utc};
use poolmesh_core::{PoolError, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Mutex;

struct Object {
    bytes: Vec<u8>,
    mod_time: DateTime<Utc>,
}

/// A `BlobStore` backed by an in-process `BTreeMap`. Directories are
/// implicit from `/`-separated name prefixes, same as every real backend
/// this trait abstracts over.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Object>>,
}

impl MemoryBlobStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(name: &str) -> String {
        name.trim_start_matches('/').to_string()
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, name: &str, range: Option<ByteRange>, sink: &mut dyn Write) -> Result<()> {
        let key = Self::normalize(name);
        let objects = self.objects.lock().expect("memory store mutex poisoned");
        let object = objects
            .get(&key)
            .ok_or_else(|| PoolError::not_found(format!("{name} not found")))?;
        let bytes = match range {
            Some(r) => {
                let from = r.from as usize;
                let to = (r.to as usize).min(object.bytes.len());
                if from > object.bytes.len() {
                    &[][..]
                } else {
                    &object.bytes[from..to]
                }
            }
            None => &object.bytes[..],
        };
        sink.write_all(bytes)?;
        Ok(())
    }

    fn write(&self, name: &str, source: &mut dyn Read, size: u64) -> Result<()> {
        let key = Self::normalize(name);
        let mut bytes = Vec::with_capacity(size as usize);
        source.read_to_end(&mut bytes)?;
        let mut objects = self.objects.lock().expect("memory store mutex poisoned");
        objects.insert(key, Object { bytes, mod_time: Utc::now() });
        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<Entry>> {
        let prefix = {
            let normalized = Self::normalize(dir);
            if normalized.is_empty() {
                String::new()
            } else {
                format!("{normalized}/")
            }
        };
        let objects = self.objects.lock().expect("memory store mutex poisoned");
        let mut seen_dirs = std::collections::BTreeSet::new();
        let mut entries = Vec::new();
        for (key, object) in objects.iter() {
            let Some(rest) = key.strip_prefix(&prefix) else { continue };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((child_dir, _)) => {
                    if seen_dirs.insert(child_dir.to_string()) {
                        entries.push(Entry {
                            name: child_dir.to_string(),
                            size: 0,
                            is_dir: true,
                            mod_time: object.mod_time,
                        });
                    }
                }
                None => entries.push(Entry {
                    name: rest.to_string(),
                    size: object.bytes.len() as u64,
                    is_dir: false,
                    mod_time: object.mod_time,
                }),
            }
        }
        Ok(entries)
    }

    fn stat(&self, name: &str) -> Result<Entry> {
        let key = Self::normalize(name);
        let objects = self.objects.lock().expect("memory store mutex poisoned");
        let object = objects
            .get(&key)
            .ok_or_else(|| PoolError::not_found(format!("{name} not found")))?;
        Ok(Entry {
            name: key.rsplit('/').next().unwrap_or(&key).to_string(),
            size: object.bytes.len() as u64,
            is_dir: false,
            mod_time: object.mod_time,
        })
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_key = Self::normalize(old);
        let new_key = Self::normalize(new);
        let mut objects = self.objects.lock().expect("memory store mutex poisoned");
        let object = objects
            .remove(&old_key)
            .ok_or_else(|| PoolError::not_found(format!("{old} not found")))?;
        objects.insert(new_key, object);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let key = Self::normalize(name);
        let prefix = format!("{key}/");
        let mut objects = self.objects.lock().expect("memory store mutex poisoned");
        objects.remove(&key);
        objects.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::read_to_vec;
    use std::io::Cursor;

    #[test]
    fn write_then_read_round_trips() {
        let store = MemoryBlobStore::new();
        store.write("a/b.txt", &mut Cursor::new(b"hello".to_vec()), 5).unwrap();
        assert_eq!(read_to_vec(&store, "a/b.txt").unwrap(), b"hello");
    }

    #[test]
    fn read_missing_is_not_found() {
        let store = MemoryBlobStore::new();
        assert!(matches!(read_to_vec(&store, "nope"), Err(PoolError::NotFound { .. })));
    }

    #[test]
    fn list_returns_direct_children_only() {
        let store = MemoryBlobStore::new();
        store.write("feeds/20260101/1.head", &mut Cursor::new(vec![]), 0).unwrap();
        store.write("feeds/20260102/1.head", &mut Cursor::new(vec![]), 0).unwrap();
        store.write("feeds/.touch", &mut Cursor::new(vec![]), 0).unwrap();
        let mut names: Vec<String> = store.list("feeds").unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec![".touch".to_string(), "20260101".to_string(), "20260102".to_string()]);
    }

    #[test]
    fn range_read_returns_requested_slice() {
        let store = MemoryBlobStore::new();
        store.write("f", &mut Cursor::new(b"0123456789".to_vec()), 10).unwrap();
        let mut buf = Vec::new();
        store.read("f", Some(ByteRange::new(2, 5)), &mut buf).unwrap();
        assert_eq!(buf, b"234");
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MemoryBlobStore::new();
        store.delete("nothing-here").unwrap();
        store.write("f", &mut Cursor::new(b"x".to_vec()), 1).unwrap();
        store.delete("f").unwrap();
        store.delete("f").unwrap();
    }

    #[test]
    fn delete_directory_removes_children() {
        let store = MemoryBlobStore::new();
        store.write("feeds/20260101/1.head", &mut Cursor::new(vec![1]), 1).unwrap();
        store.write("feeds/20260101/1.body", &mut Cursor::new(vec![2]), 1).unwrap();
        store.delete("feeds/20260101").unwrap();
        assert!(store.list("feeds/20260101").unwrap().is_empty());
    }
}
