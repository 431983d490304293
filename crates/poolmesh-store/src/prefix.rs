//! Namespaces a shared backend by pool name, mirroring the original's
//! `path.Join(pool, name)` on every object path (original_source's
//! `pool/connect.go`: `pingExchanger` joins the pool name onto every
//! written object). Several pools, including sub-pools (spec.md §4.8
//! "Sub-pool": "same backends"), can share one physical `BlobStore`
//! without their `access`/`feeds`/`identities` directories colliding.

use crate::blob_store::{BlobStore, ByteRange, Entry};
use poolmesh_core::Result;
use std::io::{Read, Write};

/// Wraps any [`BlobStore`], rewriting every object name to live under
/// `<prefix>/<name>`. An empty prefix is a transparent passthrough.
pub struct PrefixBlobStore {
    inner: Box<dyn BlobStore>,
    prefix: String,
}

impl PrefixBlobStore {
    pub fn new(inner: Box<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self { inner, prefix: prefix.into() }
    }

    fn scoped(&self, name: &str) -> String {
        match (self.prefix.is_empty(), name.is_empty()) {
            (true, _) => name.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, name),
        }
    }
}

impl BlobStore for PrefixBlobStore {
    fn read(&self, name: &str, range: Option<ByteRange>, sink: &mut dyn Write) -> Result<()> {
        self.inner.read(&self.scoped(name), range, sink)
    }

    fn write(&self, name: &str, source: &mut dyn Read, size: u64) -> Result<()> {
        self.inner.write(&self.scoped(name), source, size)
    }

    fn list(&self, dir: &str) -> Result<Vec<Entry>> {
        self.inner.list(&self.scoped(dir))
    }

    fn stat(&self, name: &str) -> Result<Entry> {
        self.inner.stat(&self.scoped(name))
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.inner.rename(&self.scoped(old), &self.scoped(new))
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(&self.scoped(name))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
