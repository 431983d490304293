//! Local plaintext body cache, bounded by `cache.size-mb` (spec.md §6).
//!
//! Built on [`LocalFsBlobStore`] rather than a bespoke file format: a
//! cache entry is just a plaintext blob keyed by the feed entry's
//! snowflake id. Eviction is plain least-recently-written, since mtime is
//! already tracked by the backing store.

use poolmesh_core::{PoolError, Result, Snowflake};
use poolmesh_store::{BlobStore, LocalFsBlobStore};
use std::io::Cursor;

/// Plaintext body cache for one pool. `None` backing store means caching
/// is disabled (`cache.size-mb = 0`).
pub struct FeedCache {
    store: Option<LocalFsBlobStore>,
    budget_bytes: u64,
}

impl FeedCache {
    /// Build a cache rooted at `root`, with a `budget_mb` megabyte budget.
    /// `budget_mb = 0` disables caching entirely.
    pub fn new(root: impl Into<std::path::PathBuf>, budget_mb: u64) -> Result<Self> {
        if budget_mb == 0 {
            return Ok(Self { store: None, budget_bytes: 0 });
        }
        Ok(Self { store: Some(LocalFsBlobStore::new(root)?), budget_bytes: budget_mb * 1024 * 1024 })
    }

    /// A cache that never stores anything, for callers that opt out.
    pub fn disabled() -> Self {
        Self { store: None, budget_bytes: 0 }
    }

    /// Delete every cached body, for `leave`-style cleanup. A no-op if
    /// caching is disabled.
    pub fn clear(&self) -> Result<()> {
        let Some(store) = &self.store else { return Ok(()) };
        store.delete("")
    }

    fn key(id: Snowflake) -> String {
        id.to_string()
    }

    /// Fetch a cached plaintext body, if present.
    pub fn get(&self, id: Snowflake) -> Option<Vec<u8>> {
        let store = self.store.as_ref()?;
        let mut buf = Vec::new();
        match store.read(&Self::key(id), None, &mut buf) {
            Ok(()) => Some(buf),
            Err(_) => None,
        }
    }

    /// Store a plaintext body, evicting the oldest entries if the total
    /// size would exceed the budget.
    pub fn put(&self, id: Snowflake, bytes: &[u8]) -> Result<()> {
        let Some(store) = &self.store else { return Ok(()) };
        if bytes.len() as u64 > self.budget_bytes {
            return Ok(());
        }
        let len = bytes.len() as u64;
        store.write(&Self::key(id), &mut Cursor::new(bytes.to_vec()), len)?;
        self.evict_to_budget(store)
    }

    fn evict_to_budget(&self, store: &LocalFsBlobStore) -> Result<()> {
        let mut entries = match store.list("") {
            Ok(entries) => entries,
            Err(PoolError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        entries.sort_by_key(|e| e.mod_time);
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        let mut i = 0;
        while total > self.budget_bytes && i < entries.len() {
            store.delete(&entries[i].name)?;
            total -= entries[i].size;
            i += 1;
        }
        Ok(())
    }
}
