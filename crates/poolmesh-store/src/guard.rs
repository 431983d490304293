//! Guards: mtime-based checkpoint short-circuit (spec.md §4.7)
//!
//! For each `(backend, sentinel-path)` pair, remember the last-seen remote
//! mtime. Before an expensive listing, stat the sentinel and skip the
//! operation if it hasn't advanced. Guards are advisory only — correctness
//! never depends on them, they just avoid the common-case round trip.

use crate::blob_store::BlobStore;
use chrono::{DateTime, Utc};
use poolmesh_core::{LocalStore, Result};

const GUARD_SCOPE: &str = "guards";

/// Checkpoint for one sentinel path on one backend.
pub struct Guard<'a> {
    local: &'a LocalStore,
    key: String,
}

impl<'a> Guard<'a> {
    /// Build a guard identified by `backend_id` + `sentinel_path`, backed
    /// by `local` for persistence.
    pub fn new(local: &'a LocalStore, backend_id: &str, sentinel_path: &str) -> Self {
        Self { local, key: format!("{backend_id}:{sentinel_path}") }
    }

    fn last_seen(&self) -> Result<Option<DateTime<Utc>>> {
        self.local.get_json(GUARD_SCOPE, &self.key)
    }

    /// Stat `sentinel_path` on `store` and decide whether the caller
    /// should proceed with its expensive listing: `true` means the
    /// sentinel has advanced (or was never seen) and the operation is
    /// worth doing; `false` means nothing has changed since last time.
    ///
    /// A `NotFound` sentinel (nothing has ever been published) is treated
    /// as "changed" the first time, so the caller's subsequent listing can
    /// discover it is in fact empty and still advance the guard.
    pub fn should_proceed(&self, store: &dyn BlobStore, sentinel_path: &str) -> Result<bool> {
        let remote_mtime = match store.stat(sentinel_path) {
            Ok(entry) => entry.mod_time,
            Err(poolmesh_core::PoolError::NotFound { .. }) => return Ok(self.last_seen()?.is_none()),
            Err(e) => return Err(e),
        };
        match self.last_seen()? {
            Some(last) => Ok(remote_mtime > last),
            None => Ok(true),
        }
    }

    /// Touch the sentinel (writing an empty blob) and record the resulting
    /// mtime locally, so future `should_proceed` calls see it.
    pub fn touch(&self, store: &dyn BlobStore, sentinel_path: &str) -> Result<()> {
        store.write(sentinel_path, &mut std::io::empty(), 0)?;
        let entry = store.stat(sentinel_path)?;
        self.local.put_json(GUARD_SCOPE, &self.key, &entry.mod_time)?;
        Ok(())
    }

    /// Record an mtime observed out-of-band (e.g. from a listing that
    /// already happened), without touching the sentinel itself.
    pub fn record(&self, mtime: DateTime<Utc>) -> Result<()> {
        self.local.put_json(GUARD_SCOPE, &self.key, &mtime)
    }
}
