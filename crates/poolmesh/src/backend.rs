//! Backend URL dispatch and the ping/latency probe (spec.md §4.8 "Open":
//! "ping each ... pick the lowest-latency as primary"; SPEC_FULL.md §C.1,
//! grounded on `original_source/pool/connect.go`).
//!
//! Only `file:` URLs resolve to a concrete driver. `sftp://`, `s3://`, and
//! `dav(s)://` are named in spec.md §6 as backend URL syntax but their
//! drivers are explicit external collaborators (spec.md §1) — this crate
//! rejects them rather than guessing at a transport it was never asked to
//! implement.

use poolmesh_core::{PoolError, Result};
use poolmesh_store::{BlobStore, LocalFsBlobStore, PrefixBlobStore};
use rand::RngCore;
use std::io::Cursor;
use std::time::{Duration, Instant};

const PING_OBJECT: &str = ".ping";
const PING_PAYLOAD_LEN: usize = 16;

/// One configured backend: its URL (used as a guard's `backend_id` and
/// preserved for sub-pool inheritance) plus the open driver.
pub struct Backend {
    pub url: String,
    pub store: Box<dyn BlobStore>,
}

/// Resolve a backend URL to a concrete driver. `file:/absolute/path` maps
/// to [`LocalFsBlobStore`]; every other scheme is out of scope.
pub fn resolve_backend(url: &str) -> Result<Box<dyn BlobStore>> {
    if let Some(path) = url.strip_prefix("file:") {
        return Ok(Box::new(LocalFsBlobStore::new(path)?));
    }
    Err(PoolError::no_backend(format!("unsupported backend url scheme: {url}")))
}

/// Write, read back, and delete a small random blob, returning the round
/// trip latency. A failure at any step counts as unreachable.
pub fn ping(store: &dyn BlobStore) -> Result<Duration> {
    let mut payload = vec![0u8; PING_PAYLOAD_LEN];
    rand::thread_rng().fill_bytes(&mut payload);
    let start = Instant::now();
    store.write(PING_OBJECT, &mut Cursor::new(payload), PING_PAYLOAD_LEN as u64)?;
    let mut readback = Vec::new();
    store.read(PING_OBJECT, None, &mut readback)?;
    store.delete(PING_OBJECT)?;
    Ok(start.elapsed())
}

/// Resolve every configured URL, namespace each by `pool_name` (so several
/// pools sharing one backend never collide — original_source's
/// `pool/connect.go` joins the pool name onto every object path the same
/// way), ping each, and sort ascending by latency so `backends[0]` is the
/// lowest-latency primary. A backend that fails to resolve or ping is
/// dropped with a warning rather than failing the whole open — only an
/// empty result is fatal (`NoBackend`).
pub fn connect_and_rank(urls: &[String], pool_name: &str) -> Result<Vec<Backend>> {
    let mut ranked = Vec::new();
    for url in urls {
        let store = match resolve_backend(url) {
            Ok(store) => PrefixBlobStore::new(store, pool_name),
            Err(e) => {
                tracing::warn!(%url, error = %e, "dropping unreachable backend");
                continue;
            }
        };
        match ping(&store) {
            Ok(latency) => ranked.push((latency, Backend { url: url.clone(), store: Box::new(store) })),
            Err(e) => tracing::warn!(%url, error = %e, "dropping unreachable backend"),
        }
    }
    if ranked.is_empty() {
        return Err(PoolError::no_backend("no configured backend responded to a ping"));
    }
    ranked.sort_by_key(|(latency, _)| *latency);
    Ok(ranked.into_iter().map(|(_, backend)| backend).collect())
}
