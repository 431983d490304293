//! `Pool`: lifecycle coordinator (spec.md §4.8).

use crate::backend::{connect_and_rank, Backend};
use crate::dump::PoolDump;
use parking_lot::ReentrantMutex;
use poolmesh_access::{AccessEngine, AccessState};
use poolmesh_core::{
    Bandwidth, Clock, Config, DiagnosticsLog, LocalStore, PoolError, PoolId, Result, Snowflake, SnowflakeGenerator,
    UserId,
};
use poolmesh_crypto::Identity;
use poolmesh_feed::{FeedCache, FeedEngine, FeedHead};
use poolmesh_store::{BlobStore, ByteRange};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Cadence of the background replica ticker, keyed by [`Bandwidth`].
/// `Low` never spawns a ticker at all.
fn tick_interval(bandwidth: Bandwidth) -> Option<Duration> {
    match bandwidth {
        Bandwidth::Low => None,
        Bandwidth::Medium => Some(Duration::from_secs(60)),
        Bandwidth::High => Some(Duration::from_secs(15)),
    }
}

struct PoolInner {
    pool_id: PoolId,
    name: String,
    identity: Arc<Identity>,
    local: Arc<LocalStore>,
    clock: Arc<Clock>,
    ids: Arc<SnowflakeGenerator>,
    backends: Vec<Backend>,
    // `pool_id:url`, not just `url`: several pools (sub-pools in
    // particular) can share one physical backend, and the guard
    // checkpoint store (spec.md §4.7) keys purely off this string with no
    // pool scoping of its own.
    backend_id: String,
    lifespan_hours: u64,
    cache: FeedCache,
    bandwidth: Bandwidth,
    // Serializes every backend-mutating operation within this pool
    // (spec.md §5: "Each pool owns a re-entrant mutex that serializes all
    // backend-mutating operations within that pool; read-only
    // decrypt-from-cache paths take no lock").
    lock: ReentrantMutex<()>,
    stop: AtomicBool,
    diagnostics: Arc<DiagnosticsLog>,
}

impl PoolInner {
    fn access_engine(&self) -> AccessEngine<'_> {
        AccessEngine::new(&self.identity, self.pool_id, &self.local, &self.clock, &self.ids, &self.backend_id)
    }

    fn feed_engine(&self) -> FeedEngine<'_> {
        FeedEngine::new(&self.identity, self.pool_id, &self.local, &self.clock, &self.ids, self.lifespan_hours, &self.cache)
    }

    fn primary_url(&self) -> &str {
        &self.backends[0].url
    }

    fn primary(&self) -> &dyn BlobStore {
        self.backends[0].store.as_ref()
    }

    fn identity_lookup(&self, user_id: &UserId) -> Result<Option<poolmesh_crypto::IdentityPublic>> {
        poolmesh_access::identities::trusted(&self.local, self.pool_id, user_id)
    }
}

/// One open pool on this node: backends, keys, and the background replica
/// ticker. Cloning a `Pool` shares the same coordinator (the ticker thread
/// holds its own handle into the same state).
pub struct Pool {
    inner: Arc<PoolInner>,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

/// Shared process-wide collaborators every `Pool::open`/`Pool::create`
/// call draws from (spec.md §5 "Shared resources": "the local table store
/// is process-wide ... all pools share it and the clock-offset and
/// recent-log globals").
#[derive(Clone)]
pub struct Globals {
    pub identity: Arc<Identity>,
    pub local: Arc<LocalStore>,
    pub clock: Arc<Clock>,
    pub ids: Arc<SnowflakeGenerator>,
    pub diagnostics: Arc<DiagnosticsLog>,
    /// Root directory under which each pool's plaintext body cache gets
    /// its own `<cache_root>/<pool_id>` subdirectory.
    pub cache_root: std::path::PathBuf,
}

fn backend_urls(config: &Config) -> Vec<String> {
    let mut urls = config.pool.public.clone();
    urls.extend(config.pool.private.clone());
    urls
}

fn access_dir_already_exists(backends: &[Backend]) -> Result<bool> {
    for backend in backends {
        match backend.store.list("access") {
            Ok(entries) => {
                if entries.iter().any(|e| e.name != ".touch") {
                    return Ok(true);
                }
            }
            Err(PoolError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

impl Pool {
    /// Open an existing pool (spec.md §4.8 "Open"). `pool_id` must already
    /// be known to the caller — recovering it from a bare pool name is a
    /// join-flow concern this crate does not model (see DESIGN.md).
    pub fn open(config: &Config, pool_id: PoolId, globals: Globals) -> Result<Pool> {
        let backends = connect_and_rank(&backend_urls(config), &config.pool.name)?;
        poolmesh_access::identities::publish_own(backends[0].store.as_ref(), &globals.identity)?;
        let cache = FeedCache::new(globals.cache_root.join(pool_id.0.to_string()), config.cache.size_mb)?;
        let backend_id = format!("{pool_id}:{}", backends[0].url);

        let inner = Arc::new(PoolInner {
            pool_id,
            name: config.pool.name.clone(),
            identity: globals.identity,
            local: globals.local,
            clock: globals.clock,
            ids: globals.ids,
            backends,
            backend_id,
            lifespan_hours: config.pool.life_span_hours,
            cache,
            bandwidth: config.bandwidth,
            lock: ReentrantMutex::new(()),
            stop: AtomicBool::new(false),
            diagnostics: globals.diagnostics,
        });

        let gained_master_key = inner.access_engine().sync_access(inner.primary(), false)?;
        if !gained_master_key && inner.access_engine().keystore()?.current_id().is_none() {
            return Err(PoolError::not_authorized("sync-access produced no usable master key"));
        }

        Ok(Pool::spawn(inner))
    }

    /// Create a brand-new pool (spec.md §4.8 "Create").
    pub fn create(config: &Config, globals: Globals, force: bool) -> Result<Pool> {
        let backends = connect_and_rank(&backend_urls(config), &config.pool.name)?;
        if !force && access_dir_already_exists(&backends)? {
            return Err(PoolError::not_authorized(
                "an access file already exists on a configured backend; pass force to override",
            ));
        }

        let pool_id: PoolId = globals.ids.next_id_at(globals.clock.now_system()).into();
        poolmesh_access::identities::publish_own(backends[0].store.as_ref(), &globals.identity)?;
        let cache = FeedCache::new(globals.cache_root.join(pool_id.0.to_string()), config.cache.size_mb)?;
        let backend_id = format!("{pool_id}:{}", backends[0].url);

        let inner = Arc::new(PoolInner {
            pool_id,
            name: config.pool.name.clone(),
            identity: globals.identity,
            local: globals.local,
            clock: globals.clock,
            ids: globals.ids,
            backends,
            backend_id,
            lifespan_hours: config.pool.life_span_hours,
            cache,
            bandwidth: config.bandwidth,
            lock: ReentrantMutex::new(()),
            stop: AtomicBool::new(false),
            diagnostics: globals.diagnostics,
        });

        inner.access_engine().bootstrap_self()?;
        inner.access_engine().sync_access(inner.primary(), true)?;

        Ok(Pool::spawn(inner))
    }

    fn spawn(inner: Arc<PoolInner>) -> Pool {
        let ticker = tick_interval(inner.bandwidth).map(|interval| {
            let inner = Arc::clone(&inner);
            std::thread::spawn(move || {
                while !inner.stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if inner.stop.load(Ordering::Acquire) {
                        break;
                    }
                    run_tick(&inner);
                }
            })
        });
        Pool { inner, ticker: StdMutex::new(ticker) }
    }

    pub fn pool_id(&self) -> PoolId {
        self.inner.pool_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Publish a new entry (spec.md §4.4 "Publish").
    pub fn send(&self, name: &str, plaintext: &[u8], meta: Vec<u8>) -> Result<FeedHead> {
        let _guard = self.inner.lock.lock();
        let keystore = self.inner.access_engine().keystore()?;
        let master_id = keystore.current_id().ok_or_else(|| PoolError::not_authorized("no master key to encrypt under"))?;
        self.inner.feed_engine().send(self.inner.primary(), &keystore, master_id, name, plaintext, meta)
    }

    /// Discover newly-published entries (spec.md §4.4 "Subscribe"). Also
    /// reclaims lifespan-expired entries on the primary: `Bandwidth::Low`
    /// pools never spawn a replica ticker (spec.md §6), so an explicit
    /// `sync` is the only GC opportunity they get.
    pub fn sync(&self, force: bool) -> Result<Vec<FeedHead>> {
        let _guard = self.inner.lock.lock();
        let keystore = self.inner.access_engine().keystore()?;
        let lookup = |user_id: &UserId| self.inner.identity_lookup(user_id);
        let feed = self.inner.feed_engine();
        let discovered = feed.sync(self.inner.primary(), &keystore, &lookup, force)?;
        if let Err(e) = feed.gc_tick(self.inner.primary()) {
            tracing::warn!(pool = %self.inner.pool_id, error = %e, "sync: feed gc failed");
            self.inner.diagnostics.push(format!("[{}] feed gc failed: {e}", self.inner.pool_id));
        }
        Ok(discovered)
    }

    /// Fetch and decrypt an entry's body (spec.md §4.4 "Fetch"). Read-only
    /// once the entry is cached, so it does not take the backend lock.
    pub fn receive(&self, id: Snowflake, range: Option<ByteRange>) -> Result<Vec<u8>> {
        let keystore = self.inner.access_engine().keystore()?;
        self.inner.feed_engine().receive(self.inner.primary(), &keystore, id, range)
    }

    /// Grant or revoke a member, effective on the next [`Pool::export_access`]
    /// (spec.md §4.5).
    pub fn set_access(&self, user_id: UserId, state: AccessState) -> Result<()> {
        let _guard = self.inner.lock.lock();
        self.inner.access_engine().set_access(user_id, state)
    }

    /// Write a fresh signed access file reflecting pending `set_access`
    /// calls (spec.md §4.5 "Write (export-access)").
    pub fn export_access(&self) -> Result<()> {
        let _guard = self.inner.lock.lock();
        self.inner.access_engine().export_access(self.inner.primary())
    }

    /// Snapshot of this pool's state for diagnostics (spec.md §7
    /// "User-visible behavior": "`dump` returns a snapshot of per-pool
    /// state").
    pub fn dump(&self) -> Result<PoolDump> {
        let keystore = self.inner.access_engine().keystore()?;
        let members = self.inner.access_engine().local_records()?.into_values().collect();
        let entries = self.inner.feed_engine().known_entries()?;
        Ok(PoolDump {
            pool_id: self.inner.pool_id,
            name: self.inner.name.clone(),
            primary_backend: self.inner.primary_url().to_string(),
            bandwidth: self.inner.bandwidth,
            master_key_id: keystore.current_id(),
            members,
            feed_entry_count: entries.len(),
            recent_log_lines: self.inner.diagnostics.snapshot(),
        })
    }

    /// Flush the replica ticker and close every backend (spec.md §4.8
    /// "Close").
    pub fn close(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.ticker.lock().expect("ticker mutex poisoned").take() {
            let _ = handle.join();
        }
        for backend in &self.inner.backends {
            backend.store.close()?;
        }
        Ok(())
    }

    /// Wipe all pool-scoped local state. Does not touch remote content
    /// (spec.md §4.8 "Leave": "other members may still use it").
    pub fn leave(&self) -> Result<()> {
        for scope in poolmesh_access::local_scopes(self.inner.pool_id) {
            self.inner.local.clear_scope(&scope)?;
        }
        for scope in poolmesh_feed::local_scopes(self.inner.pool_id) {
            self.inner.local.clear_scope(&scope)?;
        }
        self.inner.cache.clear()
    }

    /// Spawn a child pool named `<parent>/@/<sub>`, sharing this pool's
    /// backends but with independent keys and members (spec.md §4.8
    /// "Sub-pool"). A parent name that already contains a `/@/` segment is
    /// flattened so the child still has exactly one.
    pub fn sub_pool(&self, sub_name: &str, globals: Globals, force: bool) -> Result<Pool> {
        let base = self.inner.name.split("/@/").next().unwrap_or(&self.inner.name);
        let child_name = format!("{base}/@/{sub_name}");
        let child_config = Config {
            pool: poolmesh_core::PoolSection {
                name: child_name,
                public: self.inner.backends.iter().map(|b| b.url.clone()).collect(),
                private: Vec::new(),
                apps: Vec::new(),
                life_span_hours: self.inner.lifespan_hours,
            },
            cache: poolmesh_core::CacheSection { size_mb: 0 },
            bandwidth: self.inner.bandwidth,
        };
        Pool::create(&child_config, globals, force)
    }
}

/// One pass of the background replica ticker (spec.md §4.4 "GC & replica",
/// §5 "replica loops run as separate long-lived tasks"). Every step is
/// best-effort: failures are logged and swallowed (spec.md §7 propagation
/// policy), since a transient backend hiccup must never poison the pool.
fn run_tick(inner: &Arc<PoolInner>) {
    let _guard = inner.lock.lock();
    if let Err(e) = inner.access_engine().sync_access(inner.primary(), false) {
        tracing::warn!(pool = %inner.pool_id, error = %e, "replica tick: sync-access failed");
        inner.diagnostics.push(format!("[{}] sync-access failed: {e}", inner.pool_id));
    }

    // Lifespan-expired entries must be reclaimed at every bandwidth tier
    // (spec.md §4.4 "GC"), not only under High — GC is local housekeeping
    // against the primary, unrelated to how much cross-backend syncing a
    // tier is willing to do.
    let feed = inner.feed_engine();
    if let Err(e) = feed.gc_tick(inner.primary()) {
        tracing::warn!(pool = %inner.pool_id, error = %e, "replica tick: feed gc failed");
        inner.diagnostics.push(format!("[{}] feed gc failed: {e}", inner.pool_id));
    }

    if inner.bandwidth == Bandwidth::Low || inner.backends.len() < 2 {
        return;
    }
    let primary = inner.primary();
    for secondary in &inner.backends[1..] {
        for dir in ["access", "identities"] {
            if let Err(e) = poolmesh_store::sync_bidirectional(primary, secondary.store.as_ref(), dir) {
                tracing::warn!(pool = %inner.pool_id, %dir, error = %e, "replica tick: directory sync failed");
                inner.diagnostics.push(format!("[{}] {dir} sync failed: {e}", inner.pool_id));
            }
        }
    }

    if inner.bandwidth != Bandwidth::High {
        return;
    }
    for backend in &inner.backends[1..] {
        if let Err(e) = feed.gc_tick(backend.store.as_ref()) {
            tracing::warn!(pool = %inner.pool_id, error = %e, "replica tick: feed gc failed");
            inner.diagnostics.push(format!("[{}] feed gc failed: {e}", inner.pool_id));
        }
    }
    match feed.known_entries() {
        Ok(entries) => {
            for entry in entries {
                for secondary in &inner.backends[1..] {
                    feed.replicate_entry(primary, secondary.store.as_ref(), &entry.slot, entry.head.id);
                }
            }
        }
        Err(e) => {
            tracing::warn!(pool = %inner.pool_id, error = %e, "replica tick: listing known entries failed");
            inner.diagnostics.push(format!("[{}] listing known entries failed: {e}", inner.pool_id));
        }
    }
}
