//! `FeedEngine`: append-only time-slotted publish/discover (spec.md §4.4).

use crate::cache::FeedCache;
use crate::head::{EntryState, FeedHead, LocalEntry};
use chrono::Utc;
use ed25519_dalek::Signature;
use poolmesh_core::{Clock, KeyId, LocalStore, PoolError, PoolId, Result, Snowflake, SnowflakeGenerator, UserId};
use poolmesh_crypto::{codec, Identity, IdentityPublic, Keystore, KeystoreLookup};
use poolmesh_store::{BlobStore, ByteRange};
use std::collections::HashSet;
use std::io::Cursor;

const FEEDS_DIR: &str = "feeds";
const FEEDS_SENTINEL: &str = "feeds/.touch";
const ENTRIES_SCOPE_PREFIX: &str = "feed-entries";
const META_SCOPE_PREFIX: &str = "feed-meta";
const LAST_SLOT_KEY: &str = "last-slot";
const LAST_TOUCH_KEY: &str = "last-touch";
const CTIME_COUNTER_KEY: &str = "ctime-counter";

fn entries_scope(pool_id: PoolId) -> String {
    format!("{ENTRIES_SCOPE_PREFIX}:{}", pool_id.0)
}

fn meta_scope(pool_id: PoolId) -> String {
    format!("{META_SCOPE_PREFIX}:{}", pool_id.0)
}

/// The local-store scopes this module owns for `pool_id` (cached entries
/// plus sync cursors), for `leave`-style cleanup by callers outside this
/// crate.
pub fn local_scopes(pool_id: PoolId) -> Vec<String> {
    vec![entries_scope(pool_id), meta_scope(pool_id)]
}

/// Resolves a member's public identity, so [`FeedEngine`] can verify
/// authorship without depending on `poolmesh-access`'s trust store
/// directly. The `poolmesh` coordinator wires this to
/// `poolmesh_access::identities::trusted`.
pub trait IdentityLookup {
    /// Look up a previously-verified identity for `user_id`.
    fn lookup(&self, user_id: &UserId) -> Result<Option<IdentityPublic>>;
}

impl<F: Fn(&UserId) -> Result<Option<IdentityPublic>>> IdentityLookup for F {
    fn lookup(&self, user_id: &UserId) -> Result<Option<IdentityPublic>> {
        self(user_id)
    }
}

fn slot_for(id: Snowflake) -> String {
    let at: chrono::DateTime<Utc> = id.timestamp().into();
    at.format("%Y%m%d").to_string()
}

/// Drives `send`/`publish`, `sync`/subscribe, `receive`/fetch, and GC for
/// one pool's feed on one member's node.
pub struct FeedEngine<'a> {
    pub identity: &'a Identity,
    pub pool_id: PoolId,
    pub local: &'a LocalStore,
    pub clock: &'a Clock,
    pub ids: &'a SnowflakeGenerator,
    pub lifespan_hours: u64,
    pub cache: &'a FeedCache,
}

impl<'a> FeedEngine<'a> {
    pub fn new(
        identity: &'a Identity,
        pool_id: PoolId,
        local: &'a LocalStore,
        clock: &'a Clock,
        ids: &'a SnowflakeGenerator,
        lifespan_hours: u64,
        cache: &'a FeedCache,
    ) -> Self {
        Self { identity, pool_id, local, clock, ids, lifespan_hours, cache }
    }

    fn base_id(&self) -> Snowflake {
        let cutoff = self.clock.now() - chrono::Duration::hours(self.lifespan_hours as i64);
        Snowflake::floor_at(cutoff.into())
    }

    fn local_entry(&self, id: Snowflake) -> Result<Option<LocalEntry>> {
        self.local.get_json(&entries_scope(self.pool_id), &id.to_string())
    }

    /// Every entry this node currently knows about, for the `poolmesh`
    /// coordinator's replica tick (which needs each entry's `slot` to
    /// call [`Self::replicate_entry`] without reaching into this crate's
    /// scope naming).
    pub fn known_entries(&self) -> Result<Vec<LocalEntry>> {
        let mut out = Vec::new();
        for key in self.local.list_keys(&entries_scope(self.pool_id))? {
            if let Some(entry) = self.local.get_json::<LocalEntry>(&entries_scope(self.pool_id), &key)? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn save_local_entry(&self, entry: &LocalEntry) -> Result<()> {
        self.local.put_json(&entries_scope(self.pool_id), &entry.head.id.to_string(), entry)
    }

    fn last_slot(&self) -> Result<Option<String>> {
        self.local.get_json(&meta_scope(self.pool_id), LAST_SLOT_KEY)
    }

    fn save_last_slot(&self, slot: &str) -> Result<()> {
        self.local.put_json(&meta_scope(self.pool_id), LAST_SLOT_KEY, &slot.to_string())
    }

    fn last_touch(&self) -> Result<Option<chrono::DateTime<Utc>>> {
        self.local.get_json(&meta_scope(self.pool_id), LAST_TOUCH_KEY)
    }

    fn save_last_touch(&self, t: chrono::DateTime<Utc>) -> Result<()> {
        self.local.put_json(&meta_scope(self.pool_id), LAST_TOUCH_KEY, &t)
    }

    fn next_ctime(&self) -> Result<i64> {
        let prev: i64 = self.local.get_json(&meta_scope(self.pool_id), CTIME_COUNTER_KEY)?.unwrap_or(0);
        let next = prev + 1;
        self.local.put_json(&meta_scope(self.pool_id), CTIME_COUNTER_KEY, &next)?;
        Ok(next)
    }

    /// Publish a new entry (spec.md §4.4 "Publish"). `keystore`/`master_id`
    /// are supplied by the caller (the `poolmesh` coordinator holds the
    /// authoritative keystore shared with `AccessEngine`).
    pub fn send(
        &self,
        store: &dyn BlobStore,
        keystore: &Keystore,
        master_id: KeyId,
        name: &str,
        plaintext: &[u8],
        meta: Vec<u8>,
    ) -> Result<FeedHead> {
        let id = self.ids.next_id_at(self.clock.now_system());
        let slot = slot_for(id);
        let keyfn = KeystoreLookup(keystore);

        let (body_blob, hash) = codec::encrypt(master_id, &keyfn, plaintext)?;
        let body_len = body_blob.len() as u64;
        store.write(&format!("{FEEDS_DIR}/{slot}/{id}.body"), &mut Cursor::new(body_blob), body_len)?;

        let signature = self.identity.sign(&hash).to_bytes().to_vec();
        let head = FeedHead {
            id,
            name: name.to_string(),
            size: plaintext.len() as i64,
            hash,
            mod_time: self.clock.now(),
            author_id: self.identity.user_id(),
            signature,
            meta,
        };
        let head_json = serde_json::to_vec(&head)?;
        let (head_blob, _) = codec::encrypt(master_id, &keyfn, &head_json)?;
        let head_len = head_blob.len() as u64;
        store.write(&format!("{FEEDS_DIR}/{slot}/{id}.head"), &mut Cursor::new(head_blob), head_len)?;

        store.write(FEEDS_SENTINEL, &mut std::io::empty(), 0)?;

        self.save_local_entry(&LocalEntry {
            head: head.clone(),
            slot,
            ctime: self.next_ctime()?,
            state: EntryState::Cached,
        })?;
        Ok(head)
    }

    /// Replicate one entry's head and body onto `secondary`, if missing
    /// there. Called by the `poolmesh` coordinator's async replica tier
    /// (spec.md §4.4 "GC & replica": secondary replication is asynchronous
    /// and its failures are logged, never fatal).
    pub fn replicate_entry(&self, primary: &dyn BlobStore, secondary: &dyn BlobStore, slot: &str, id: Snowflake) {
        for ext in [".head", ".body"] {
            let path = format!("{FEEDS_DIR}/{slot}/{id}{ext}");
            if secondary.stat(&path).is_ok() {
                continue;
            }
            let mut bytes = Vec::new();
            if let Err(e) = primary.read(&path, None, &mut bytes) {
                tracing::warn!(%path, error = %e, "secondary replication: read from primary failed");
                continue;
            }
            let len = bytes.len() as u64;
            if let Err(e) = secondary.write(&path, &mut Cursor::new(bytes), len) {
                tracing::warn!(%path, error = %e, "secondary replication: write to secondary failed");
            }
        }
        let _ = secondary.write(FEEDS_SENTINEL, &mut std::io::empty(), 0);
    }

    /// Discover newly-published entries (spec.md §4.4 "Subscribe"). Returns
    /// the heads discovered this call, in slot order.
    pub fn sync(
        &self,
        store: &dyn BlobStore,
        keystore: &Keystore,
        identities: &dyn IdentityLookup,
        force: bool,
    ) -> Result<Vec<FeedHead>> {
        let remote_touch = match store.stat(FEEDS_SENTINEL) {
            Ok(entry) => Some(entry.mod_time),
            Err(PoolError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let Some(remote_touch) = remote_touch else { return Ok(Vec::new()) };
        if !force {
            if let Some(local_touch) = self.last_touch()? {
                if remote_touch <= local_touch {
                    return Ok(Vec::new());
                }
            }
        }

        let base_id = self.base_id();
        let cursor = self.last_slot()?;
        let mut slots: Vec<String> = match store.list(FEEDS_DIR) {
            Ok(entries) => entries.into_iter().filter(|e| e.is_dir).map(|e| e.name).collect(),
            Err(PoolError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        slots.sort();
        if let Some(cursor) = &cursor {
            slots.retain(|s| s >= cursor);
        }

        let keyfn = KeystoreLookup(keystore);
        let mut discovered = Vec::new();
        let mut skipped_total = 0u32;
        let mut last_clean_slot = cursor;

        for slot in &slots {
            let entries = match store.list(&format!("{FEEDS_DIR}/{slot}")) {
                Ok(entries) => entries,
                Err(PoolError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            let mut skipped_in_slot = 0u32;

            for entry in entries {
                let Some(id_str) = entry.name.strip_suffix(".head") else { continue };
                let Some(id) = Snowflake::parse(id_str) else { continue };
                if self.local_entry(id)?.is_some() {
                    continue;
                }
                if id < base_id {
                    for ext in [".head", ".body"] {
                        let path = format!("{FEEDS_DIR}/{slot}/{id}{ext}");
                        if let Err(e) = store.delete(&path) {
                            tracing::warn!(%path, error = %e, "sync: failed to reclaim expired entry");
                        }
                    }
                    continue;
                }

                let mut bytes = Vec::new();
                store.read(&format!("{FEEDS_DIR}/{slot}/{}", entry.name), None, &mut bytes)?;
                let (head_json, _) = match codec::decrypt(&keyfn, &bytes) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(%id, error = %e, "dropping feed head: decrypt failed");
                        continue;
                    }
                };
                let head: FeedHead = serde_json::from_slice(&head_json)?;

                let Some(author) = identities.lookup(&head.author_id)? else {
                    skipped_in_slot += 1;
                    continue;
                };
                let Ok(sig_bytes) = <[u8; 64]>::try_from(head.signature.as_slice()) else {
                    tracing::warn!(%id, "dropping feed head: malformed signature");
                    continue;
                };
                let signature = Signature::from_bytes(&sig_bytes);
                if author.verify(&head.hash, &signature).is_err() {
                    tracing::warn!(%id, "dropping feed head: signature verification failed");
                    continue;
                }

                let ctime = self.next_ctime()?;
                self.save_local_entry(&LocalEntry {
                    head: head.clone(),
                    slot: slot.clone(),
                    ctime,
                    state: EntryState::Discovered,
                })?;
                discovered.push(head);
            }

            skipped_total += skipped_in_slot;
            if skipped_in_slot == 0 {
                last_clean_slot = Some(slot.clone());
            }
        }

        if let Some(slot) = last_clean_slot {
            self.save_last_slot(&slot)?;
        }
        if skipped_total == 0 {
            self.save_last_touch(remote_touch)?;
        }
        Ok(discovered)
    }

    /// Fetch and decrypt an entry's body (spec.md §4.4 "Fetch"), consulting
    /// the local cache first and verifying the decrypted hash against the
    /// entry's signed head. `range` slices the plaintext after decryption.
    pub fn receive(
        &self,
        store: &dyn BlobStore,
        keystore: &Keystore,
        id: Snowflake,
        range: Option<ByteRange>,
    ) -> Result<Vec<u8>> {
        let entry = self
            .local_entry(id)?
            .ok_or_else(|| PoolError::invalid_id(format!("unknown feed entry {id}")))?;

        let plaintext = match self.cache.get(id) {
            Some(cached) => cached,
            None => {
                let mut bytes = Vec::new();
                store.read(&format!("{FEEDS_DIR}/{}/{id}.body", entry.slot), None, &mut bytes)?;
                let keyfn = KeystoreLookup(keystore);
                let (plaintext, hash) = codec::decrypt(&keyfn, &bytes)?;
                if hash != entry.head.hash {
                    return Err(PoolError::integrity(format!("body hash mismatch for entry {id}")));
                }
                let mut updated = entry.clone();
                updated.state = EntryState::Cached;
                self.save_local_entry(&updated)?;
                self.cache.put(id, &plaintext)?;
                plaintext
            }
        };

        Ok(match range {
            Some(r) => {
                let from = (r.from as usize).min(plaintext.len());
                let to = (r.to as usize).min(plaintext.len());
                plaintext[from..to].to_vec()
            }
            None => plaintext,
        })
    }

    /// Delete entries older than the lifespan cutoff on `store`, on every
    /// slot directory (spec.md §4.4 "GC"). Returns the number of objects
    /// deleted.
    pub fn gc_tick(&self, store: &dyn BlobStore) -> Result<usize> {
        let base_id = self.base_id();
        let slots = match store.list(FEEDS_DIR) {
            Ok(entries) => entries.into_iter().filter(|e| e.is_dir).map(|e| e.name).collect::<Vec<_>>(),
            Err(PoolError::NotFound { .. }) => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut deleted = 0;
        let mut stale_ids = HashSet::new();
        for slot in slots {
            let entries = match store.list(&format!("{FEEDS_DIR}/{slot}")) {
                Ok(entries) => entries,
                Err(PoolError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            for entry in entries {
                let stem = entry.name.strip_suffix(".head").or_else(|| entry.name.strip_suffix(".body"));
                let Some(stem) = stem else { continue };
                let Some(id) = Snowflake::parse(stem) else { continue };
                if id >= base_id {
                    continue;
                }
                store.delete(&format!("{FEEDS_DIR}/{slot}/{}", entry.name))?;
                stale_ids.insert(id);
                deleted += 1;
            }
        }
        for id in stale_ids {
            self.local.delete(&entries_scope(self.pool_id), &id.to_string())?;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolmesh_core::KeyId;
    use poolmesh_store::MemoryBlobStore;

    fn synced_clock() -> Clock {
        let clock = Clock::unsynced();
        clock.record_offset(0);
        clock
    }

    fn keystore_with(id: KeyId, value: [u8; 32]) -> Keystore {
        let mut ks = Keystore::new();
        ks.put(id, value);
        ks.set_current(id);
        ks
    }

    #[test]
    fn send_then_receive_round_trips_payload_and_size() {
        let store = MemoryBlobStore::new();
        let local = LocalStore::in_memory().unwrap();
        let clock = synced_clock();
        let ids = SnowflakeGenerator::new(1);
        let cache = FeedCache::disabled();
        let identity = Identity::from_seed([1u8; 32], "alice");
        let keystore = keystore_with(KeyId(1), [9u8; 32]);
        let engine = FeedEngine::new(&identity, PoolId(1), &local, &clock, &ids, 720, &cache);

        let head = engine
            .send(&store, &keystore, KeyId(1), "note.txt", b"just a simple test", Vec::new())
            .unwrap();
        assert_eq!(head.size, 18);

        let bytes = engine.receive(&store, &keystore, head.id, None).unwrap();
        assert_eq!(bytes, b"just a simple test");
    }

    #[test]
    fn receive_detects_tampered_ciphertext() {
        let store = MemoryBlobStore::new();
        let local = LocalStore::in_memory().unwrap();
        let clock = synced_clock();
        let ids = SnowflakeGenerator::new(1);
        let cache = FeedCache::disabled();
        let identity = Identity::from_seed([1u8; 32], "alice");
        let keystore = keystore_with(KeyId(1), [9u8; 32]);
        let engine = FeedEngine::new(&identity, PoolId(1), &local, &clock, &ids, 720, &cache);

        let head = engine.send(&store, &keystore, KeyId(1), "n", b"original payload", Vec::new()).unwrap();
        let mut tampered = Vec::new();
        store.read(&format!("feeds/{}/{}.body", slot_for(head.id), head.id), None, &mut tampered).unwrap();
        *tampered.last_mut().unwrap() ^= 0xFF;
        store
            .write(
                &format!("feeds/{}/{}.body", slot_for(head.id), head.id),
                &mut Cursor::new(tampered.clone()),
                tampered.len() as u64,
            )
            .unwrap();

        assert!(matches!(
            engine.receive(&store, &keystore, head.id, None),
            Err(PoolError::IntegrityError { .. })
        ));
    }

    #[test]
    fn sync_discovers_entries_published_by_another_member() {
        let store = MemoryBlobStore::new();
        let alice_local = LocalStore::in_memory().unwrap();
        let bob_local = LocalStore::in_memory().unwrap();
        let clock = synced_clock();
        let ids = SnowflakeGenerator::new(1);
        let alice_cache = FeedCache::disabled();
        let bob_cache = FeedCache::disabled();
        let alice = Identity::from_seed([1u8; 32], "alice");
        let bob = Identity::from_seed([2u8; 32], "bob");
        let keystore = keystore_with(KeyId(1), [5u8; 32]);

        let alice_engine = FeedEngine::new(&alice, PoolId(1), &alice_local, &clock, &ids, 720, &alice_cache);
        let bob_engine = FeedEngine::new(&bob, PoolId(1), &bob_local, &clock, &ids, 720, &bob_cache);

        let head = alice_engine.send(&store, &keystore, KeyId(1), "msg", b"hello bob", Vec::new()).unwrap();

        let alice_public = alice.public();
        let lookup = move |user_id: &UserId| -> Result<Option<IdentityPublic>> {
            if *user_id == alice_public.user_id() { Ok(Some(alice_public.clone())) } else { Ok(None) }
        };

        let discovered = bob_engine.sync(&store, &keystore, &lookup, true).unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].id, head.id);

        let bytes = bob_engine.receive(&store, &keystore, head.id, None).unwrap();
        assert_eq!(bytes, b"hello bob");
    }

    #[test]
    fn sync_defers_entries_from_unknown_authors_and_withholds_cursor() {
        let store = MemoryBlobStore::new();
        let alice_local = LocalStore::in_memory().unwrap();
        let bob_local = LocalStore::in_memory().unwrap();
        let clock = synced_clock();
        let ids = SnowflakeGenerator::new(1);
        let alice_cache = FeedCache::disabled();
        let bob_cache = FeedCache::disabled();
        let alice = Identity::from_seed([1u8; 32], "alice");
        let bob = Identity::from_seed([2u8; 32], "bob");
        let keystore = keystore_with(KeyId(1), [5u8; 32]);

        let alice_engine = FeedEngine::new(&alice, PoolId(1), &alice_local, &clock, &ids, 720, &alice_cache);
        let bob_engine = FeedEngine::new(&bob, PoolId(1), &bob_local, &clock, &ids, 720, &bob_cache);
        alice_engine.send(&store, &keystore, KeyId(1), "msg", b"hello", Vec::new()).unwrap();

        let no_one: Result<Option<IdentityPublic>> = Ok(None);
        let lookup = move |_: &UserId| -> Result<Option<IdentityPublic>> { no_one.clone() };
        let discovered = bob_engine.sync(&store, &keystore, &lookup, true).unwrap();
        assert!(discovered.is_empty());
        assert!(bob_engine.last_touch().unwrap().is_none(), "skip must withhold the last-touch cursor");
    }

    #[test]
    fn sync_reclaims_entries_already_past_the_lifespan() {
        let store = MemoryBlobStore::new();
        let alice_local = LocalStore::in_memory().unwrap();
        let bob_local = LocalStore::in_memory().unwrap();
        let clock = synced_clock();
        let ids = SnowflakeGenerator::new(1);
        let alice_cache = FeedCache::disabled();
        let bob_cache = FeedCache::disabled();
        let alice = Identity::from_seed([1u8; 32], "alice");
        let bob = Identity::from_seed([2u8; 32], "bob");
        let keystore = keystore_with(KeyId(1), [5u8; 32]);

        let alice_engine = FeedEngine::new(&alice, PoolId(1), &alice_local, &clock, &ids, 720, &alice_cache);
        // Bob's own lifespan is 0 hours, so his base-id floor is "now":
        // anything already published is immediately past its lifespan from
        // his point of view.
        let bob_engine = FeedEngine::new(&bob, PoolId(1), &bob_local, &clock, &ids, 0, &bob_cache);
        let head = alice_engine.send(&store, &keystore, KeyId(1), "msg", b"stale by the time bob looks", Vec::new()).unwrap();

        let alice_public = alice.public();
        let lookup = move |user_id: &UserId| -> Result<Option<IdentityPublic>> {
            if *user_id == alice_public.user_id() { Ok(Some(alice_public.clone())) } else { Ok(None) }
        };

        let discovered = bob_engine.sync(&store, &keystore, &lookup, true).unwrap();
        assert!(discovered.is_empty(), "an already-expired entry must not be surfaced as discovered");
        assert!(store.stat(&format!("feeds/{}/{}.head", slot_for(head.id), head.id)).is_err());
        assert!(store.stat(&format!("feeds/{}/{}.body", slot_for(head.id), head.id)).is_err());
    }

    #[test]
    fn gc_tick_deletes_entries_older_than_the_lifespan() {
        let store = MemoryBlobStore::new();
        let local = LocalStore::in_memory().unwrap();
        let clock = synced_clock();
        let ids = SnowflakeGenerator::new(1);
        let cache = FeedCache::disabled();
        let identity = Identity::from_seed([1u8; 32], "alice");
        let keystore = keystore_with(KeyId(1), [9u8; 32]);
        // Lifespan of 0 hours: the base-id floor is "now", so anything
        // already published is immediately eligible for GC.
        let engine = FeedEngine::new(&identity, PoolId(1), &local, &clock, &ids, 0, &cache);

        let head = engine.send(&store, &keystore, KeyId(1), "n", b"old news", Vec::new()).unwrap();
        let deleted = engine.gc_tick(&store).unwrap();
        assert_eq!(deleted, 2, "head and body should both be removed");
        assert!(store.stat(&format!("feeds/{}/{}.head", slot_for(head.id), head.id)).is_err());
    }
}
