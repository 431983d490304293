//! `AccessEngine`: the distributed access-file merge protocol (spec.md
//! §4.5).

use crate::access::{AccessFile, AccessRecord, AccessState, KeyEntry, ACCESS_FILE_VERSION};
use crate::identities;
use poolmesh_core::{Clock, KeyId, LocalStore, PoolError, PoolId, Result, Snowflake, SnowflakeGenerator, UserId};
use poolmesh_crypto::{envelope, Identity, IdentityPublic, Keystore};
use poolmesh_store::{BlobStore, Guard};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;

const ACCESS_DIR: &str = "access";
const ACCESS_SENTINEL: &str = "access/.touch";
const RECORDS_SCOPE_PREFIX: &str = "access-records";
const META_SCOPE_PREFIX: &str = "access-meta";
const KEYSTORE_KEY: &str = "keystore";
const LAST_READ_KEY: &str = "last-read-id";
const REVOCATION_PENDING_KEY: &str = "revocation-pending";

fn records_scope(pool_id: PoolId) -> String {
    format!("{RECORDS_SCOPE_PREFIX}:{}", pool_id.0)
}

fn meta_scope(pool_id: PoolId) -> String {
    format!("{META_SCOPE_PREFIX}:{}", pool_id.0)
}

/// The local-store scopes this engine owns for `pool_id`, for callers
/// (the `poolmesh` coordinator's `leave`) that need to wipe all
/// pool-scoped local state without knowing this crate's internal scope
/// naming.
pub fn local_scopes(pool_id: PoolId) -> Vec<String> {
    vec![records_scope(pool_id), meta_scope(pool_id)]
}

/// Drives `export-access` and `sync-access` for one pool on one member's
/// node. Holds no state of its own beyond what it reads from/writes to
/// `local` and the backend; safe to recreate per call.
pub struct AccessEngine<'a> {
    pub identity: &'a Identity,
    pub pool_id: PoolId,
    pub local: &'a LocalStore,
    pub clock: &'a Clock,
    pub ids: &'a SnowflakeGenerator,
    pub backend_id: &'a str,
}

impl<'a> AccessEngine<'a> {
    pub fn new(
        identity: &'a Identity,
        pool_id: PoolId,
        local: &'a LocalStore,
        clock: &'a Clock,
        ids: &'a SnowflakeGenerator,
        backend_id: &'a str,
    ) -> Self {
        Self { identity, pool_id, local, clock, ids, backend_id }
    }

    fn guard(&self) -> Guard<'_> {
        Guard::new(self.local, self.backend_id, ACCESS_SENTINEL)
    }

    /// Every access record this node currently believes, keyed by member.
    pub fn local_records(&self) -> Result<HashMap<UserId, AccessRecord>> {
        let mut out = HashMap::new();
        for key in self.local.list_keys(&records_scope(self.pool_id))? {
            if let Some(record) = self.local.get_json::<AccessRecord>(&records_scope(self.pool_id), &key)? {
                out.insert(record.user_id.clone(), record);
            }
        }
        Ok(out)
    }

    fn save_record(&self, record: &AccessRecord) -> Result<()> {
        self.local.put_json(&records_scope(self.pool_id), record.user_id.as_str(), record)
    }

    /// Grant or revoke a member locally; takes effect on the next
    /// [`Self::export_access`]. A transition from Active to Disabled
    /// queues a master-key rotation for that export (spec.md §3
    /// invariant: "after a membership revocation the master-key-id
    /// strictly increases").
    pub fn set_access(&self, user_id: UserId, state: AccessState) -> Result<()> {
        if state == AccessState::Disabled {
            let was_active = self
                .local
                .get_json::<AccessRecord>(&records_scope(self.pool_id), user_id.as_str())?
                .map(|r| r.is_active())
                .unwrap_or(false);
            if was_active {
                self.mark_revocation_pending()?;
            }
        }
        let since = self.clock.now().timestamp_millis();
        self.save_record(&AccessRecord::new(user_id, state, since))
    }

    pub fn keystore(&self) -> Result<Keystore> {
        Ok(self.local.get_json(&meta_scope(self.pool_id), KEYSTORE_KEY)?.unwrap_or_default())
    }

    fn save_keystore(&self, keystore: &Keystore) -> Result<()> {
        self.local.put_json(&meta_scope(self.pool_id), KEYSTORE_KEY, keystore)
    }

    fn last_read_id(&self) -> Result<Option<Snowflake>> {
        self.local.get_json(&meta_scope(self.pool_id), LAST_READ_KEY)
    }

    fn save_last_read_id(&self, id: Snowflake) -> Result<()> {
        self.local.put_json(&meta_scope(self.pool_id), LAST_READ_KEY, &id)
    }

    fn trust(&self, user_id: &UserId) -> Result<Option<IdentityPublic>> {
        identities::trusted(self.local, self.pool_id, user_id)
    }

    fn mark_revocation_pending(&self) -> Result<()> {
        self.local.put_json(&meta_scope(self.pool_id), REVOCATION_PENDING_KEY, &true)
    }

    fn revocation_pending(&self) -> Result<bool> {
        Ok(self.local.get_json(&meta_scope(self.pool_id), REVOCATION_PENDING_KEY)?.unwrap_or(false))
    }

    fn clear_revocation_pending(&self) -> Result<()> {
        self.local.delete(&meta_scope(self.pool_id), REVOCATION_PENDING_KEY)
    }

    /// Mint and install a brand-new master key, one higher than any key id
    /// this node has ever observed.
    fn rotate_master(&self, keystore: &mut Keystore) -> KeyId {
        let next_id = KeyId(keystore.max_key_id().map(|k| k.0).unwrap_or(0) + 1);
        let mut value = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut value);
        keystore.put(next_id, value);
        keystore.set_current(next_id);
        next_id
    }

    /// Create a brand-new master key and make this the sole member
    /// (spec.md §4.8 "Create"). Does not touch the backend.
    pub fn bootstrap_self(&self) -> Result<()> {
        let mut keystore = self.keystore()?;
        self.rotate_master(&mut keystore);
        self.save_keystore(&keystore)?;
        self.set_access(self.identity.user_id(), AccessState::Active)
    }

    /// Write a fresh, signed access file reflecting the current local
    /// access records and keystore (spec.md §4.5 "Write (export-access)").
    pub fn export_access(&self, store: &dyn BlobStore) -> Result<()> {
        if !self.clock.is_synced() {
            return Err(PoolError::no_sync_clock("cannot export an access file without an NTP offset"));
        }
        let mut keystore = self.keystore()?;
        if self.revocation_pending()? {
            self.rotate_master(&mut keystore);
            self.save_keystore(&keystore)?;
            self.clear_revocation_pending()?;
        }
        let master_key_id = keystore
            .current_id()
            .ok_or_else(|| PoolError::not_authorized("no master key to export"))?;
        let master_value = keystore
            .current_value()
            .ok_or_else(|| PoolError::not_authorized("master key id has no value in local keystore"))?;

        let records = self.local_records()?;
        let mut keys = Vec::with_capacity(records.len());
        for record in records.values() {
            if !record.is_active() {
                keys.push(KeyEntry { user_id: record.user_id.clone(), since: record.since, value: None });
                continue;
            }
            let public = if record.user_id == self.identity.user_id() {
                self.identity.public()
            } else if let Some(public) = self.trust(&record.user_id)? {
                public
            } else {
                tracing::warn!(user_id = %record.user_id, "skipping active member with unknown identity");
                continue;
            };
            let wrapped = public.wrap_key(&master_value)?;
            keys.push(KeyEntry { user_id: record.user_id.clone(), since: record.since, value: Some(wrapped) });
        }

        let (nonce, ciphertext) = keystore.seal(&master_value)?;
        let id = self.ids.next_id_at(self.clock.now_system());
        let file = AccessFile {
            id,
            version: ACCESS_FILE_VERSION,
            pool_id: self.pool_id,
            keys,
            nonce,
            master_key_id,
            keystore: ciphertext,
            apps: Vec::new(),
        };
        let value = serde_json::to_value(&file)?;
        let signed = envelope::sign(value, &self.identity.user_id(), self.identity.signing_key())?;
        let bytes = serde_json::to_vec(&signed)?;

        let path = format!("{ACCESS_DIR}/{id}");
        store.write(&path, &mut Cursor::new(bytes), 0)?;
        self.guard().touch(store, ACCESS_SENTINEL)?;

        if let Some(last_read) = self.last_read_id()? {
            self.prune_older_than(store, last_read, id)?;
        }
        Ok(())
    }

    fn prune_older_than(&self, store: &dyn BlobStore, cutoff: Snowflake, keep: Snowflake) -> Result<()> {
        let entries = match store.list(ACCESS_DIR) {
            Ok(entries) => entries,
            Err(PoolError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            if entry.name == ".touch" {
                continue;
            }
            let Some(id) = Snowflake::parse(&entry.name) else { continue };
            if id.0 <= cutoff.0 && id.0 != keep.0 {
                store.delete(&format!("{ACCESS_DIR}/{}", entry.name))?;
            }
        }
        Ok(())
    }

    /// List and decode every access file currently published, newest
    /// first.
    fn list_access_files(&self, store: &dyn BlobStore) -> Result<Vec<(Snowflake, AccessFile)>> {
        let entries = match store.list(ACCESS_DIR) {
            Ok(entries) => entries,
            Err(PoolError::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        for entry in entries {
            if entry.name == ".touch" {
                continue;
            }
            let Some(id) = Snowflake::parse(&entry.name) else { continue };
            let mut bytes = Vec::new();
            store.read(&format!("{ACCESS_DIR}/{}", entry.name), None, &mut bytes)?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)?;
            let signer_id = envelope::peek_signer_id(&value)?;
            let signer = self
                .trust(&signer_id)?
                .ok_or_else(|| PoolError::invalid_signature(format!("unknown signer {signer_id} on access file")))?;
            let (stripped, verified_signer) = envelope::verify(value, &signer.verifying_key()?)?;
            if verified_signer != signer_id {
                return Err(PoolError::invalid_signature("access file signer mismatch"));
            }
            let file: AccessFile = serde_json::from_value(stripped)?;
            files.push((id, file));
        }
        files.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(files)
    }

    /// Try to recover the plaintext key bytes for `file.master_key_id`,
    /// either from the local keystore already, or by unwrapping our own
    /// entry in this file. Best-effort: returns `Ok(None)` if neither
    /// source works (the file predates our membership).
    fn recover_file_master(&self, file: &AccessFile, keystore: &Keystore) -> Result<Option<[u8; 32]>> {
        if let Some(value) = keystore.get(file.master_key_id) {
            return Ok(Some(value));
        }
        let own = file.keys.iter().find(|k| k.user_id == self.identity.user_id());
        match own.and_then(|k| k.value.as_ref()) {
            Some(wrapped) => Ok(Some(self.identity.unwrap_key(wrapped)?)),
            None => Ok(None),
        }
    }

    /// Refresh local access records and the master key from every
    /// published access file (spec.md §4.5 "Read/merge (sync-access)").
    /// Returns `true` if the local master key changed (rotated or
    /// adopted).
    pub fn sync_access(&self, store: &dyn BlobStore, force: bool) -> Result<bool> {
        identities::publish_own(store, self.identity)?;
        identities::sync(store, self.local, self.pool_id, self.backend_id)?;

        if !force && !self.guard().should_proceed(store, ACCESS_SENTINEL)? {
            return Ok(false);
        }

        let files = self.list_access_files(store)?;
        if files.is_empty() {
            // Nobody has published an access file yet. If we already hold a
            // master key (spec.md §4.8 "Create"), we are the founder: export
            // the first one now rather than waiting for a reexport trigger
            // that never fires against an empty listing.
            if self.keystore()?.current_id().is_some() {
                self.export_access(store)?;
                return Ok(true);
            }
            return Ok(false);
        }

        let newest = &files[0].1;
        let has_own_entry = newest.keys.iter().any(|k| k.user_id == self.identity.user_id());
        if !has_own_entry {
            return Err(PoolError::not_authorized("not present in the newest access file"));
        }

        let local_snapshot = self.local_records()?;
        let mut keystore = self.keystore()?;
        let mut staged: HashMap<UserId, AccessRecord> = HashMap::new();
        let mut sources: HashSet<Snowflake> = HashSet::new();
        let mut needs_reexport = false;

        for (id, file) in &files {
            if let Some(master) = self.recover_file_master(file, &keystore)? {
                keystore.put(file.master_key_id, master);
            }
            for entry in &file.keys {
                let state = if entry.value.is_some() { AccessState::Active } else { AccessState::Disabled };
                let candidate = AccessRecord::new(entry.user_id.clone(), state, entry.since);
                match local_snapshot.get(&entry.user_id) {
                    None => {
                        sources.insert(*id);
                        stage_if_newer(&mut staged, candidate);
                    }
                    Some(local) if entry.since > local.since => {
                        sources.insert(*id);
                        stage_if_newer(&mut staged, candidate);
                    }
                    Some(local) if entry.since < local.since => {
                        needs_reexport = true;
                    }
                    _ => {}
                }
            }
        }

        for record in staged.values() {
            self.save_record(record)?;
        }

        let rotated = match sources.len() {
            0 => false,
            1 => {
                let file = &files.iter().find(|(id, _)| sources.contains(id)).unwrap().1;
                if let Some(value) = self.recover_file_master(file, &keystore)? {
                    keystore.put(file.master_key_id, value);
                    keystore.set_current(file.master_key_id);
                }
                false
            }
            _ => {
                self.rotate_master(&mut keystore);
                true
            }
        };

        self.save_keystore(&keystore)?;
        self.save_last_read_id(files[0].0)?;

        if rotated || needs_reexport {
            self.export_access(store)?;
        }

        Ok(rotated || sources.len() == 1)
    }
}

fn stage_if_newer(staged: &mut HashMap<UserId, AccessRecord>, candidate: AccessRecord) {
    match staged.get(&candidate.user_id) {
        Some(existing) if existing.since >= candidate.since => {}
        _ => {
            staged.insert(candidate.user_id.clone(), candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolmesh_store::MemoryBlobStore;

    fn synced_clock() -> Clock {
        let clock = Clock::unsynced();
        clock.record_offset(0);
        clock
    }

    #[test]
    fn creator_exports_a_self_only_access_file() {
        let store = MemoryBlobStore::new();
        let local = LocalStore::in_memory().unwrap();
        let clock = synced_clock();
        let ids = SnowflakeGenerator::new(1);
        let alice = Identity::from_seed([1u8; 32], "alice");
        let engine = AccessEngine::new(&alice, PoolId(1), &local, &clock, &ids, "primary");

        engine.bootstrap_self().unwrap();
        assert!(engine.sync_access(&store, true).unwrap());

        let files = engine.list_access_files(&store).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].1.keys.len(), 1);
        assert!(files[0].1.keys[0].value.is_some());
    }

    #[test]
    fn grant_then_sync_lets_new_member_recover_master_key() {
        let store = MemoryBlobStore::new();
        let alice_local = LocalStore::in_memory().unwrap();
        let bob_local = LocalStore::in_memory().unwrap();
        let clock = synced_clock();
        let ids = SnowflakeGenerator::new(1);
        let alice = Identity::from_seed([1u8; 32], "alice");
        let bob = Identity::from_seed([2u8; 32], "bob");

        let alice_engine = AccessEngine::new(&alice, PoolId(1), &alice_local, &clock, &ids, "primary");
        alice_engine.bootstrap_self().unwrap();
        alice_engine.sync_access(&store, true).unwrap();

        let bob_engine = AccessEngine::new(&bob, PoolId(1), &bob_local, &clock, &ids, "primary");
        identities::publish_own(&store, &bob).unwrap();
        identities::sync(&store, &alice_local, PoolId(1), "primary").unwrap();

        alice_engine.set_access(bob.user_id(), AccessState::Active).unwrap();
        alice_engine.export_access(&store).unwrap();

        bob_engine.sync_access(&store, true).unwrap();
        let bob_master = bob_engine.keystore().unwrap().current_value();
        assert!(bob_master.is_some());
        assert_eq!(bob_master, alice_engine.keystore().unwrap().current_value());
    }

    #[test]
    fn revoked_member_loses_the_rotated_master_key() {
        let store = MemoryBlobStore::new();
        let alice_local = LocalStore::in_memory().unwrap();
        let bob_local = LocalStore::in_memory().unwrap();
        let clock = synced_clock();
        let ids = SnowflakeGenerator::new(1);
        let alice = Identity::from_seed([1u8; 32], "alice");
        let bob = Identity::from_seed([2u8; 32], "bob");

        let alice_engine = AccessEngine::new(&alice, PoolId(1), &alice_local, &clock, &ids, "primary");
        alice_engine.bootstrap_self().unwrap();
        alice_engine.sync_access(&store, true).unwrap();

        let bob_engine = AccessEngine::new(&bob, PoolId(1), &bob_local, &clock, &ids, "primary");
        identities::publish_own(&store, &bob).unwrap();
        identities::sync(&store, &alice_local, PoolId(1), "primary").unwrap();
        alice_engine.set_access(bob.user_id(), AccessState::Active).unwrap();
        alice_engine.export_access(&store).unwrap();
        bob_engine.sync_access(&store, true).unwrap();
        let key_before_revoke = bob_engine.keystore().unwrap().current_value();

        alice_engine.set_access(bob.user_id(), AccessState::Disabled).unwrap();
        alice_engine.export_access(&store).unwrap();

        let records = alice_engine.local_records().unwrap();
        assert!(!records[&bob.user_id()].is_active());
        let latest_id = alice_engine.keystore().unwrap().current_id().unwrap();
        let latest_value = alice_engine.keystore().unwrap().current_value();
        assert!(latest_id.0 > 1, "revoking an active member must strictly increase the master-key-id");
        assert_ne!(latest_value, key_before_revoke);

        let latest_file = alice_engine.list_access_files(&store).unwrap().into_iter().next().unwrap().1;
        let bobs_entry = latest_file.keys.iter().find(|k| k.user_id == bob.user_id()).unwrap();
        assert!(bobs_entry.value.is_none(), "a disabled member's key entry must be null");
    }
}
