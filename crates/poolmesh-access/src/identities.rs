//! Identity-folder publish/sync (spec.md §4.5 layout: `<pool>/identities/`)
//!
//! Each member publishes a self-signed copy of their [`IdentityPublic`] at
//! `identities/<user-id>`. Other members read and cache it as a trust
//! store, keyed by user id, so later access-file entries can be verified
//! and ECIES-wrapped keys addressed without a fresh lookup every time.

use poolmesh_core::{LocalStore, PoolError, PoolId, Result, UserId};
use poolmesh_crypto::{envelope, Identity, IdentityPublic};
use poolmesh_store::{BlobStore, Guard};
use std::io::Cursor;

const IDENTITIES_DIR: &str = "identities";
const IDENTITIES_SENTINEL: &str = "identities/.touch";
const TRUST_SCOPE_PREFIX: &str = "trust";

fn trust_scope(pool_id: PoolId) -> String {
    format!("{TRUST_SCOPE_PREFIX}:{}", pool_id.0)
}

/// The local-store scope this module owns for `pool_id`, exposed for
/// `leave`-style cleanup by callers outside this crate.
pub fn local_scopes(pool_id: PoolId) -> Vec<String> {
    vec![trust_scope(pool_id)]
}

/// Look up a cached, previously-verified identity.
pub fn trusted(local: &LocalStore, pool_id: PoolId, user_id: &UserId) -> Result<Option<IdentityPublic>> {
    local.get_json(&trust_scope(pool_id), user_id.as_str())
}

/// Cache a verified identity.
fn remember(local: &LocalStore, pool_id: PoolId, identity: &IdentityPublic) -> Result<()> {
    local.put_json(&trust_scope(pool_id), identity.user_id().as_str(), identity)
}

/// Publish this identity's own self-signed record, if not already present
/// (spec.md §4.8 "Open": "publish own identity if not already present").
pub fn publish_own(store: &dyn BlobStore, identity: &Identity) -> Result<()> {
    let path = format!("{IDENTITIES_DIR}/{}", identity.user_id());
    if store.stat(&path).is_ok() {
        return Ok(());
    }
    let value = serde_json::to_value(identity.public())?;
    let signed = envelope::sign(value, &identity.user_id(), identity.signing_key())?;
    let bytes = serde_json::to_vec(&signed)?;
    store.write(&path, &mut Cursor::new(bytes), 0)?;
    Ok(())
}

/// Fetch, verify, and cache every identity record published so far, if the
/// identities guard has advanced since the last sync.
pub fn sync(store: &dyn BlobStore, local: &LocalStore, pool_id: PoolId, backend_id: &str) -> Result<()> {
    let guard = Guard::new(local, backend_id, IDENTITIES_SENTINEL);
    if !guard.should_proceed(store, IDENTITIES_SENTINEL)? {
        return Ok(());
    }
    let entries = match store.list(IDENTITIES_DIR) {
        Ok(entries) => entries,
        Err(PoolError::NotFound { .. }) => Vec::new(),
        Err(e) => return Err(e),
    };
    for entry in entries {
        if entry.is_dir || entry.name == ".touch" {
            continue;
        }
        let path = format!("{IDENTITIES_DIR}/{}", entry.name);
        let mut bytes = Vec::new();
        store.read(&path, None, &mut bytes)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;

        let claimed: IdentityPublic = serde_json::from_value(value.clone())?;
        let verify_key = claimed.verifying_key()?;
        let (_, signer_id) = envelope::verify(value, &verify_key)?;
        if signer_id != claimed.user_id() || signer_id.as_str() != entry.name {
            return Err(PoolError::invalid_signature(format!(
                "identity file {} is not self-signed by its claimed owner",
                entry.name
            )));
        }
        remember(local, pool_id, &claimed)?;
    }
    guard.touch(store, IDENTITIES_SENTINEL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolmesh_store::MemoryBlobStore;

    #[test]
    fn publish_is_idempotent() {
        let store = MemoryBlobStore::new();
        let identity = Identity::from_seed([1u8; 32], "alice");
        publish_own(&store, &identity).unwrap();
        let first = store.stat(&format!("identities/{}", identity.user_id())).unwrap();
        publish_own(&store, &identity).unwrap();
        let second = store.stat(&format!("identities/{}", identity.user_id())).unwrap();
        assert_eq!(first.mod_time, second.mod_time);
    }

    #[test]
    fn sync_caches_published_identities() {
        let store = MemoryBlobStore::new();
        let local = LocalStore::in_memory().unwrap();
        let alice = Identity::from_seed([1u8; 32], "alice");
        let bob = Identity::from_seed([2u8; 32], "bob");
        publish_own(&store, &alice).unwrap();
        publish_own(&store, &bob).unwrap();

        sync(&store, &local, PoolId(1), "primary").unwrap();

        let cached = trusted(&local, PoolId(1), &bob.user_id()).unwrap().unwrap();
        assert_eq!(cached.nickname, "bob");
    }

    #[test]
    fn sync_rejects_tampered_identity() {
        let store = MemoryBlobStore::new();
        let local = LocalStore::in_memory().unwrap();
        let alice = Identity::from_seed([1u8; 32], "alice");
        publish_own(&store, &alice).unwrap();

        let mut bytes = Vec::new();
        store.read(&format!("identities/{}", alice.user_id()), None, &mut bytes).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["nickname"] = serde_json::json!("mallory");
        store
            .write(
                &format!("identities/{}", alice.user_id()),
                &mut Cursor::new(serde_json::to_vec(&value).unwrap()),
                0,
            )
            .unwrap();

        assert!(sync(&store, &local, PoolId(1), "primary").is_err());
    }
}
