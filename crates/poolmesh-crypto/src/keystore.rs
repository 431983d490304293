//! Per-pool keystore: the `{key-id -> 32-byte value}` map (spec.md §4.3)
//!
//! Kept locally so old entries stay decryptable after a master-key
//! rotation, and serialized into every access file, encrypted under the
//! *current* master key with a fresh CBC nonce (spec.md §3 "Access file").

use crate::blob;
use crate::codec::KeyFn;
use poolmesh_core::{KeyId, PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// History of symmetric keys for one pool, plus which one is current.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Keystore {
    keys: BTreeMap<u64, [u8; 32]>,
    current: Option<u64>,
}

impl Keystore {
    /// An empty keystore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the value for `key_id`, if known.
    pub fn get(&self, key_id: KeyId) -> Option<[u8; 32]> {
        self.keys.get(&key_id.0).copied()
    }

    /// Insert or overwrite a key's value.
    pub fn put(&mut self, key_id: KeyId, value: [u8; 32]) {
        self.keys.insert(key_id.0, value);
    }

    /// Remove every key-id strictly older than `cutoff` (used by
    /// long-running local GC of superseded keys an operator no longer
    /// wants retained; the spec itself only requires old keys be *kept*,
    /// so this is opt-in and never called automatically).
    pub fn delete_older_than(&mut self, cutoff: KeyId) {
        self.keys.retain(|&id, _| id >= cutoff.0);
    }

    /// Mark `key_id` as the current master. Does not require the key to
    /// already be present (callers insert before or after as convenient).
    pub fn set_current(&mut self, key_id: KeyId) {
        self.current = Some(key_id.0);
    }

    /// The current master key-id, if one has been set.
    pub fn current_id(&self) -> Option<KeyId> {
        self.current.map(KeyId)
    }

    /// The current master key's value, if set and present.
    pub fn current_value(&self) -> Option<[u8; 32]> {
        self.current.and_then(|id| self.keys.get(&id).copied())
    }

    /// The highest key-id referenced, i.e. the "current master" defined as
    /// the maximum key-id (spec.md §3 "Keystore entry").
    pub fn max_key_id(&self) -> Option<KeyId> {
        self.keys.keys().max().copied().map(KeyId)
    }

    /// Number of keys retained.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the keystore holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Serialize to JSON and encrypt under `master_key` with a fresh
    /// random nonce. Returns `(nonce, ciphertext)`, both of which travel in
    /// the access file (spec.md §3: `nonce`, `keystore` fields).
    pub fn seal(&self, master_key: &[u8; 32]) -> Result<(Vec<u8>, Vec<u8>)> {
        let json = serde_json::to_vec(self)?;
        let (nonce, ciphertext) = blob::encrypt(master_key, &json);
        Ok((nonce, ciphertext))
    }

    /// Reverse [`Keystore::seal`].
    pub fn unseal(master_key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Self> {
        let json = blob::decrypt(master_key, nonce, ciphertext)?;
        let keystore: Self = serde_json::from_slice(&json)?;
        Ok(keystore)
    }
}

/// Adapts a [`Keystore`] reference to the [`KeyFn`] trait used by the
/// streaming codec.
pub struct KeystoreLookup<'a>(pub &'a Keystore);

impl<'a> KeyFn for KeystoreLookup<'a> {
    fn lookup(&self, key_id: KeyId) -> Option<[u8; 32]> {
        self.0.get(key_id)
    }
}

/// Convenience: build an error for a key-id absent from a keystore.
pub fn unknown_key_error(key_id: KeyId) -> PoolError {
    PoolError::unknown_key(format!("key {key_id} not present in local keystore"))
}
