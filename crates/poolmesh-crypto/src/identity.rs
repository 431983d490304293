//! Identities: an Ed25519 signing keypair plus a secp256k1 encryption
//! keypair, per spec.md §3 ("Identity").

use crate::ecies;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey as K256PublicKey, SecretKey as K256SecretKey};
use poolmesh_core::{PoolError, Result, UserId};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

/// `serde` only has built-in `Serialize`/`Deserialize` impls for arrays up
/// to 32 elements; this mirrors that same plain-array wire format for the
/// 33-byte compressed secp256k1 key so `[u8; 33]` round-trips identically.
mod byte_array_33 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 33], s: S) -> Result<S::Ok, S::Error> {
        bytes.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 33], D::Error> {
        let bytes = Vec::<u8>::deserialize(d)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 33 bytes"))
    }
}

/// Private key material for a pool member. Never serialized as a whole;
/// only [`IdentityPublic`] travels over the wire.
pub struct Identity {
    signing_key: SigningKey,
    encryption_key: K256SecretKey,
    /// Display nickname.
    pub nickname: String,
    /// Optional contact email.
    pub email: Option<String>,
    /// Optional avatar bytes.
    pub avatar: Option<Vec<u8>>,
}

impl Identity {
    /// Generate a fresh identity with random keys.
    pub fn generate(nickname: impl Into<String>) -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            encryption_key: K256SecretKey::random(&mut OsRng),
            nickname: nickname.into(),
            email: None,
            avatar: None,
        }
    }

    /// Deterministically derive an identity from a 32-byte seed. Used by
    /// end-to-end test scenarios that pin a seed (spec.md §8 S1: "Ed25519
    /// seed = 0x01...01").
    pub fn from_seed(seed: [u8; 32], nickname: impl Into<String>) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        // Derive the secp256k1 scalar from a distinct domain-separated
        // stretch of the same seed so the two keys are independent.
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"poolmesh-encryption-key-v1");
        hasher.update(seed);
        let stretched: [u8; 32] = hasher.finalize().into();
        let encryption_key = K256SecretKey::from_slice(&stretched)
            .expect("sha256 digest is always a valid scalar candidate space");
        Self {
            signing_key,
            encryption_key,
            nickname: nickname.into(),
            email: None,
            avatar: None,
        }
    }

    /// The public half of this identity.
    pub fn public(&self) -> IdentityPublic {
        IdentityPublic {
            signing_pub: self.signing_key.verifying_key().to_bytes(),
            encryption_pub: encryption_public_bytes(&self.encryption_key),
            nickname: self.nickname.clone(),
            email: self.email.clone(),
            avatar: self.avatar.clone(),
        }
    }

    /// This identity's id (spec.md §3).
    pub fn user_id(&self) -> UserId {
        self.public().user_id()
    }

    /// Sign an arbitrary message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Unwrap a master key previously wrapped under this identity's
    /// encryption public key (spec.md §3 "Access file").
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<[u8; 32]> {
        ecies::unwrap(wrapped, &self.encryption_key)
    }

    /// Borrow the secp256k1 secret scalar, e.g. to decode invite tokens.
    pub fn encryption_secret(&self) -> &K256SecretKey {
        &self.encryption_key
    }

    /// Borrow the Ed25519 signing key, e.g. to produce a signed-JSON
    /// envelope (spec.md §4.6).
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

fn encryption_public_bytes(secret: &K256SecretKey) -> [u8; 33] {
    let point = secret.public_key().to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(point.as_bytes());
    out
}

/// Public identity record shared with other pool members (spec.md §3
/// "Identity file").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublic {
    /// Ed25519 verifying key bytes.
    pub signing_pub: [u8; 32],
    /// Compressed secp256k1 public key bytes.
    #[serde(with = "byte_array_33")]
    pub encryption_pub: [u8; 33],
    /// Display nickname.
    pub nickname: String,
    /// Optional contact email.
    pub email: Option<String>,
    /// Optional avatar bytes.
    pub avatar: Option<Vec<u8>>,
}

impl IdentityPublic {
    /// This identity's id: base64(signing_pub || encryption_pub) with `/`
    /// rewritten to `_` (spec.md §3).
    pub fn user_id(&self) -> UserId {
        UserId::from_public_parts(&self.signing_pub, &self.encryption_pub)
    }

    /// Reconstruct the key bytes embedded in a user id, pairing them with
    /// a `nickname` recovered from elsewhere (spec.md §4.9 "Invite codec":
    /// the sender's nickname travels alongside the signed envelope's
    /// embedded id, which carries only the key bytes).
    pub fn from_user_id(user_id: &UserId, nickname: impl Into<String>) -> Result<Self> {
        use base64::Engine;
        let standard = user_id.as_str().replace('_', "/");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(standard.as_bytes())
            .map_err(|e| PoolError::invalid_signature(format!("bad user id: {e}")))?;
        if bytes.len() != 65 {
            return Err(PoolError::invalid_signature("user id is not 65 bytes"));
        }
        let mut signing_pub = [0u8; 32];
        signing_pub.copy_from_slice(&bytes[..32]);
        let mut encryption_pub = [0u8; 33];
        encryption_pub.copy_from_slice(&bytes[32..]);
        Ok(Self { signing_pub, encryption_pub, nickname: nickname.into(), email: None, avatar: None })
    }

    /// The Ed25519 verifying key, parsed from `signing_pub`.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.signing_pub)
            .map_err(|e| PoolError::invalid_signature(format!("bad signing key: {e}")))
    }

    /// The secp256k1 public key, parsed from `encryption_pub`.
    pub fn encryption_key(&self) -> Result<K256PublicKey> {
        K256PublicKey::from_sec1_bytes(&self.encryption_pub)
            .map_err(|e| PoolError::invalid_signature(format!("bad encryption key: {e}")))
    }

    /// Verify a signature produced by this identity's signing key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = self.verifying_key()?;
        key.verify(message, signature)
            .map_err(|e| PoolError::invalid_signature(format!("signature check failed: {e}")))
    }

    /// Wrap a 32-byte master key under this identity's encryption public
    /// key via ECIES (spec.md §3 "Access file" `keys[i].value`).
    pub fn wrap_key(&self, key: &[u8; 32]) -> Result<Vec<u8>> {
        ecies::wrap(key, &self.encryption_key()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_identity_is_deterministic() {
        let a = Identity::from_seed([1u8; 32], "alice");
        let b = Identity::from_seed([1u8; 32], "alice");
        assert_eq!(a.public(), b.public());
    }

    #[test]
    fn user_id_has_no_slash() {
        let id = Identity::from_seed([1u8; 32], "alice");
        assert!(!id.user_id().as_str().contains('/'));
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let id = Identity::from_seed([2u8; 32], "bob");
        let sig = id.sign(b"hello");
        id.public().verify(b"hello", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let id = Identity::from_seed([3u8; 32], "carol");
        let sig = id.sign(b"hello");
        assert!(id.public().verify(b"goodbye", &sig).is_err());
    }

    #[test]
    fn wrap_then_unwrap_recovers_master_key() {
        let id = Identity::from_seed([4u8; 32], "dave");
        let master = [0x42u8; 32];
        let wrapped = id.public().wrap_key(&master).unwrap();
        let recovered = id.unwrap_key(&wrapped).unwrap();
        assert_eq!(recovered, master);
    }

    #[test]
    fn identity_public_round_trips_through_user_id() {
        let id = Identity::from_seed([11u8; 32], "erin");
        let public = id.public();
        let recovered = IdentityPublic::from_user_id(&public.user_id(), "erin").unwrap();
        assert_eq!(recovered, public);
    }

    #[test]
    fn unwrap_fails_for_wrong_identity() {
        let alice = Identity::from_seed([5u8; 32], "alice");
        let bob = Identity::from_seed([6u8; 32], "bob");
        let master = [0x99u8; 32];
        let wrapped = alice.public().wrap_key(&master).unwrap();
        assert!(bob.unwrap_key(&wrapped).is_err());
    }
}
