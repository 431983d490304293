//! secp256k1 ECIES key wrapping
//!
//! Wraps a 32-byte master key for a single recipient: an ephemeral
//! secp256k1 keypair performs ECDH with the recipient's public key, the
//! shared secret is stretched with HKDF-SHA256, and the result keys an
//! AES-256-GCM seal of the payload. Output layout:
//! `ephemeral_pub(33, compressed) || nonce(12) || ciphertext+tag`.
//!
//! Used for access-file key wrappers (spec.md §3) and invite-token
//! recipient wrappings (spec.md §4.9).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use k256::ecdh::diffie_hellman;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use poolmesh_core::{PoolError, Result};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

const HKDF_INFO: &[u8] = b"poolmesh-ecies-v1";
const NONCE_LEN: usize = 12;
const EPHEMERAL_PUB_LEN: usize = 33;

/// ECIES-wrap `plaintext` (any length) under `recipient`'s public key.
pub fn wrap(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    let ephemeral_secret = SecretKey::random(&mut OsRng);
    let ephemeral_pub = ephemeral_secret.public_key();
    let shared = diffie_hellman(&ephemeral_secret.to_nonzero_scalar(), recipient.as_affine());

    let key = derive_aes_key(shared.raw_secret_bytes().as_slice())?;
    let cipher = Aes256Gcm::new((&key).into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| PoolError::invalid_signature(format!("ecies seal failed: {e}")))?;

    let ephemeral_bytes = ephemeral_pub.to_encoded_point(true);
    let mut out = Vec::with_capacity(EPHEMERAL_PUB_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_bytes.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse [`wrap`] using the recipient's secret key. Returns `UnknownKey`
/// on malformed input and `InvalidSignature` on an authentication failure
/// (wrong recipient or corrupted ciphertext).
pub fn unwrap(wrapped: &[u8], recipient_secret: &SecretKey) -> Result<[u8; 32]> {
    if wrapped.len() < EPHEMERAL_PUB_LEN + NONCE_LEN {
        return Err(PoolError::invalid_token("ecies payload too short"));
    }
    let (ephemeral_bytes, rest) = wrapped.split_at(EPHEMERAL_PUB_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral_pub = PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|e| PoolError::invalid_token(format!("bad ephemeral key: {e}")))?;
    let shared = diffie_hellman(&recipient_secret.to_nonzero_scalar(), ephemeral_pub.as_affine());

    let key = derive_aes_key(shared.raw_secret_bytes().as_slice())?;
    let cipher = Aes256Gcm::new((&key).into());
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| PoolError::invalid_signature(format!("ecies unseal failed: {e}")))?;

    if plaintext.len() != 32 {
        return Err(PoolError::invalid_token("unwrapped key is not 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}

fn derive_aes_key(shared_secret: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| PoolError::invalid_signature(format!("hkdf expand failed: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_round_trip() {
        let secret = SecretKey::random(&mut OsRng);
        let pub_key = secret.public_key();
        let master = [7u8; 32];
        let wrapped = wrap(&master, &pub_key).unwrap();
        let recovered = unwrap(&wrapped, &secret).unwrap();
        assert_eq!(recovered, master);
    }

    #[test]
    fn wrap_is_randomized() {
        let secret = SecretKey::random(&mut OsRng);
        let pub_key = secret.public_key();
        let a = wrap(&[1u8; 32], &pub_key).unwrap();
        let b = wrap(&[1u8; 32], &pub_key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unwrap_rejects_truncated_payload() {
        let secret = SecretKey::random(&mut OsRng);
        assert!(unwrap(&[0u8; 10], &secret).is_err());
    }

    #[test]
    fn unwrap_rejects_wrong_recipient() {
        let a = SecretKey::random(&mut OsRng);
        let b = SecretKey::random(&mut OsRng);
        let wrapped = wrap(&[3u8; 32], &a.public_key()).unwrap();
        assert!(unwrap(&wrapped, &b).is_err());
    }
}
