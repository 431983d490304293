//! Blob-mode AES-128-CBC with PKCS#7 padding
//!
//! Used only for small, known-size payloads: the serialized keystore
//! embedded in an access file, and any application-defined `meta` block
//! that chooses to use it (spec.md §4.2 "Blob-mode"). Streaming bodies use
//! [`crate::codec`] instead.
//!
//! spec.md §4.2 is silent on blob-mode's key derivation; this follows
//! `examples/original_source/security/aescrypt.go`'s `newBlock`, the same
//! derivation [`crate::codec::derive_stream_key`] uses:
//! `AES-128-key = MD5(SHA-256(value))`.
//!
//! Spec.md §9 flags the original scheme's `iv = key` reuse as unsafe; this
//! implementation always draws a fresh random IV and returns it alongside
//! the ciphertext (SPEC_FULL.md §D).

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use digest::Digest;
use md5::Md5;
use poolmesh_core::{PoolError, Result};
use rand::RngCore;
use sha2::Sha256;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Length of the random IV generated by [`encrypt`].
pub const IV_LEN: usize = 16;

/// Derive the AES-128 blob key for a raw 32-byte value: `MD5(SHA-256(value))`,
/// matching [`crate::codec::derive_stream_key`].
pub fn derive_blob_key(value: &[u8; 32]) -> [u8; 16] {
    let sha = Sha256::digest(value);
    let digest = Md5::digest(sha);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// Encrypt `plaintext` under `key` with a freshly generated random IV.
/// Returns `(iv, ciphertext)`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut iv = vec![0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = encrypt_with_iv(key, &iv, plaintext);
    (iv, ciphertext)
}

/// Encrypt `plaintext` under an explicitly supplied IV/nonce. The access
/// file carries this nonce alongside the ciphertext (spec.md §3 "Access
/// file": `nonce` field).
pub fn encrypt_with_iv(key: &[u8; 32], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let blob_key = derive_blob_key(key);
    Aes128CbcEnc::new((&blob_key).into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt a blob produced by [`encrypt`]/[`encrypt_with_iv`].
pub fn decrypt(key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let blob_key = derive_blob_key(key);
    Aes128CbcDec::new((&blob_key).into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| PoolError::integrity(format!("cbc unpad failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let key = [8u8; 32];
        let (iv, ciphertext) = encrypt(&key, b"the keystore serialized as json");
        let plaintext = decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(plaintext, b"the keystore serialized as json");
    }

    #[test]
    fn ivs_are_randomized_across_calls() {
        let key = [1u8; 32];
        let (iv1, _) = encrypt(&key, b"x");
        let (iv2, _) = encrypt(&key, b"x");
        assert_ne!(iv1, iv2);
    }

    #[test]
    fn wrong_key_fails_to_unpad() {
        let key = [1u8; 32];
        let other = [2u8; 32];
        let (iv, ciphertext) = encrypt(&key, b"some padded content here");
        assert!(decrypt(&other, &iv, &ciphertext).is_err());
    }
}
