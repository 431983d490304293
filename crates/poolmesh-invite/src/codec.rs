//! Invite token encode/decode (spec.md §4.9).

use crate::token::{Token, TOKEN_VERSION};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use poolmesh_core::{PoolError, Result};
use poolmesh_crypto::{blob, envelope, Identity, IdentityPublic};
use rand::RngCore;
use std::io::{Read, Write};

/// The Go port's AES block size, and the length of the CBC IV taken from
/// the first 16 bytes of the sender's id (spec.md §4.9).
const IV_LEN: usize = 16;

/// A decoded invite (spec.md §4.9). `exchanges` is `None` when the
/// reader's identity isn't in the recipient list (or the token carried no
/// recipient list at all and the storages blob didn't parse) — that is
/// not a decode error, only [`Invite::join`] treats it as unauthorized.
#[derive(Debug, Clone)]
pub struct Invite {
    pub subject: String,
    pub sender: IdentityPublic,
    pub pool_name: String,
    pub exchanges: Option<Vec<String>>,
}

impl Invite {
    /// Recover the pool name and backend URLs needed to join, or
    /// `NotAuthorized` if this identity could not decrypt the storages
    /// field (spec.md §8 S5: Charlie's decode recovers only the public
    /// fields and `join` then fails).
    pub fn join(&self) -> Result<(String, Vec<String>)> {
        let exchanges = self
            .exchanges
            .clone()
            .ok_or_else(|| PoolError::not_authorized("invite does not decrypt for this identity"))?;
        if self.pool_name.is_empty() {
            return Err(PoolError::invalid_token("invite is missing a pool name"));
        }
        Ok((self.pool_name.clone(), exchanges))
    }
}

fn sender_iv(sender_id_bytes: &[u8]) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    let take = sender_id_bytes.len().min(IV_LEN);
    iv[..take].copy_from_slice(&sender_id_bytes[..take]);
    iv
}

/// Build an invite token (spec.md §4.9 "Encode"). When `recipients` is
/// empty the storages field is left plaintext; otherwise a fresh random
/// master key is generated, the storages array is AES-CBC-encrypted under
/// it with an IV derived from the sender's id, and the master key is
/// ECIES-wrapped once per recipient.
pub fn encode(
    sender: &Identity,
    subject: &str,
    pool_name: &str,
    exchanges: &[String],
    recipients: &[IdentityPublic],
) -> Result<String> {
    let storages = serde_json::to_vec(exchanges)?;
    let crc = crc32fast::hash(&storages);

    let (storages_field, recipient_key_wrappings) = if recipients.is_empty() {
        (storages, Vec::new())
    } else {
        let mut master = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut master);
        let iv = sender_iv(sender.user_id().as_str().as_bytes());
        let encrypted = blob::encrypt_with_iv(&master, &iv, &storages);
        let wrappings: Vec<Vec<u8>> = recipients.iter().filter_map(|r| r.wrap_key(&master).ok()).collect();
        (encrypted, wrappings)
    };

    let token = Token {
        version: TOKEN_VERSION,
        subject: subject.to_string(),
        sender_nick: sender.nickname.clone(),
        pool_name: pool_name.to_string(),
        crc_of_storages: crc,
        recipient_key_wrappings,
        storages_field,
    };

    let value = serde_json::to_value(&token)?;
    let signed = envelope::sign(value, &sender.user_id(), sender.signing_key())?;
    let json = serde_json::to_vec(&signed)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let gz = encoder.finish()?;

    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(gz);
    Ok(encoded.replace('/', "_"))
}

/// Decode and verify an invite token, attempting to recover the storages
/// field under `reader`'s own identity (spec.md §4.9 "Decode").
pub fn decode(reader: &Identity, token: &str) -> Result<Invite> {
    use base64::Engine;
    let standard = token.replace('_', "/");
    let gz = base64::engine::general_purpose::STANDARD.decode(standard.as_bytes())?;

    let mut decoder = GzDecoder::new(&gz[..]);
    let mut json_bytes = Vec::new();
    decoder
        .read_to_end(&mut json_bytes)
        .map_err(|e| PoolError::invalid_token(format!("cannot gunzip invite token: {e}")))?;

    let value: serde_json::Value = serde_json::from_slice(&json_bytes)?;
    let claimed_signer = envelope::peek_signer_id(&value)?;
    let verify_identity = IdentityPublic::from_user_id(&claimed_signer, String::new())?;
    let (unsigned, signer_id) = envelope::verify(value, &verify_identity.verifying_key()?)?;

    let wire: Token = serde_json::from_value(unsigned)?;
    if wire.version != TOKEN_VERSION {
        return Err(PoolError::invalid_version(format!("unsupported invite token version {}", wire.version)));
    }
    let sender = IdentityPublic::from_user_id(&signer_id, wire.sender_nick.clone())?;

    let exchanges = if wire.recipient_key_wrappings.is_empty() {
        serde_json::from_slice(&wire.storages_field).ok()
    } else {
        let iv = sender_iv(signer_id.as_str().as_bytes());
        wire.recipient_key_wrappings.iter().find_map(|wrapped| {
            let master = reader.unwrap_key(wrapped).ok()?;
            let decrypted = blob::decrypt(&master, &iv, &wire.storages_field).ok()?;
            if crc32fast::hash(&decrypted) != wire.crc_of_storages {
                return None;
            }
            serde_json::from_slice::<Vec<String>>(&decrypted).ok()
        })
    };

    Ok(Invite { subject: wire.subject, sender, pool_name: wire.pool_name, exchanges })
}
