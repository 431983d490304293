//! Signed-JSON envelope (spec.md §4.6)
//!
//! Appends a trailing signature field (objects) or element (arrays) to a
//! JSON document. The signed payload is the document's canonical
//! serialization *before* that field/element is appended, hashed with
//! Blake2b-256.
//!
//! Spec.md §9 flags the original scheme's regex-based strip of the
//! trailing field as brittle. We instead rely on `serde_json`'s
//! insertion-order-preserving `Map` (the `preserve_order` feature): the
//! signature field is always inserted last, so stripping it by key and
//! re-serializing reproduces the exact pre-signature bytes, with no
//! pattern matching involved.

use crate::codec::Blake2b256;
use digest::Digest;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use poolmesh_core::{PoolError, Result, UserId};
use serde_json::Value;

/// Name of the trailing signature field/element.
pub const SIGNATURE_FIELD: &str = "dgst_ed25519_blake2b";

/// Canonical bytes for a JSON value: compact, UTF-8, no extraneous
/// whitespace, object keys in insertion order (spec.md §9's fix to the
/// brittle regex-based scheme).
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Into::into)
}

fn signature_string(signer_id: &UserId, signature: &Signature) -> String {
    use base64::Engine;
    format!(
        "{}:{}",
        signer_id.as_str(),
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    )
}

fn parse_signature_string(s: &str) -> Result<(UserId, Signature)> {
    use base64::Engine;
    let (id, sig_b64) = s
        .split_once(':')
        .ok_or_else(|| PoolError::invalid_signature("malformed signature field"))?;
    let sig_bytes = base64::engine::general_purpose::STANDARD.decode(sig_b64)?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| PoolError::invalid_signature("signature is not 64 bytes"))?;
    Ok((UserId(id.to_string()), Signature::from_bytes(&sig_bytes)))
}

/// Sign `value` (must be a JSON object or array), appending the trailing
/// signature field/element.
pub fn sign(mut value: Value, signer_id: &UserId, signing_key: &SigningKey) -> Result<Value> {
    let payload = canonical_bytes(&value)?;
    let hash = Blake2b256::digest(&payload);
    let signature = signing_key.sign(&hash);
    let field = signature_string(signer_id, &signature);

    match &mut value {
        Value::Object(map) => {
            map.insert(SIGNATURE_FIELD.to_string(), Value::String(field));
        }
        Value::Array(items) => {
            items.push(Value::String(field));
        }
        _ => return Err(PoolError::invalid_signature("envelope requires an object or array")),
    }
    Ok(value)
}

/// Strip the trailing signature field/element, verify it against
/// `verify_key`, and return the unsigned payload plus the embedded signer
/// id. Callers resolve `verify_key` from the trust store keyed by the
/// returned id's own claim — so this takes a key directly rather than a
/// lookup closure, keeping the crate free of directory-lookup concerns.
pub fn verify(mut value: Value, verify_key: &VerifyingKey) -> Result<(Value, UserId)> {
    let field = match &mut value {
        Value::Object(map) => map
            .remove(SIGNATURE_FIELD)
            .ok_or_else(|| PoolError::invalid_signature("missing signature field"))?,
        Value::Array(items) => items
            .pop()
            .ok_or_else(|| PoolError::invalid_signature("missing signature element"))?,
        _ => return Err(PoolError::invalid_signature("envelope requires an object or array")),
    };
    let field = field
        .as_str()
        .ok_or_else(|| PoolError::invalid_signature("signature field is not a string"))?;
    let (signer_id, signature) = parse_signature_string(field)?;

    let payload = canonical_bytes(&value)?;
    let hash = Blake2b256::digest(&payload);
    verify_key
        .verify(&hash, &signature)
        .map_err(|e| PoolError::invalid_signature(format!("envelope signature check failed: {e}")))?;

    Ok((value, signer_id))
}

/// Extract the embedded signer id from a signed value without verifying,
/// so the caller can look up the matching public key first.
pub fn peek_signer_id(value: &Value) -> Result<UserId> {
    let field = match value {
        Value::Object(map) => map
            .get(SIGNATURE_FIELD)
            .ok_or_else(|| PoolError::invalid_signature("missing signature field"))?,
        Value::Array(items) => items
            .last()
            .ok_or_else(|| PoolError::invalid_signature("missing signature element"))?,
        _ => return Err(PoolError::invalid_signature("envelope requires an object or array")),
    };
    let field = field
        .as_str()
        .ok_or_else(|| PoolError::invalid_signature("signature field is not a string"))?;
    let (signer_id, _) = parse_signature_string(field)?;
    Ok(signer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sign_then_verify_object_round_trips() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let signer = UserId("alice-id".to_string());
        let original = json!({"b": 1, "a": 2});
        let signed = sign(original.clone(), &signer, &key).unwrap();
        assert!(signed.as_object().unwrap().contains_key(SIGNATURE_FIELD));

        let (stripped, signer_out) = verify(signed, &key.verifying_key()).unwrap();
        assert_eq!(stripped, original);
        assert_eq!(signer_out, signer);
    }

    #[test]
    fn signature_field_is_inserted_last() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let signer = UserId("id".to_string());
        let signed = sign(json!({"x": 1, "y": 2}), &signer, &key).unwrap();
        let keys: Vec<&String> = signed.as_object().unwrap().keys().collect();
        assert_eq!(keys.last().unwrap().as_str(), SIGNATURE_FIELD);
    }

    #[test]
    fn sign_then_verify_array_round_trips() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let signer = UserId("id2".to_string());
        let original = json!(["a", "b", 3]);
        let signed = sign(original.clone(), &signer, &key).unwrap();
        let (stripped, signer_out) = verify(signed, &key.verifying_key()).unwrap();
        assert_eq!(stripped, original);
        assert_eq!(signer_out, signer);
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let key = SigningKey::from_bytes(&[4u8; 32]);
        let signer = UserId("id3".to_string());
        let mut signed = sign(json!({"amount": 10}), &signer, &key).unwrap();
        signed["amount"] = json!(10_000);
        assert!(verify(signed, &key.verifying_key()).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let other = SigningKey::from_bytes(&[6u8; 32]);
        let signer = UserId("id4".to_string());
        let signed = sign(json!({"x": 1}), &signer, &key).unwrap();
        assert!(verify(signed, &other.verifying_key()).is_err());
    }

    #[test]
    fn peek_signer_id_does_not_require_verification() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let signer = UserId("peeked-id".to_string());
        let signed = sign(json!({"x": 1}), &signer, &key).unwrap();
        assert_eq!(peek_signer_id(&signed).unwrap(), signer);
    }
}
