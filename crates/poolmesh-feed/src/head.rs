//! Feed entry wire types (spec.md §3 "Feed entry", §6 "Entry head JSON").

use chrono::{DateTime, Utc};
use poolmesh_core::{Snowflake, UserId};
use serde::{Deserialize, Serialize};

mod b64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine;
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod b64_hash {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        use base64::Engine;
        let s = String::deserialize(d)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("hash is not 32 bytes"))
    }
}

/// The signed, encrypted head blob published at `feeds/<slot>/<id>.head`
/// (spec.md §6). `slot` and `ctime` are local-only bookkeeping — they are
/// never part of the published JSON, since `slot` is already encoded in
/// the object's path and `ctime` has no meaning outside this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedHead {
    pub id: Snowflake,
    pub name: String,
    pub size: i64,
    #[serde(with = "b64_hash")]
    pub hash: [u8; 32],
    pub mod_time: DateTime<Utc>,
    pub author_id: UserId,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    #[serde(with = "b64")]
    pub meta: Vec<u8>,
}

/// Where a locally-known entry sits in the one-directional state machine
/// (spec.md §4.4 "Entry lifecycle"): `Unseen` entries are never
/// materialized locally, so this type only covers the three persisted
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Head fetched and signature-verified, body not yet confirmed present.
    Discovered,
    /// Head verified and the backend confirms a body object exists.
    Verified,
    /// Body fetched, decrypted, and hash-checked at least once.
    Cached,
}

/// A feed entry as tracked in the local index: the signed head plus the
/// bookkeeping spec.md keeps out of the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEntry {
    pub head: FeedHead,
    pub slot: String,
    pub ctime: i64,
    pub state: EntryState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_round_trips_through_json_with_camel_case_fields() {
        let head = FeedHead {
            id: Snowflake(42),
            name: "photo.jpg".to_string(),
            size: 18,
            hash: [7u8; 32],
            mod_time: Utc::now(),
            author_id: UserId("alice-id".to_string()),
            signature: vec![1, 2, 3, 4],
            meta: vec![],
        };
        let json = serde_json::to_value(&head).unwrap();
        assert!(json.get("modTime").is_some());
        assert!(json.get("authorId").is_some());
        assert!(json.get("mod_time").is_none());
        let restored: FeedHead = serde_json::from_value(json).unwrap();
        assert_eq!(restored, head);
    }
}
