//! Access records and the access-file wire format (spec.md §3, §4.5).

use poolmesh_core::{KeyId, PoolId, Snowflake, UserId};
use serde::{Deserialize, Serialize};

/// A member's access state inside one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessState {
    Disabled,
    Active,
}

/// `{user-id, state, since}` (spec.md §3 "Access record"). `since` is a
/// logical clock expressed as milliseconds since the Unix epoch; it need
/// not be the same as wall-clock time, only monotonic per writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub user_id: UserId,
    pub state: AccessState,
    pub since: i64,
}

impl AccessRecord {
    pub fn new(user_id: UserId, state: AccessState, since: i64) -> Self {
        Self { user_id, state, since }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, AccessState::Active)
    }
}

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

mod b64_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        match bytes {
            Some(b) => base64::engine::general_purpose::STANDARD.encode(b).serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        use base64::Engine;
        let opt = Option::<String>::deserialize(d)?;
        match opt {
            Some(s) => base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// One entry in an access file's `keys[]` array: the master key wrapped
/// under `user_id`'s encryption public key, or `value = null` if that
/// member is disabled (spec.md §3 "Access file").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeyEntry {
    pub user_id: UserId,
    pub since: i64,
    #[serde(with = "b64_opt")]
    pub value: Option<Vec<u8>>,
}

/// The versioned, signed JSON blob published at `<pool>/access/<id>`
/// (spec.md §3 "Access file"). The trailing `dgst_ed25519_blake2b` field
/// lives outside this struct — it is added/stripped by the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AccessFile {
    pub id: Snowflake,
    pub version: u32,
    pub pool_id: PoolId,
    pub keys: Vec<KeyEntry>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    pub master_key_id: KeyId,
    #[serde(with = "b64")]
    pub keystore: Vec<u8>,
    pub apps: Vec<String>,
}

/// Current wire version for [`AccessFile`].
pub const ACCESS_FILE_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_file_round_trips_through_json() {
        let file = AccessFile {
            id: Snowflake(42),
            version: ACCESS_FILE_VERSION,
            pool_id: PoolId(7),
            keys: vec![
                KeyEntry { user_id: UserId("alice".into()), since: 100, value: Some(vec![1, 2, 3]) },
                KeyEntry { user_id: UserId("bob".into()), since: 200, value: None },
            ],
            nonce: vec![9; 16],
            master_key_id: KeyId(3),
            keystore: vec![4, 5, 6],
            apps: vec!["chat".to_string()],
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["pool-id"], serde_json::json!(7));
        assert_eq!(json["master-key-id"], serde_json::json!(3));
        let restored: AccessFile = serde_json::from_value(json).unwrap();
        assert_eq!(restored.keys[1].value, None);
        assert_eq!(restored.keys[0].value, Some(vec![1, 2, 3]));
    }
}
