//! Wire shape of an invite token (spec.md §4.9, §6 "Invite token grammar").

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

mod b64_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        let encoded: Vec<String> =
            items.iter().map(|b| base64::engine::general_purpose::STANDARD.encode(b)).collect();
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        use base64::Engine;
        let encoded = Vec::<String>::deserialize(d)?;
        encoded
            .into_iter()
            .map(|s| {
                base64::engine::general_purpose::STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// Current wire version for [`Token`].
pub const TOKEN_VERSION: f32 = 1.0;

/// The signed payload compressed and encoded into an invite string
/// (spec.md §4.9). The trailing `dgst_ed25519_blake2b` field lives outside
/// this struct, added/stripped by `poolmesh_crypto::envelope`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Token {
    pub version: f32,
    pub subject: String,
    pub sender_nick: String,
    pub pool_name: String,
    pub crc_of_storages: u32,
    #[serde(with = "b64_list")]
    pub recipient_key_wrappings: Vec<Vec<u8>>,
    #[serde(with = "b64")]
    pub storages_field: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_through_json_with_kebab_case_fields() {
        let token = Token {
            version: TOKEN_VERSION,
            subject: "join my pool".to_string(),
            sender_nick: "alice".to_string(),
            pool_name: "photos".to_string(),
            crc_of_storages: 42,
            recipient_key_wrappings: vec![vec![1, 2, 3], vec![4, 5]],
            storages_field: vec![9, 9, 9],
        };
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["sender-nick"], serde_json::json!("alice"));
        assert_eq!(json["crc-of-storages"], serde_json::json!(42));
        let restored: Token = serde_json::from_value(json).unwrap();
        assert_eq!(restored.recipient_key_wrappings, token.recipient_key_wrappings);
        assert_eq!(restored.storages_field, token.storages_field);
    }
}
