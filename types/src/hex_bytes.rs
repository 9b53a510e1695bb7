//! Serde adapter encoding byte vectors as `0x`-prefixed hex strings.
//!
//! Use with `#[serde(with = "tollgate_types::hex_bytes")]`. Decoding accepts
//! input with or without the prefix.

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&encode(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    decode(&s).map_err(serde::de::Error::custom)
}

/// `0x` + lower-case hex.
pub fn encode(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode hex with an optional `0x` prefix. Empty input decodes to no bytes.
pub fn decode(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let body = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    hex::decode(body)
}
