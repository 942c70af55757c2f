//! Byte blobs on the wire.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::error::{SessionError, SessionResult};

/// Bytes that serialize as a lowercase hex string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HexBytes(pub Vec<u8>);

impl HexBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw.trim())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Render a value as `{value_b64, value_hex, value_len}`.
pub fn encode_value(bytes: &[u8]) -> Value {
    json!({
        "value_b64": STANDARD.encode(bytes),
        "value_hex": hex::encode(bytes),
        "value_len": bytes.len(),
    })
}

/// Decode a value supplied either as base64 or as hex. Base64 wins when both are present.
pub fn decode_value(value_b64: Option<&str>, value_hex: Option<&str>) -> SessionResult<Vec<u8>> {
    match (value_b64, value_hex) {
        (Some(b64), _) if !b64.is_empty() => STANDARD
            .decode(b64.trim())
            .map_err(|_| SessionError::InvalidArgument("value_b64 is not valid base64".to_owned())),
        (_, Some(hex_value)) if !hex_value.is_empty() => hex::decode(hex_value.trim())
            .map_err(|_| SessionError::InvalidArgument("value_hex is not valid hex".to_owned())),
        _ => Err(SessionError::InvalidArgument(
            "provide value_b64 or value_hex".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_bytes_serialize_as_string() {
        let json = serde_json::to_string(&HexBytes(vec![0xde, 0xad])).unwrap();
        assert_eq!(json, "\"dead\"");
        let back: HexBytes = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_slice(), &[0xde, 0xad]);
    }

    #[test]
    fn encode_value_reports_all_forms() {
        let value = encode_value(b"hi");
        assert_eq!(value["value_b64"], "aGk=");
        assert_eq!(value["value_hex"], "6869");
        assert_eq!(value["value_len"], 2);
    }

    #[test]
    fn decode_value_prefers_base64() {
        assert_eq!(decode_value(Some("aGk="), Some("00")).unwrap(), b"hi");
        assert_eq!(decode_value(None, Some("0a0b")).unwrap(), vec![0x0a, 0x0b]);
    }

    #[test]
    fn decode_value_rejects_missing_and_malformed() {
        assert!(matches!(
            decode_value(None, None),
            Err(SessionError::InvalidArgument(_))
        ));
        assert!(decode_value(Some("!!"), None).is_err());
        assert!(decode_value(None, Some("xyz")).is_err());
    }
}
