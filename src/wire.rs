//! Wire-format helpers for the attestation bundle JSON protocol (spec §6, §9).
//!
//! Opaque byte fields (quote parts, certificates) MUST travel as
//! `{"base64": "..."}` rather than being re-encoded for transport — they
//! are treated as byte strings the verifier alone interprets.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A byte string that (de)serializes as `{"base64": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Base64Bytes(pub Vec<u8>);

impl Base64Bytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Base64Bytes {
    fn from(v: Vec<u8>) -> Self {
        Base64Bytes(v)
    }
}

impl Serialize for Base64Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            base64: &'a str,
        }
        let encoded = STANDARD.encode(&self.0);
        Envelope { base64: &encoded }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Envelope {
            base64: String,
        }
        let envelope = Envelope::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(envelope.base64.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Base64Bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let original = Base64Bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"base64\""));
        let parsed: Base64Bytes = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn rejects_invalid_base64() {
        let err = serde_json::from_str::<Base64Bytes>(r#"{"base64":"not-valid-!!"}"#);
        assert!(err.is_err());
    }
}
