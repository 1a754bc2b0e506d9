//! Canonical serialization used for event hashing (spec §3, §4.2, §4.8,
//! §9: "Publishing a JSON profile with an explicit ordering is preferable
//! to relying on library defaults").
//!
//! `serde_json::to_string` already emits struct fields in the order they
//! are declared (no alphabetical reordering) and no insignificant
//! whitespace, which is exactly the property the protocol needs as long as
//! every event type keeps a stable field declaration order for its
//! lifetime. This module is the single choke point both the Event Log
//! (producer) and the Verifier (replayer) go through, so the two sides can
//! never drift apart.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonically serialize a value to its wire string.
pub fn canonical_serialize<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string(value)
}

/// SHA-256 digest of a value's canonical serialization, lowercase hex.
pub fn canonical_hash<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let serialized = canonical_serialize(value)?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

/// SHA-256 digest of an already-canonical string, lowercase hex.
pub fn hash_str(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        event_type: &'static str,
        value: u32,
    }

    #[test]
    fn serialization_has_no_incidental_whitespace() {
        let s = canonical_serialize(&Sample { event_type: "x", value: 1 }).unwrap();
        assert!(!s.contains(' ') || s == r#"{"event_type":"x","value":1}"#);
    }

    #[test]
    fn round_trips() {
        let original = Sample { event_type: "x", value: 7 };
        let s = canonical_serialize(&original).unwrap();
        let parsed: Sample = serde_json::from_str(&s).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn hash_is_stable_for_identical_input() {
        let a = canonical_hash(&Sample { event_type: "x", value: 1 }).unwrap();
        let b = canonical_hash(&Sample { event_type: "x", value: 1 }).unwrap();
        assert_eq!(a, b);
    }
}
