//! Text-safe encoding of keys and values
//!
//! The gateway carries arbitrary key and value bytes as standard base64
//! strings. Everything in this crate works on decoded bytes; encoding
//! happens only at the serde boundary.

use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serializer};

pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

/// Render decoded bytes for display and path splitting.
///  Invalid UTF-8 sequences are replaced rather than rejected.
pub fn display(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

pub(crate) mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode(&text).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod base64_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => decode(&text).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

/// int64 fields arrive either as JSON numbers or as decimal strings,
///  depending on how the gateway marshals them
pub(crate) mod int_or_string {
    use super::*;

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match IntOrString::deserialize(deserializer)? {
            IntOrString::Int(value) => Ok(value),
            IntOrString::Str(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Frame ids are strings on the wire, but tolerate numeric ids
pub(crate) mod opt_id {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.serialize_str(id),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(
            Option::<IntOrString>::deserialize(deserializer)?.map(|id| match id {
                IntOrString::Int(value) => value.to_string(),
                IntOrString::Str(text) => text,
            }),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_matches_gateway_form() {
        assert_eq!(encode("/a/b"), "L2EvYg==");
        assert_eq!(encode([0u8]), "AA==");
        assert_eq!(decode("L2EvYg==").unwrap(), b"/a/b");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not base64!").is_err());
    }

    #[test]
    fn test_display_is_lossy() {
        assert_eq!(display(b"/caf\xc3\xa9"), "/café");
        assert_eq!(display(b"/bad\xff"), "/bad\u{fffd}");
    }
}
