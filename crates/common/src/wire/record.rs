use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use super::encoding::{self, base64_bytes, base64_opt, int_or_string};

/// A stored key, as returned by queries and carried by watch events.
///
/// Prefix scans return key-only records (`value` is `None`); single-key
///  lookups and watch events carry the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    /// revision of the last creation of this key
    #[serde(default, with = "int_or_string")]
    pub create_revision: i64,
    /// revision of the last modification of this key
    #[serde(default, with = "int_or_string")]
    pub mod_revision: i64,
    /// number of modifications since creation; reset by a delete
    #[serde(default, with = "int_or_string")]
    pub version: i64,
    #[serde(
        default,
        with = "base64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Vec<u8>>,
    /// attached lease id, 0 when none
    #[serde(default, with = "int_or_string")]
    pub lease: i64,
}

impl Record {
    /// Key-only record, as produced by a prefix scan
    pub fn key_only(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            create_revision: 0,
            mod_revision: 0,
            version: 0,
            value: None,
            lease: 0,
        }
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_revisions(mut self, create_revision: i64, mod_revision: i64, version: i64) -> Self {
        self.create_revision = create_revision;
        self.mod_revision = mod_revision;
        self.version = version;
        self
    }

    pub fn key_text(&self) -> Cow<'_, str> {
        encoding::display(&self.key)
    }

    pub fn value_text(&self) -> Option<Cow<'_, str>> {
        self.value.as_deref().map(encoding::display)
    }

    /// Tree path segments for this record's key
    pub fn paths(&self) -> Vec<String> {
        crate::tree::key_to_paths(&self.key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// store revision at which the request was applied
    #[serde(default, with = "int_or_string")]
    pub revision: i64,
}

impl ResponseHeader {
    pub fn new(revision: i64) -> Self {
        Self { revision }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Delete,
    Update,
}

/// A mutation pushed by the store's watch stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
    Create {
        #[serde(default)]
        header: ResponseHeader,
        #[serde(default)]
        kvs: Vec<Record>,
    },
    Delete {
        #[serde(default)]
        header: ResponseHeader,
        prev_kv: Record,
    },
    Update {
        #[serde(default)]
        header: ResponseHeader,
        #[serde(default)]
        kvs: Vec<Record>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev_kv: Option<Record>,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Create { .. } => ChangeKind::Create,
            ChangeEvent::Delete { .. } => ChangeKind::Delete,
            ChangeEvent::Update { .. } => ChangeKind::Update,
        }
    }

    pub fn header(&self) -> &ResponseHeader {
        match self {
            ChangeEvent::Create { header, .. }
            | ChangeEvent::Delete { header, .. }
            | ChangeEvent::Update { header, .. } => header,
        }
    }

    pub fn revision(&self) -> i64 {
        self.header().revision
    }
}

/// The `event` object of a call response.
///
/// Its shape depends on the call: queries fill `kvs` and `more`,
///  creates and deletes carry a typed change with `header`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChangeKind>,
    #[serde(default)]
    pub more: bool,
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub kvs: Vec<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_kv: Option<Record>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_record_decodes_base64_and_string_ints() {
        let raw = r#"{
            "key": "L2EvYg==",
            "create_revision": "7",
            "mod_revision": 9,
            "version": "2",
            "value": "aGVsbG8=",
            "lease": 0
        }"#;
        let record: Record = serde_json::from_str(raw).unwrap();
        assert_eq!(record.key, b"/a/b");
        assert_eq!(record.create_revision, 7);
        assert_eq!(record.mod_revision, 9);
        assert_eq!(record.version, 2);
        assert_eq!(record.value_text().as_deref(), Some("hello"));
        assert_eq!(record.paths(), vec!["a", "b"]);
    }

    #[test]
    fn test_key_only_record_has_no_value() {
        let record: Record = serde_json::from_str(r#"{"key":"L2E="}"#).unwrap();
        assert_eq!(record.key_text(), "/a");
        assert!(record.value.is_none());
        assert_eq!(record.lease, 0);
    }

    #[test]
    fn test_change_event_is_tagged_by_type() {
        let raw = r#"{
            "type": "delete",
            "more": false,
            "header": {"revision": 12},
            "prev_kv": {"key": "L2E=", "value": "MQ=="}
        }"#;
        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind(), ChangeKind::Delete);
        assert_eq!(event.revision(), 12);
        match event {
            ChangeEvent::Delete { prev_kv, .. } => assert_eq!(prev_kv.key, b"/a"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_query_payload_defaults() {
        let payload: EventPayload =
            serde_json::from_str(r#"{"header":{"revision":"3"},"kvs":[]}"#).unwrap();
        assert!(!payload.more);
        assert_eq!(payload.header.revision, 3);
        assert!(payload.kind.is_none());
    }
}
