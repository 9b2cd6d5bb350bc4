use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::encoding::{base64_opt, opt_id};
use super::record::ChangeEvent;

/// Frame discriminator shared by both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Delete,
    Query,
    Watch,
    Ping,
    Pong,
    Handshake,
}

impl Action {
    /// Actions whose responses are correlated back to a pending call
    pub fn is_call(&self) -> bool {
        matches!(self, Action::Create | Action::Delete | Action::Query)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Delete => "delete",
            Action::Query => "query",
            Action::Watch => "watch",
            Action::Ping => "ping",
            Action::Pong => "pong",
            Action::Handshake => "handshake",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload fields of an outgoing frame; everything but `id` and `action`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<u8>>,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub endkey: Option<Vec<u8>>,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub val: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<bool>,
}

impl CallRequest {
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn endkey(mut self, endkey: impl Into<Vec<u8>>) -> Self {
        self.endkey = Some(endkey.into());
        self
    }

    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.val = Some(value.into());
        self
    }

    pub fn lease(mut self, lease: i64) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn prefix(mut self, prefix: bool) -> Self {
        self.prefix = Some(prefix);
        self
    }
}

/// Client to server frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub action: Action,
    #[serde(flatten)]
    pub request: CallRequest,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, action: Action, request: CallRequest) -> Self {
        Self {
            id: id.into(),
            action,
            request,
        }
    }

    pub fn to_text(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Server to client frame: a call response or an unsolicited push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(default, with = "opt_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub action: Action,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame carries no event")]
    MissingEvent,
}

impl ResponseFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn success(id: impl Into<String>, action: Action, event: impl Serialize) -> Self {
        Self {
            id: Some(id.into()),
            action,
            success: true,
            key: None,
            event: serde_json::to_value(event).ok(),
            err: None,
        }
    }

    pub fn failure(id: impl Into<String>, action: Action, err: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            action,
            success: false,
            key: None,
            event: None,
            err: Some(err.into()),
        }
    }

    pub fn watch(event: &ChangeEvent) -> Self {
        Self {
            id: None,
            action: Action::Watch,
            success: true,
            key: None,
            event: serde_json::to_value(event).ok(),
            err: None,
        }
    }

    pub fn keepalive(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: Some(id.into()),
            action,
            success: true,
            key: None,
            event: None,
            err: None,
        }
    }

    /// Decode the `event` object into a typed payload
    pub fn decode_event<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        let event = self.event.clone().ok_or(FrameError::MissingEvent)?;
        Ok(serde_json::from_value(event)?)
    }

    pub fn to_text(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{EventPayload, Record, ResponseHeader};

    #[test]
    fn test_request_frame_shape() {
        let frame = RequestFrame::new(
            "4",
            Action::Query,
            CallRequest::key("/a").endkey("/b").prefix(true).limit(1),
        );
        let value: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": "4",
                "action": "query",
                "key": "L2E=",
                "endkey": "L2I=",
                "limit": 1,
                "prefix": true,
            })
        );
    }

    #[test]
    fn test_request_frame_parses_back() {
        let text = r#"{"id":"1","action":"create","key":"L2E=","val":"MQ==","lease":0}"#;
        let frame: RequestFrame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.action, Action::Create);
        assert_eq!(frame.request.key.as_deref(), Some(&b"/a"[..]));
        assert_eq!(frame.request.val.as_deref(), Some(&b"1"[..]));
        assert_eq!(frame.request.lease, Some(0));
        assert!(frame.request.prefix.is_none());
    }

    #[test]
    fn test_response_frame_failure_and_numeric_id() {
        let frame =
            ResponseFrame::parse(r#"{"id":17,"action":"query","success":false,"err":"nope"}"#)
                .unwrap();
        assert_eq!(frame.id.as_deref(), Some("17"));
        assert!(!frame.success);
        assert_eq!(frame.err.as_deref(), Some("nope"));
        assert!(matches!(
            frame.decode_event::<EventPayload>(),
            Err(FrameError::MissingEvent)
        ));
    }

    #[test]
    fn test_response_frame_event_round_trip() {
        let payload = EventPayload {
            more: true,
            header: ResponseHeader::new(5),
            kvs: vec![Record::key_only("/x")],
            ..Default::default()
        };
        let frame = ResponseFrame::success("9", Action::Query, &payload);
        let parsed = ResponseFrame::parse(&frame.to_text().unwrap()).unwrap();
        assert_eq!(parsed.decode_event::<EventPayload>().unwrap(), payload);
    }

    #[test]
    fn test_malformed_and_unknown_action_rejected() {
        assert!(ResponseFrame::parse("{not json").is_err());
        assert!(ResponseFrame::parse(r#"{"action":"explode"}"#).is_err());
    }
}
