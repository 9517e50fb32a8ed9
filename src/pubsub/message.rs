//! PubSub wire envelopes
//!
//! Outbound frames are `LISTEN`, `UNLISTEN` and `PING`. Inbound frames are
//! tagged by `type`; the tag is matched case-insensitively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Topics and credentials carried by LISTEN/UNLISTEN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenData {
    /// Resolved topic strings
    pub topics: Vec<String>,
    /// OAuth token with the scopes the topics require
    pub auth_token: String,
}

/// Frame sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum OutboundFrame {
    /// Start listening to topics
    Listen { nonce: String, data: ListenData },
    /// Stop listening to topics
    Unlisten { nonce: String, data: ListenData },
    /// Application-level keepalive
    Ping,
}

impl OutboundFrame {
    /// Create a LISTEN frame
    pub fn listen(nonce: impl Into<String>, topics: Vec<String>, auth_token: impl Into<String>) -> Self {
        OutboundFrame::Listen {
            nonce: nonce.into(),
            data: ListenData {
                topics,
                auth_token: auth_token.into(),
            },
        }
    }

    /// Create an UNLISTEN frame
    pub fn unlisten(nonce: impl Into<String>, topics: Vec<String>, auth_token: impl Into<String>) -> Self {
        OutboundFrame::Unlisten {
            nonce: nonce.into(),
            data: ListenData {
                topics,
                auth_token: auth_token.into(),
            },
        }
    }

    /// Nonce of the frame, if it carries one
    pub fn nonce(&self) -> Option<&str> {
        match self {
            OutboundFrame::Listen { nonce, .. } | OutboundFrame::Unlisten { nonce, .. } => {
                Some(nonce)
            }
            OutboundFrame::Ping => None,
        }
    }
}

/// Payload of a MESSAGE frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    /// Topic the message was published on
    pub topic: String,
    /// Message body; Twitch sends it as a JSON-encoded string
    pub message: Value,
}

impl MessageData {
    /// The message body, decoded when it arrived as a JSON string
    pub fn payload(&self) -> Value {
        match &self.message {
            Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| self.message.clone()),
            other => other.clone(),
        }
    }
}

/// Envelope as it appears on the wire
#[derive(Debug, Clone, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    nonce: Option<String>,
    error: Option<String>,
    data: Option<MessageData>,
}

/// Frame received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Answer to a PING
    Pong,
    /// Server asks the client to reconnect
    Reconnect,
    /// Answer to a LISTEN/UNLISTEN; `error` is `None` on success
    Response {
        nonce: Option<String>,
        error: Option<String>,
    },
    /// Notification on a topic
    Message(MessageData),
    /// Any other tag
    Other(String),
}

impl InboundFrame {
    /// Parse a text frame. Fails if the JSON is invalid or has no `type` tag.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let frame_type = raw
            .frame_type
            .ok_or_else(|| Error::Protocol("Invalid message format: missing type".to_string()))?;

        let frame = match frame_type.to_ascii_uppercase().as_str() {
            "PONG" => InboundFrame::Pong,
            "RECONNECT" => InboundFrame::Reconnect,
            "RESPONSE" => InboundFrame::Response {
                nonce: raw.nonce,
                error: raw.error.filter(|e| !e.trim().is_empty()),
            },
            "MESSAGE" => InboundFrame::Message(raw.data.ok_or_else(|| {
                Error::Protocol("MESSAGE frame without data".to_string())
            })?),
            _ => InboundFrame::Other(frame_type),
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_listen_frame_serialization() {
        let frame = OutboundFrame::listen(
            "abc",
            vec!["channel-bits-events-v1.44322889".to_string()],
            "token",
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "LISTEN",
                "nonce": "abc",
                "data": {
                    "topics": ["channel-bits-events-v1.44322889"],
                    "auth_token": "token"
                }
            })
        );
        assert_eq!(frame.nonce(), Some("abc"));
    }

    #[test]
    fn test_unlisten_frame_serialization() {
        let frame = OutboundFrame::unlisten("n", vec!["whispers.1".to_string()], "t");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "UNLISTEN");
        assert_eq!(value["data"]["topics"], json!(["whispers.1"]));
    }

    #[test]
    fn test_ping_frame_serialization() {
        let text = serde_json::to_string(&OutboundFrame::Ping).unwrap();
        assert_eq!(text, r#"{"type":"PING"}"#);
        assert_eq!(OutboundFrame::Ping.nonce(), None);
    }

    #[test]
    fn test_parse_pong_case_insensitive() {
        assert_eq!(InboundFrame::parse(r#"{"type":"PONG"}"#).unwrap(), InboundFrame::Pong);
        assert_eq!(InboundFrame::parse(r#"{"type":"pong"}"#).unwrap(), InboundFrame::Pong);
        assert_eq!(
            InboundFrame::parse(r#"{"type":"Reconnect"}"#).unwrap(),
            InboundFrame::Reconnect
        );
    }

    #[test]
    fn test_parse_response_with_empty_error() {
        let frame = InboundFrame::parse(r#"{"type":"RESPONSE","nonce":"n1","error":""}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Response {
                nonce: Some("n1".to_string()),
                error: None
            }
        );
    }

    #[test]
    fn test_parse_response_with_error() {
        let frame =
            InboundFrame::parse(r#"{"type":"RESPONSE","nonce":"n1","error":"ERR_BADAUTH"}"#)
                .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Response {
                nonce: Some("n1".to_string()),
                error: Some("ERR_BADAUTH".to_string())
            }
        );
    }

    #[test]
    fn test_parse_message_with_string_body() {
        let text = json!({
            "type": "MESSAGE",
            "data": {
                "topic": "channel-bits-events-v1.44322889",
                "message": "{\"data\":{\"bits_used\":10000}}"
            }
        })
        .to_string();

        match InboundFrame::parse(&text).unwrap() {
            InboundFrame::Message(data) => {
                assert_eq!(data.topic, "channel-bits-events-v1.44322889");
                assert_eq!(data.payload(), json!({"data": {"bits_used": 10000}}));
            }
            other => panic!("Expected Message frame, got {other:?}"),
        }
    }

    #[test]
    fn test_message_payload_non_json_string() {
        let data = MessageData {
            topic: "whispers.1".to_string(),
            message: json!("hello"),
        };
        assert_eq!(data.payload(), json!("hello"));
    }

    #[test]
    fn test_parse_missing_type_fails() {
        let err = InboundFrame::parse(r#"{"nonce":"n1"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_parse_invalid_json_fails() {
        let err = InboundFrame::parse("not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_parse_unknown_type() {
        assert_eq!(
            InboundFrame::parse(r#"{"type":"AUTH_REVOKED"}"#).unwrap(),
            InboundFrame::Other("AUTH_REVOKED".to_string())
        );
    }
}
