//! Wire frames: JSON arrays of the shape `[kind, payload]`.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, EventBody};

/// Protocol identifier exchanged in the HELLO handshake.
pub const PROTOCOL: &str = "cgp/0.1";

/// Error codes carried in `ERROR` frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    #[serde(rename = "INVALID_FRAME")]
    InvalidFrame,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "VALIDATION_FAILED")]
    ValidationFailed,
    #[serde(rename = "UNSUPPORTED_PROTOCOL")]
    UnsupportedProtocol,
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sub {
    pub sub_id: String,
    pub guild_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Unsub {
    pub sub_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub sub_id: String,
    pub guild_id: String,
    pub events: Vec<Event>,
    /// Seq of the last event in the relay's full log; `null` when empty.
    pub end_seq: Option<u64>,
}

/// Client publish: the signed fields only. The relay assigns seq/prevHash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Publish {
    pub body: EventBody,
    pub author: String,
    pub signature: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Render a `[kind, payload]` frame.
pub fn frame<T: Serialize>(kind: &str, payload: &T) -> String {
    serde_json::json!([kind, payload]).to_string()
}

pub fn error_frame(code: ErrorCode, message: impl Into<String>) -> String {
    frame(
        "ERROR",
        &ErrorPayload {
            code,
            message: message.into(),
        },
    )
}

pub fn event_frame(ev: &Event) -> String {
    frame("EVENT", ev)
}

/// Split a text frame into its kind and raw payload.
pub fn parse(text: &str) -> Result<(String, Value)> {
    let value: Value = serde_json::from_str(text).map_err(|e| anyhow!("bad json: {e}"))?;
    let arr = value.as_array().ok_or_else(|| anyhow!("frame is not an array"))?;
    if arr.len() != 2 {
        return Err(anyhow!("frame must have exactly two elements"));
    }
    let kind = arr[0]
        .as_str()
        .ok_or_else(|| anyhow!("frame kind is not a string"))?;
    Ok((kind.to_string(), arr[1].clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_are_two_element_arrays() {
        let text = frame(
            "SUB",
            &Sub {
                sub_id: "s1".into(),
                guild_id: "g".into(),
                channels: None,
                from_seq: Some(3),
                limit: None,
            },
        );
        let (kind, payload) = parse(&text).unwrap();
        assert_eq!(kind, "SUB");
        assert_eq!(payload["subId"], "s1");
        assert_eq!(payload["fromSeq"], 3);
        assert!(payload.get("channels").is_none());
    }

    #[test]
    fn error_codes_use_wire_names() {
        let text = error_frame(ErrorCode::ValidationFailed, "permission denied");
        let (kind, payload) = parse(&text).unwrap();
        assert_eq!(kind, "ERROR");
        assert_eq!(payload["code"], "VALIDATION_FAILED");
        let back: ErrorPayload = serde_json::from_value(payload).unwrap();
        assert_eq!(back.code, ErrorCode::ValidationFailed);
    }

    #[test]
    fn parse_rejects_malformed_frames() {
        assert!(parse("not json").is_err());
        assert!(parse("{}").is_err());
        assert!(parse("[\"ONLY_KIND\"]").is_err());
        assert!(parse("[1, {}]").is_err());
        assert!(parse("[\"A\", {}, {}]").is_err());
    }

    #[test]
    fn hello_round_trip() {
        let hello: Hello = serde_json::from_value(json!({
            "protocol": "cgp/0.1",
            "clientName": "guildr",
        }))
        .unwrap();
        assert_eq!(hello.protocol, PROTOCOL);
        assert_eq!(hello.client_name.as_deref(), Some("guildr"));
        assert!(hello.client_version.is_none());
    }

    #[test]
    fn publish_payload_round_trip() {
        let publish = Publish {
            body: EventBody::UnbanUser {
                guild_id: "g".into(),
                user_id: "u".into(),
            },
            author: "02ab".into(),
            signature: "cd".into(),
            created_at: 9,
        };
        let text = frame("PUBLISH", &publish);
        let (_, payload) = parse(&text).unwrap();
        let back: Publish = serde_json::from_value(payload).unwrap();
        assert_eq!(back, publish);
    }
}
