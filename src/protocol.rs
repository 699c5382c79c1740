//! Wire protocol envelope for the bridge WebSocket.
//!
//! Every frame on the wire is a single JSON object. Inbound frames are parsed
//! into a strongly-typed [`Frame`] whose `data` field stays opaque until the
//! matching event handler decodes it. Outbound traffic is built through
//! [`Reply`], which carries the originating correlation id (when the client
//! supplied one), a status, and either a data payload or a structured error.
//!
//! # Examples
//!
//! ```rust
//! use hashi::protocol::{Frame, Reply, events};
//!
//! let frame = Frame::parse(r#"{"event":"dispatch","id":"1","data":{"command":"users.list"}}"#)
//!     .unwrap();
//! assert_eq!(frame.event, events::DISPATCH);
//!
//! let reply = Reply::ok(events::DISPATCH, frame.id.clone(), serde_json::json!({"rows": []}));
//! assert!(reply.to_json().contains("\"status\":\"ok\""));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Event tags understood by the bridge, client → server and server → client.
pub mod events {
    pub const DISPATCH: &str = "dispatch";
    pub const INPUT_RESPONSE: &str = "input_response";
    pub const GET_SCHEMA: &str = "get_schema";
    pub const DISCOVER: &str = "discover";
    pub const INTROSPECT: &str = "introspect";
    pub const CACHE_STATS: &str = "cache_stats";
    pub const CLEAR_CACHE: &str = "clear_cache";
    pub const SET_QUERY_CACHE_TTL: &str = "set_query_cache_ttl";
    pub const BROADCAST: &str = "broadcast";

    pub const INFO: &str = "info";
    pub const DATA_UPDATED: &str = "data_updated";
    pub const INPUT_REQUEST: &str = "input_request";
}

/// Largest accepted inbound text frame. Anything beyond this is answered
/// with a `bad_frame` error without being parsed.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Top-level key that identifies a legacy frame without an `event` tag.
/// Such frames are routed as `dispatch`; the shim is intentionally narrow.
const LEGACY_COMMAND_KEY: &str = "command";

/// A single inbound wire frame.
///
/// The envelope is `{event, id?, data?}`. `data` is decoded per event tag by
/// the matching handler rather than here, so unknown payload shapes surface
/// as handler-level errors instead of parse failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Parses one text frame.
    ///
    /// Oversized input, invalid JSON, non-object values, and objects without
    /// a usable `event` tag are all rejected as `bad_frame`. A frame lacking
    /// `event` but carrying a top-level `"command"` key is accepted through
    /// the legacy shim and routed as `dispatch`, with the whole object as its
    /// payload.
    pub fn parse(text: &str) -> Result<Frame, BridgeError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(BridgeError::BadFrame(format!(
                "frame of {} bytes exceeds the {} byte limit",
                text.len(),
                MAX_FRAME_BYTES
            )));
        }

        let value: Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::BadFrame(format!("invalid JSON: {e}")))?;
        let Value::Object(mut obj) = value else {
            return Err(BridgeError::BadFrame("frame is not a JSON object".into()));
        };

        let id = match obj.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };

        match obj.remove("event") {
            Some(Value::String(event)) => Ok(Frame {
                event,
                id,
                data: obj.remove("data").unwrap_or(Value::Null),
            }),
            Some(_) => Err(BridgeError::BadFrame("event tag is not a string".into())),
            None if obj.contains_key(LEGACY_COMMAND_KEY) => Ok(Frame {
                event: events::DISPATCH.to_string(),
                id,
                data: Value::Object(obj),
            }),
            None => Err(BridgeError::BadFrame("missing event tag".into())),
        }
    }
}

/// Wire form of an error carried inside an error reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

/// An outbound reply or server-initiated frame.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    /// Builds a successful reply for `event`, echoing the correlation id.
    pub fn ok(event: &str, id: Option<String>, data: Value) -> Reply {
        Reply {
            event: event.to_string(),
            id,
            status: "ok",
            data: Some(data),
            error: None,
        }
    }

    /// Builds an error reply from a bridge error, echoing the correlation id.
    pub fn error(event: &str, id: Option<String>, err: &BridgeError) -> Reply {
        Reply {
            event: event.to_string(),
            id,
            status: "error",
            data: None,
            error: Some(WireError {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
        }
    }

    /// Serializes the reply to its wire form.
    pub fn to_json(&self) -> String {
        // Reply contains only JSON-safe types, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Builds a server-initiated frame (`info`, `data_updated`, `input_request`,
/// client-relayed `broadcast`). These carry no status field of their own, so
/// they are emitted as `{event, id?, data}` directly.
pub fn server_frame(event: &str, id: Option<String>, data: Value) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("event".into(), Value::String(event.to_string()));
    if let Some(id) = id {
        obj.insert("id".into(), Value::String(id));
    }
    obj.insert("data".into(), data);
    Value::Object(obj).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_envelope() {
        let f = Frame::parse(r#"{"event":"get_schema","id":"7","data":{"model":"users"}}"#)
            .unwrap();
        assert_eq!(f.event, "get_schema");
        assert_eq!(f.id.as_deref(), Some("7"));
        assert_eq!(f.data["model"], "users");
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let f = Frame::parse(r#"{"event":"discover"}"#).unwrap();
        assert!(f.data.is_null());
        assert!(f.id.is_none());
    }

    #[test]
    fn legacy_command_frame_becomes_dispatch() {
        let f = Frame::parse(r#"{"command":"users.list","args":{},"id":"3"}"#).unwrap();
        assert_eq!(f.event, events::DISPATCH);
        assert_eq!(f.id.as_deref(), Some("3"));
        assert_eq!(f.data["command"], "users.list");
    }

    #[test]
    fn rejects_frames_without_event_or_legacy_key() {
        let err = Frame::parse(r#"{"foo":1}"#).unwrap_err();
        assert_eq!(err.kind(), "bad_frame");
    }

    #[test]
    fn rejects_non_object_frames() {
        assert!(Frame::parse("[1,2,3]").is_err());
        assert!(Frame::parse("\"hello\"").is_err());
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn rejects_oversized_frames() {
        let huge = format!(
            r#"{{"event":"dispatch","data":"{}"}}"#,
            "x".repeat(MAX_FRAME_BYTES)
        );
        let err = Frame::parse(&huge).unwrap_err();
        assert_eq!(err.kind(), "bad_frame");
    }

    #[test]
    fn replies_echo_correlation_and_shape() {
        let ok = Reply::ok(events::DISPATCH, Some("9".into()), json!({"rows": [1]}));
        let v: Value = serde_json::from_str(&ok.to_json()).unwrap();
        assert_eq!(v["event"], "dispatch");
        assert_eq!(v["id"], "9");
        assert_eq!(v["status"], "ok");
        assert_eq!(v["data"]["rows"][0], 1);
        assert!(v.get("error").is_none());

        let err = Reply::error(
            events::DISPATCH,
            None,
            &BridgeError::Command("nope".into()),
        );
        let v: Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"]["kind"], "command");
        assert!(v.get("id").is_none());
    }

    #[test]
    fn server_frames_are_bare_envelopes() {
        let text = server_frame(events::INPUT_REQUEST, Some("p1".into()), json!({"prompt":"name?"}));
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["event"], "input_request");
        assert_eq!(v["id"], "p1");
        assert_eq!(v["data"]["prompt"], "name?");
        assert!(v.get("status").is_none());
    }
}
