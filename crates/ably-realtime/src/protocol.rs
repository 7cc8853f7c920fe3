//! Ably wire protocol types, constants, and MessagePack/JSON encode/decode.

use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::types::{Message, PresenceMessage};

// ---------------------------------------------------------------------------
// Protocol actions
// ---------------------------------------------------------------------------

/// The action carried by every [`ProtocolMessage`].
///
/// Encoded on the wire as its integer value. An unknown integer makes the
/// whole frame undecodable; the transport logs and drops such frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Action {
    #[default]
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
    Auth = 17,
}

impl Action {
    /// Actions that carry a `msgSerial` and are answered by ACK/NACK.
    pub fn ack_required(self) -> bool {
        matches!(self, Action::Message | Action::Presence)
    }
}

impl TryFrom<i32> for Action {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, String> {
        Ok(match value {
            0 => Action::Heartbeat,
            1 => Action::Ack,
            2 => Action::Nack,
            3 => Action::Connect,
            4 => Action::Connected,
            5 => Action::Disconnect,
            6 => Action::Disconnected,
            7 => Action::Close,
            8 => Action::Closed,
            9 => Action::Error,
            10 => Action::Attach,
            11 => Action::Attached,
            12 => Action::Detach,
            13 => Action::Detached,
            14 => Action::Presence,
            15 => Action::Message,
            16 => Action::Sync,
            17 => Action::Auth,
            other => return Err(format!("unknown protocol action {other}")),
        })
    }
}

impl From<Action> for i32 {
    fn from(action: Action) -> Self {
        action as i32
    }
}

pub mod error_code {
    pub const BAD_REQUEST: i32 = 40000;
    pub const INVALID_PARAMETER: i32 = 40003;
    pub const INVALID_KEY: i32 = 40005;
    pub const MAX_MESSAGE_LENGTH_EXCEEDED: i32 = 40009;
    pub const INVALID_CLIENT_ID: i32 = 40012;
    pub const INVALID_CREDENTIALS: i32 = 40101;
    pub const INCOMPATIBLE_CREDENTIALS: i32 = 40102;
    pub const INSECURE_REQUEST: i32 = 40103;
    pub const NO_CREDENTIALS: i32 = 40106;
    pub const TOKEN_EXPIRED: i32 = 40142;
    pub const AUTH_RESPONSE_INVALID: i32 = 40170;
    pub const NO_MEANS_TO_RENEW: i32 = 40171;
    pub const INTERNAL: i32 = 50000;
    pub const TIMEOUT: i32 = 50003;
    pub const FAILED: i32 = 80000;
    pub const SUSPENDED: i32 = 80002;
    pub const DISCONNECTED: i32 = 80003;
    pub const UNABLE_TO_RECOVER: i32 = 80008;
    pub const CONNECTION_TIMED_OUT: i32 = 80014;
    pub const CLOSED: i32 = 80017;
    pub const AUTH_CALLBACK_FAILED: i32 = 80019;
    pub const CHANNEL_OPERATION_FAILED: i32 = 90000;
    pub const CHANNEL_INVALID_STATE: i32 = 90001;
    pub const CHANNEL_TIMEOUT: i32 = 90007;
    pub const PRESENCE_INVALID_STATE: i32 = 91001;
    pub const PRESENCE_REENTER_FAILED: i32 = 91004;
    pub const PRESENCE_SYNC_INCOMPLETE: i32 = 91005;

    /// Token errors the connection recovers from by renewing the token.
    pub fn is_token_error(code: i32) -> bool {
        (40140..=40149).contains(&code)
    }
}

pub mod flags {
    // Ably protocol flag constants. HAS_PRESENCE, HAS_BACKLOG and
    // HAS_CHANNEL_RESUMED arrive on ATTACHED; ATTACH_RESUME and the MODE_*
    // bits are sent on ATTACH.
    pub const HAS_PRESENCE: i32 = 1;
    pub const HAS_BACKLOG: i32 = 2;
    pub const HAS_CHANNEL_RESUMED: i32 = 4;
    pub const ATTACH_RESUME: i32 = 1 << 5; // 32
    pub const MODE_PRESENCE: i32 = 1 << 16;
    pub const MODE_PUBLISH: i32 = 1 << 17;
    pub const MODE_SUBSCRIBE: i32 = 262_144; // bit 18
    pub const MODE_PRESENCE_SUBSCRIBE: i32 = 1 << 19;
}

/// Wire encoding negotiated through the `format` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Binary frames (Ably default).
    #[default]
    MsgPack,
    /// Text frames.
    Json,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::MsgPack => "msgpack",
            Format::Json => "json",
        }
    }
}

// ---------------------------------------------------------------------------
// Wire protocol types
// ---------------------------------------------------------------------------

// NOTE: We intentionally omit `skip_serializing_if = "Option::is_none"` on
// these structs. rmp_serde has a long-standing bug where skipped Option fields
// cause deserialization failures: https://github.com/3Hren/msgpack-rust/issues/86
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    pub id: Option<String>,
    pub channel: Option<String>,
    pub channel_serial: Option<String>,
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_details: Option<ConnectionDetails>,
    /// Deprecated in protocol v3+; retained for wire compatibility with older servers.
    pub connection_serial: Option<i64>,
    pub msg_serial: Option<i64>,
    pub count: Option<i64>,
    pub flags: Option<i32>,
    pub error: Option<ErrorInfo>,
    pub auth: Option<AuthDetails>,
    pub messages: Option<Vec<Message>>,
    pub presence: Option<Vec<PresenceMessage>>,
    pub timestamp: Option<i64>,
    pub params: Option<HashMap<String, String>>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        ProtocolMessage {
            action,
            ..Default::default()
        }
    }

    pub fn for_channel(action: Action, channel: &str) -> Self {
        ProtocolMessage {
            action,
            channel: Some(channel.to_string()),
            ..Default::default()
        }
    }

    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }

    /// Number of messages or presence messages carried.
    pub fn payload_len(&self) -> usize {
        self.messages.as_ref().map_or(0, Vec::len) + self.presence.as_ref().map_or(0, Vec::len)
    }

    /// An ack-required envelope must carry its serial before it may be sent.
    pub fn validate_for_send(&self) -> Result<(), ErrorInfo> {
        if self.action.ack_required() && self.msg_serial.is_none() {
            return Err(ErrorInfo::new(
                error_code::INTERNAL,
                Some(500),
                format!("{:?} envelope has no msgSerial", self.action),
            ));
        }
        Ok(())
    }

    /// Give every carried message without an id the id
    /// `{connection_id}:{msg_serial}:{index}`.
    pub fn assign_ids(&mut self, connection_id: &str) {
        let Some(serial) = self.msg_serial else {
            return;
        };
        if let Some(messages) = self.messages.as_mut() {
            for (index, m) in messages.iter_mut().enumerate() {
                if m.id.is_none() {
                    m.id = Some(format!("{connection_id}:{serial}:{index}"));
                }
            }
        }
        if let Some(presence) = self.presence.as_mut() {
            for (index, p) in presence.iter_mut().enumerate() {
                if p.id.is_none() {
                    p.id = Some(format!("{connection_id}:{serial}:{index}"));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_state_ttl: Option<i64>,
    pub max_idle_interval: Option<i64>,
    pub max_message_size: Option<i64>,
    pub max_frame_size: Option<i64>,
    pub server_id: Option<String>,
}

/// Structured error carried by the protocol and by every rejected operation.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: i32,
    pub status_code: Option<i32>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: i32, status_code: Option<i32>, message: impl Into<String>) -> Self {
        ErrorInfo {
            code,
            status_code,
            message: message.into(),
        }
    }

    pub fn is_token_error(&self) -> bool {
        error_code::is_token_error(self.code)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "code={} status={} {}", self.code, status, self.message),
            None => write!(f, "code={} {}", self.code, self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_msg(msg: &ProtocolMessage) -> Result<Vec<u8>, Error> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

pub fn encode_json(msg: &ProtocolMessage) -> Result<String, Error> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode_json(text: &str) -> Result<ProtocolMessage, Error> {
    serde_json::from_str(text).map_err(|e| Error::Protocol(ErrorInfo::new(
        error_code::BAD_REQUEST,
        None,
        format!("message decode error: {e}"),
    )))
}

pub fn decode_msg(data: &[u8]) -> Result<ProtocolMessage, Error> {
    // Three-step decode: msgpack → rmpv::Value → serde_json::Value → ProtocolMessage.
    //
    // 1. rmpv::Value handles msgpack binary data (which serde_json::Value cannot).
    // 2. serde_json::Value deduplicates map keys (Ably may send "messages" twice,
    //    which rmp_serde's struct deserializer rejects).
    // This adds allocation overhead compared to direct struct deserialization.
    let mut cursor = std::io::Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor).map_err(|e| {
        Error::Protocol(ErrorInfo::new(
            error_code::BAD_REQUEST,
            None,
            format!("msgpack decode error: {e}"),
        ))
    })?;
    let json = rmpv_to_json(value);
    serde_json::from_value(json).map_err(|e| {
        Error::Protocol(ErrorInfo::new(
            error_code::BAD_REQUEST,
            None,
            format!("message decode error: {e}"),
        ))
    })
}

/// Convert an rmpv::Value to serde_json::Value, encoding binary data as base64 strings.
fn rmpv_to_json(value: rmpv::Value) -> serde_json::Value {
    match value {
        rmpv::Value::Nil => serde_json::Value::Null,
        rmpv::Value::Boolean(b) => serde_json::Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                serde_json::Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                serde_json::Value::Number(n.into())
            } else {
                serde_json::Value::Null
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::String(s) => {
            if s.is_str() {
                serde_json::Value::String(s.into_str().unwrap_or_default().to_string())
            } else {
                tracing::warn!("msgpack string contains invalid UTF-8, substituting empty string");
                serde_json::Value::String(String::new())
            }
        }
        rmpv::Value::Binary(bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            serde_json::Value::String(encoded)
        }
        rmpv::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(rmpv_to_json).collect())
        }
        rmpv::Value::Map(map) => {
            let obj = map
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => {
                            if s.is_str() {
                                s.into_str().unwrap_or_default().to_string()
                            } else {
                                tracing::warn!("msgpack map key contains invalid UTF-8, substituting empty string");
                                String::new()
                            }
                        }
                        other => format!("{other}"),
                    };
                    (key, rmpv_to_json(v))
                })
                .collect();
            serde_json::Value::Object(obj)
        }
        rmpv::Value::Ext(_, bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            serde_json::Value::String(encoded)
        }
    }
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

/// Prepare outbound data: strings and null travel as-is, anything else is
/// sent as a JSON string with the `json` encoding.
pub(crate) fn encode_data(data: serde_json::Value) -> (serde_json::Value, Option<String>) {
    match data {
        serde_json::Value::Null | serde_json::Value::String(_) => (data, None),
        other => (
            serde_json::Value::String(other.to_string()),
            Some("json".to_string()),
        ),
    }
}

/// Undo the encoding layers of inbound data. Returns the decoded value and
/// whatever layers could not be decoded.
pub(crate) fn decode_data(
    data: serde_json::Value,
    encoding: Option<&str>,
) -> (serde_json::Value, Option<String>) {
    let Some(encoding) = encoding.filter(|e| !e.is_empty()) else {
        return (data, None);
    };
    let layers: Vec<&str> = encoding.split('/').collect();
    let mut result = data;
    let mut remaining = layers.len();
    for layer in layers.iter().rev() {
        match *layer {
            "json" => {
                if let serde_json::Value::String(ref s) = result {
                    match serde_json::from_str(s) {
                        Ok(parsed) => result = parsed,
                        Err(e) => {
                            // Intentional fallback: return raw data rather than failing the message.
                            tracing::warn!("Failed to decode JSON encoding layer: {e}");
                            break;
                        }
                    }
                }
            }
            "base64" => {
                // serde_json::Value has no binary type, so we represent decoded
                // bytes as a JSON array of numbers (e.g. [104, 101, 108, ...]).
                if let serde_json::Value::String(ref s) = result {
                    match base64::engine::general_purpose::STANDARD.decode(s) {
                        Ok(bytes) => {
                            result = serde_json::Value::Array(
                                bytes.into_iter().map(|b| b.into()).collect(),
                            );
                        }
                        Err(e) => {
                            tracing::warn!("Failed to decode base64 encoding layer: {e}");
                            break;
                        }
                    }
                }
            }
            "utf-8" => {
                // No-op: MessagePack strings are already UTF-8
            }
            other => {
                tracing::warn!(
                    encoding = other,
                    "Unsupported encoding layer, returning raw data"
                );
                break;
            }
        }
        remaining -= 1;
    }
    let rest = layers.get(..remaining).map(|l| l.join("/")).filter(|s| !s.is_empty());
    (result, rest)
}

// ---------------------------------------------------------------------------
// Helpers to build channel envelopes
// ---------------------------------------------------------------------------

pub fn build_attach_msg(
    channel: &str,
    params: Option<&HashMap<String, String>>,
    channel_serial: Option<&str>,
    mode_flags: i32,
) -> ProtocolMessage {
    let (cs, f) = match channel_serial {
        Some(s) => (Some(s.to_string()), mode_flags | flags::ATTACH_RESUME),
        None => (None, mode_flags),
    };
    ProtocolMessage {
        action: Action::Attach,
        channel: Some(channel.to_string()),
        channel_serial: cs,
        flags: (f != 0).then_some(f),
        params: params.filter(|p| !p.is_empty()).cloned(),
        ..Default::default()
    }
}

pub fn build_detach_msg(channel: &str) -> ProtocolMessage {
    ProtocolMessage::for_channel(Action::Detach, channel)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
