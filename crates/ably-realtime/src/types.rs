//! Public message, presence and token types for the ably-realtime crate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A future that returns the result of an auth callback.
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<TokenSource, BoxError>> + Send>>;

/// A boxed error type for the token callback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Callback that obtains a token (or a signed token request) from your server.
pub type AuthCallback = Arc<dyn Fn(TokenParams) -> TokenFuture + Send + Sync>;

/// Ably TokenRequest: a signed request, created locally from an API key or
/// obtained from your server, that Ably's REST API exchanges for a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub key_name: String,
    pub timestamp: i64,
    pub nonce: String,
    pub mac: String,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Ably TokenDetails: the actual token returned by Ably's REST API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub token: String,
    #[serde(default)]
    pub expires: i64,
    #[serde(default)]
    pub issued: i64,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl TokenDetails {
    /// A bare token string with no expiry information.
    pub fn from_token(token: impl Into<String>) -> Self {
        TokenDetails {
            token: token.into(),
            ..Default::default()
        }
    }

    /// `true` once `now_ms` is within `buffer_ms` of the expiry time. Tokens
    /// without expiry information never expire locally; the server tells us.
    pub fn is_expired(&self, now_ms: i64, buffer_ms: i64) -> bool {
        self.expires > 0 && now_ms + buffer_ms >= self.expires
    }
}

/// Parameters for a new token. Unset fields fall back to the client's
/// default token params, then to the server defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl TokenParams {
    /// Field-wise merge where `self` wins over `defaults`.
    pub(crate) fn or(&self, defaults: &TokenParams) -> TokenParams {
        TokenParams {
            ttl: self.ttl.or(defaults.ttl),
            capability: self.capability.clone().or_else(|| defaults.capability.clone()),
            client_id: self.client_id.clone().or_else(|| defaults.client_id.clone()),
            timestamp: self.timestamp.or(defaults.timestamp),
            nonce: self.nonce.clone().or_else(|| defaults.nonce.clone()),
        }
    }
}

/// What an auth callback or auth URL may hand back.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenSource {
    /// A signed request still to be exchanged with the REST API.
    Request(TokenRequest),
    /// A token that is ready to use.
    Details(TokenDetails),
    /// A bare token string.
    Token(String),
}

/// A message published to or received from a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    /// Unique message ID.
    pub id: Option<String>,
    /// Event name (e.g. "job", "events", "status").
    pub name: Option<String>,
    /// Message payload.
    pub data: serde_json::Value,
    /// Remaining payload encoding layers, if any could not be decoded.
    pub encoding: Option<String>,
    /// Publisher's client ID.
    pub client_id: Option<String>,
    /// Publisher's connection ID.
    pub connection_id: Option<String>,
    /// Server timestamp (milliseconds since epoch).
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Message {
            name: Some(name.into()),
            data,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Size counted against `maxMessageSize`: name, data and client id.
    pub(crate) fn size(&self) -> usize {
        let data = match &self.data {
            serde_json::Value::Null => 0,
            serde_json::Value::String(s) => s.len(),
            other => other.to_string().len(),
        };
        self.name.as_ref().map_or(0, String::len)
            + self.client_id.as_ref().map_or(0, String::len)
            + data
    }
}

/// Presence action carried by a [`PresenceMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum PresenceAction {
    #[default]
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

impl TryFrom<i32> for PresenceAction {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PresenceAction::Absent,
            1 => PresenceAction::Present,
            2 => PresenceAction::Enter,
            3 => PresenceAction::Leave,
            4 => PresenceAction::Update,
            other => return Err(format!("unknown presence action {other}")),
        })
    }
}

impl From<PresenceAction> for i32 {
    fn from(action: PresenceAction) -> Self {
        action as i32
    }
}

/// A presence event for one member of a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub data: serde_json::Value,
    pub encoding: Option<String>,
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    /// Members are unique per connection and client id.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.connection_id.as_deref().unwrap_or_default(),
            self.client_id.as_deref().unwrap_or_default()
        )
    }

    /// `true` when the id was assigned by a real publish on the member's own
    /// connection (`{connection_id}:{msg_serial}:{index}`) rather than
    /// synthesized by the server.
    pub(crate) fn has_connection_scoped_id(&self) -> bool {
        match (self.id.as_deref(), self.connection_id.as_deref()) {
            (Some(id), Some(conn)) => !conn.is_empty() && id.starts_with(conn),
            _ => false,
        }
    }

    /// The trailing `msg_serial:index` pair of the id.
    pub(crate) fn serial_and_index(&self) -> Option<(i64, i64)> {
        let id = self.id.as_deref()?;
        let mut parts = id.rsplitn(3, ':');
        let index = parts.next()?.parse().ok()?;
        let serial = parts.next()?.parse().ok()?;
        Some((serial, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_request_json_round_trip() {
        let tr = TokenRequest {
            key_name: "xVLyHw.mDYnFA".to_string(),
            timestamp: 1700000000000,
            nonce: "abc123".to_string(),
            mac: "base64mac==".to_string(),
            capability: r#"{"channel":["subscribe"]}"#.to_string(),
            ttl: Some(3600000),
            client_id: None,
        };
        let json = serde_json::to_string(&tr).unwrap();
        assert!(json.contains("keyName"));
        assert!(json.contains("xVLyHw.mDYnFA"));
        assert!(!json.contains("clientId")); // None → skipped

        let parsed: TokenRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.key_name, "xVLyHw.mDYnFA");
        assert_eq!(parsed.ttl, Some(3600000));
    }

    #[test]
    fn token_details_json_deserialization() {
        let json = r#"{
            "token": "xVLyHw.some-token-string",
            "keyName": "xVLyHw.mDYnFA",
            "issued": 1700000000000,
            "expires": 1700003600000,
            "capability": "{\"*\":[\"*\"]}"
        }"#;
        let td: TokenDetails = serde_json::from_str(json).unwrap();
        assert_eq!(td.token, "xVLyHw.some-token-string");
        assert_eq!(td.expires, 1700003600000);
        assert_eq!(td.issued, 1700000000000);
    }

    #[test]
    fn token_expiry_applies_buffer() {
        let td = TokenDetails {
            token: "t".into(),
            expires: 100_000,
            ..Default::default()
        };
        assert!(!td.is_expired(80_000, 10_000));
        assert!(td.is_expired(90_000, 10_000));
        assert!(!TokenDetails::from_token("bare").is_expired(i64::MAX - 1, 0));
    }

    #[test]
    fn token_params_merge_prefers_explicit_values() {
        let explicit = TokenParams {
            ttl: Some(1000),
            ..Default::default()
        };
        let defaults = TokenParams {
            ttl: Some(5000),
            client_id: Some("bob".into()),
            ..Default::default()
        };
        let merged = explicit.or(&defaults);
        assert_eq!(merged.ttl, Some(1000));
        assert_eq!(merged.client_id.as_deref(), Some("bob"));
    }

    #[test]
    fn presence_id_parsing() {
        let msg = PresenceMessage {
            id: Some("conn-x:12:3".into()),
            connection_id: Some("conn-x".into()),
            client_id: Some("alice".into()),
            ..Default::default()
        };
        assert!(msg.has_connection_scoped_id());
        assert_eq!(msg.serial_and_index(), Some((12, 3)));
        assert_eq!(msg.member_key(), "conn-x:alice");

        let synthesized = PresenceMessage {
            id: Some("server-abc:0:0".into()),
            connection_id: Some("conn-x".into()),
            ..Default::default()
        };
        assert!(!synthesized.has_connection_scoped_id());
    }

    #[test]
    fn message_size_counts_name_data_and_client_id() {
        let msg = Message::new("evt", serde_json::json!("12345")).with_client_id("ab");
        assert_eq!(msg.size(), 3 + 5 + 2);
    }
}
