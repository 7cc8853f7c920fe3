//! Recovery keys: the state a new client needs to continue a previous
//! client's connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::protocol::error_code;

/// Serializable position of a connection and its channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    pub connection_key: String,
    /// Last message serial used by the previous connection.
    pub msg_serial: i64,
    /// Last connection serial seen, when the server provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    /// Last channel serial seen per attached channel.
    #[serde(default)]
    pub channel_serials: HashMap<String, String>,
}

impl RecoveryContext {
    /// Accepts either the JSON context produced by [`RecoveryContext::encode`]
    /// or the compact `"{connection_key}:{serial}:{msg_serial}"` key.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        if trimmed.starts_with('{') {
            return serde_json::from_str(trimmed).map_err(|e| {
                Error::configuration(
                    error_code::INVALID_PARAMETER,
                    format!("invalid recovery context: {e}"),
                )
            });
        }
        let invalid = || {
            Error::configuration(
                error_code::INVALID_PARAMETER,
                format!("invalid recovery key '{trimmed}': expected \"key:serial:msgSerial\""),
            )
        };
        let mut parts = trimmed.rsplitn(3, ':');
        let msg_serial = parts.next().and_then(|p| p.parse::<i64>().ok()).ok_or_else(invalid)?;
        let serial = parts.next().and_then(|p| p.parse::<i64>().ok()).ok_or_else(invalid)?;
        let key = parts.next().filter(|k| !k.is_empty()).ok_or_else(invalid)?;
        Ok(RecoveryContext {
            connection_key: key.to_string(),
            msg_serial,
            connection_serial: Some(serial),
            channel_serials: HashMap::new(),
        })
    }

    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// The compact recovery key form.
    pub fn to_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.connection_key,
            self.connection_serial.unwrap_or(-1),
            self.msg_serial
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_key() {
        let ctx = RecoveryContext::parse("abc!def:12:7").unwrap();
        assert_eq!(ctx.connection_key, "abc!def");
        assert_eq!(ctx.connection_serial, Some(12));
        assert_eq!(ctx.msg_serial, 7);
        assert_eq!(ctx.to_key(), "abc!def:12:7");
    }

    #[test]
    fn parses_json_context() {
        let mut ctx = RecoveryContext {
            connection_key: "k1".into(),
            msg_serial: 3,
            connection_serial: None,
            channel_serials: HashMap::new(),
        };
        ctx.channel_serials.insert("room".into(), "s9".into());
        let encoded = ctx.encode().unwrap();
        assert!(encoded.contains("\"connectionKey\":\"k1\""));
        assert!(encoded.contains("\"channelSerials\""));
        assert_eq!(RecoveryContext::parse(&encoded).unwrap(), ctx);
    }

    #[test]
    fn rejects_malformed_keys() {
        for bad in ["", "key", "key:1", ":1:2", "key:x:2", "{not json"] {
            let err = RecoveryContext::parse(bad).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{bad} should be rejected");
        }
    }
}
