//! Connection-level Ably wire protocol: types, constants, MessagePack codec.
//!
//! Only the frames the connection core acts on are modelled; channel and
//! message payloads are ignored on decode.

use serde::{Deserialize, Serialize};

use crate::types::ErrorReason;

// ---------------------------------------------------------------------------
// Protocol action constants
// ---------------------------------------------------------------------------

pub mod action {
    pub const HEARTBEAT: i32 = 0;
    pub const CONNECTED: i32 = 4;
    pub const DISCONNECTED: i32 = 6;
    pub const CLOSE: i32 = 7;
    pub const CLOSED: i32 = 8;
    pub const ERROR: i32 = 9;
    pub const MESSAGE: i32 = 15;
}

pub mod error_code {
    pub const BAD_REQUEST: i32 = 40000;
    pub const FAILED: i32 = 80000;
    pub const SUSPENDED: i32 = 80002;
    pub const DISCONNECTED: i32 = 80003;
    pub const TIMEOUT: i32 = 80014;
    pub const CLOSED: i32 = 80017;
    pub const INVALID_CONNECTION_KEY: i32 = 80018;
    pub const UNKNOWN_CHANNEL_ERR: i32 = 50001;
    pub const UNKNOWN_CONNECTION_ERR: i32 = 50002;
}

// ---------------------------------------------------------------------------
// Wire protocol types (MessagePack)
// ---------------------------------------------------------------------------

// NOTE: `skip_serializing_if = "Option::is_none"` is omitted on purpose;
// rmp_serde fails to deserialize structs with skipped Option fields:
// https://github.com/3Hren/msgpack-rust/issues/86
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: i32,
    pub id: Option<String>,
    pub channel: Option<String>,
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_details: Option<ConnectionDetails>,
    /// -1 until the first message has been exchanged.
    pub connection_serial: Option<i64>,
    pub error: Option<ErrorInfo>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_state_ttl: Option<i64>,
    pub max_idle_interval: Option<i64>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: i32,
    pub status_code: Option<i32>,
    pub message: String,
}

impl ErrorInfo {
    /// Mirrors ably-js `isRetriable()`: no status code, a server error (5xx),
    /// or a well-known connection error code even at 4xx.
    pub fn is_retriable(&self) -> bool {
        const CONNECTION_ERROR_CODES: &[i32] = &[
            error_code::DISCONNECTED,
            error_code::SUSPENDED,
            error_code::FAILED,
            error_code::CLOSED,
            error_code::UNKNOWN_CONNECTION_ERR,
            error_code::UNKNOWN_CHANNEL_ERR,
        ];
        match self.status_code {
            None => true,
            Some(sc) if sc >= 500 => true,
            Some(_) => CONNECTION_ERROR_CODES.contains(&self.code),
        }
    }

    pub fn into_reason(self, description: impl Into<String>) -> ErrorReason {
        let message = if self.message.is_empty() {
            "no error details from server".to_string()
        } else {
            self.message
        };
        ErrorReason::new(message, description)
            .with_code(self.code)
            .with_status(self.status_code)
    }
}

impl ProtocolMessage {
    pub fn new(action: i32) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    /// Connection key from the message, preferring `connectionDetails`.
    pub fn connection_key(&self) -> Option<&str> {
        self.connection_details
            .as_ref()
            .and_then(|d| d.connection_key.as_deref())
            .or(self.connection_key.as_deref())
    }

    /// Wire serial as a non-negative count; -1 and absent are `None`.
    pub fn serial(&self) -> Option<u64> {
        self.connection_serial.and_then(|s| u64::try_from(s).ok())
    }
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_msg(msg: &ProtocolMessage) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Unknown fields (channel payloads, flags, ...) are skipped.
pub fn decode_msg(data: &[u8]) -> Result<ProtocolMessage, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_connected() {
        let msg = ProtocolMessage {
            action: action::CONNECTED,
            connection_id: Some("abc123".to_string()),
            connection_key: Some("abc123!key".to_string()),
            connection_serial: Some(-1),
            connection_details: Some(ConnectionDetails {
                connection_state_ttl: Some(120000),
                max_idle_interval: Some(15000),
                server_id: Some("frontend.0".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let decoded = decode_msg(&encode_msg(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.connection_key(), Some("abc123!key"));
        assert_eq!(decoded.serial(), None);
    }

    #[test]
    fn details_connection_key_wins() {
        let msg = ProtocolMessage {
            action: action::CONNECTED,
            connection_key: Some("old!key".to_string()),
            connection_details: Some(ConnectionDetails {
                connection_key: Some("new!key".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(msg.connection_key(), Some("new!key"));
    }

    #[test]
    fn decode_skips_channel_payloads() {
        // A MESSAGE frame as the service sends it, including fields this
        // crate does not model.
        let frame = serde_json::json!({
            "action": action::MESSAGE,
            "channel": "runner-group:test",
            "connectionSerial": 5,
            "flags": 262144,
            "messages": [{"name": "job", "data": {"runId": "uuid-123"}}],
        });
        let data = rmp_serde::to_vec_named(&frame).unwrap();
        let decoded = decode_msg(&data).unwrap();
        assert_eq!(decoded.action, action::MESSAGE);
        assert_eq!(decoded.serial(), Some(5));
        assert_eq!(decoded.channel.as_deref(), Some("runner-group:test"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_msg(&[0xc1, 0x00, 0xff]).is_err());
    }

    #[test]
    fn encode_decode_error() {
        let msg = ProtocolMessage {
            action: action::ERROR,
            error: Some(ErrorInfo {
                code: 40142,
                status_code: Some(401),
                message: "Token expired".to_string(),
            }),
            ..Default::default()
        };
        let decoded = decode_msg(&encode_msg(&msg).unwrap()).unwrap();
        let err = decoded.error.unwrap();
        assert_eq!(err.code, 40142);
        assert_eq!(err.status_code, Some(401));
        assert_eq!(err.message, "Token expired");
    }

    #[test]
    fn error_info_into_reason_fills_empty_message() {
        let reason = ErrorInfo::default().into_reason("handshake");
        assert_eq!(reason.message, "no error details from server");
        assert_eq!(reason.code, Some(0));
    }

    #[test]
    fn is_retriable_no_status_code() {
        let err = ErrorInfo {
            code: 12345,
            status_code: None,
            message: String::new(),
        };
        assert!(err.is_retriable());
    }

    #[test]
    fn is_retriable_server_error() {
        let err = ErrorInfo {
            code: 50000,
            status_code: Some(500),
            message: String::new(),
        };
        assert!(err.is_retriable());
    }

    #[test]
    fn is_retriable_connection_error_code_with_4xx() {
        let err = ErrorInfo {
            code: error_code::DISCONNECTED,
            status_code: Some(400),
            message: String::new(),
        };
        assert!(err.is_retriable());
    }

    #[test]
    fn is_retriable_auth_error_not_retriable() {
        let err = ErrorInfo {
            code: 40142,
            status_code: Some(401),
            message: String::new(),
        };
        assert!(!err.is_retriable());
    }
}
