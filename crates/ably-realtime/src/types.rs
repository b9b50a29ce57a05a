//! Public types for the ably-realtime crate.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::recovery::DecodeError;

/// Lifecycle state of a realtime connection. Exactly one is current at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    /// States the connection never leaves on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the connection entered its current state.
///
/// Always attached to [`ConnectionState::Failed`], usually to
/// [`ConnectionState::Suspended`] and [`ConnectionState::Disconnected`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorReason {
    pub message: String,
    pub description: String,
    /// Ably error code (e.g. 80003), when one is known.
    pub code: Option<i32>,
    /// HTTP-equivalent status code reported by the service.
    pub status_code: Option<i32>,
}

impl ErrorReason {
    pub fn new(message: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            description: description.into(),
            code: None,
            status_code: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_status(mut self, status_code: Option<i32>) -> Self {
        self.status_code = status_code;
        self
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.description.is_empty() {
            write!(f, " ({})", self.description)?;
        }
        if let Some(code) = self.code {
            write!(f, " [code={code}]")?;
        }
        Ok(())
    }
}

/// Service-assigned identity of a logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    /// Opaque key, stable for the life of the connection and across resumption.
    pub connection_key: String,
    /// Increases with every message exchanged on the connection.
    pub connection_serial: u64,
}

impl ConnectionIdentity {
    pub fn new(connection_key: impl Into<String>, connection_serial: u64) -> Self {
        Self {
            connection_key: connection_key.into(),
            connection_serial,
        }
    }

    /// The `"<connectionKey>:<connectionSerial>"` token for this identity.
    pub fn recovery_key(&self) -> String {
        crate::recovery::encode(self)
    }
}

/// Emitted once for every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorReason>,
    /// Delay before the next automatic connect attempt, for
    /// `Disconnected` and `Suspended`.
    pub retry_in: Option<Duration>,
}

/// Errors returned synchronously by this crate.
///
/// Network failures never show up here; they are reported through the
/// connection state and [`ErrorReason`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no connection identity has been assigned yet")]
    IdentityUnavailable,

    #[error("operation not permitted while {state}")]
    InvalidState { state: ConnectionState },

    #[error("a tokio runtime is required to run the connection")]
    NoRuntime,

    #[error("connection driver has stopped")]
    DriverStopped,

    #[error("invalid client options: {0}")]
    InvalidOptions(String),

    #[error("invalid recovery key: {0}")]
    RecoveryKey(#[from] DecodeError),

    #[error("timed out waiting for {target} (currently {current})")]
    Timeout {
        target: ConnectionState,
        current: ConnectionState,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
