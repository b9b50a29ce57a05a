//! Transport seam between the connection state machine and the network.
//!
//! A [`Transport`] performs the handshake and hands back a live
//! [`TransportConnection`]. The state machine never touches sockets; tests
//! substitute their own implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::options::ClientOptions;
use crate::types::{ConnectionIdentity, ErrorReason};

/// Connection to continue and how far into it the client got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub connection_key: String,
    /// Serial of the last message received; `None` if there was none.
    pub connection_serial: Option<u64>,
}

impl From<ConnectionIdentity> for ResumePoint {
    fn from(identity: ConnectionIdentity) -> Self {
        Self {
            connection_key: identity.connection_key,
            connection_serial: Some(identity.connection_serial),
        }
    }
}

/// What the handshake asks the service for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// A brand new connection.
    Fresh,
    /// Take over a connection from a recovery key (possibly another client).
    Recover(ResumePoint),
    /// Resume this client's own connection after a disconnect.
    Resume(ResumePoint),
}

impl Continuation {
    pub fn resume_point(&self) -> Option<&ResumePoint> {
        match self {
            Continuation::Fresh => None,
            Continuation::Recover(p) | Continuation::Resume(p) => Some(p),
        }
    }
}

/// Everything a transport needs to open one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub realtime_host: String,
    pub tls: bool,
    pub client_id: Option<String>,
    pub key: Option<String>,
    pub token: Option<String>,
    pub echo_messages: bool,
    pub continuation: Continuation,
}

impl ConnectRequest {
    pub fn new(options: &ClientOptions, continuation: Continuation) -> Self {
        Self {
            realtime_host: options.realtime_host().to_string(),
            tls: options.tls,
            client_id: options.client_id.clone(),
            key: options.key.clone(),
            token: options.token.clone(),
            echo_messages: options.echo_messages,
            continuation,
        }
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub connection_id: Option<String>,
    pub connection_key: String,
    /// `None` when the service has not numbered any message yet.
    pub connection_serial: Option<u64>,
    pub max_idle_interval: Option<Duration>,
    /// Set when the service connected us but could not honour the
    /// requested continuation.
    pub error: Option<ErrorReason>,
}

/// Connection-level events from a live transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message advanced the connection serial.
    Serial(u64),
    /// The link dropped; the connection may be resumed.
    Disconnected(Option<ErrorReason>),
    /// The service rejected the connection for good.
    Failed(ErrorReason),
    /// The service closed the connection.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Worth retrying (network failure, 5xx, timeout).
    #[error("transient transport failure: {0}")]
    Transient(ErrorReason),

    /// Retrying will not help (auth rejected, bad request).
    #[error("fatal transport failure: {0}")]
    Fatal(ErrorReason),
}

impl TransportError {
    pub fn reason(&self) -> &ErrorReason {
        match self {
            TransportError::Transient(r) | TransportError::Fatal(r) => r,
        }
    }

    pub fn into_reason(self) -> ErrorReason {
        match self {
            TransportError::Transient(r) | TransportError::Fatal(r) => r,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection and complete the handshake. Callers apply their own
    /// timeout and may drop the future to cancel the attempt.
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<(Handshake, Box<dyn TransportConnection>), TransportError>;
}

#[async_trait]
pub trait TransportConnection: Send {
    /// Wait for the next connection-level event.
    ///
    /// Must be cancel-safe: the state machine drops this future whenever a
    /// command arrives first.
    async fn next_event(&mut self) -> TransportEvent;

    /// Send CLOSE and wait for the service to confirm. Callers apply their
    /// own timeout.
    async fn close(&mut self) -> Result<(), TransportError>;
}
