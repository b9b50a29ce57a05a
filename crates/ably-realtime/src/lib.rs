//! Ably realtime connection management.
//!
//! The connection core of a realtime pub/sub client: a connection state
//! machine with automatic retry and resumption, the recovery-key format for
//! handing a connection to a new client, and endpoint resolution from a
//! deployment environment. Channels, payloads and token issuance are out of
//! scope.
//!
//! # Features
//! - Ably connection lifecycle (`initialized` through `closed`/`failed`)
//! - Recovery keys (`"<connectionKey>:<connectionSerial>"`) and resume after
//!   disconnection
//! - Disconnected/suspended retry policy with per-attempt timeouts
//! - Environment-based REST and realtime host resolution
//! - Pluggable transport; WebSocket + MessagePack by default
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), ably_realtime::Error> {
//! use std::time::Duration;
//! use ably_realtime::{ClientOptions, ConnectionState, RealtimeClient};
//!
//! let mut options = ClientOptions::with_key("keyName:keySecret");
//! options.set_environment("sandbox");
//!
//! let client = RealtimeClient::new(options)?;
//! client.on(|change| println!("{} -> {}", change.previous, change.current));
//! client
//!     .connection()
//!     .wait_for_state(ConnectionState::Connected, Duration::from_secs(10))
//!     .await?;
//! println!("recovery key: {}", client.recovery_key()?);
//! client.close();
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
pub mod events;
pub mod host;
mod options;
pub mod protocol;
pub mod recovery;
pub mod transport;
mod types;
mod websocket;

pub use client::RealtimeClient;
pub use connection::Connection;
pub use events::{EventEmitter, ListenerId};
pub use host::{DEFAULT_REALTIME_HOST, DEFAULT_REST_HOST, Hosts, resolve_hosts};
pub use options::{ClientOptions, TimingConfig};
pub use recovery::DecodeError;
pub use transport::{
    ConnectRequest, Continuation, Handshake, ResumePoint, Transport, TransportConnection,
    TransportError, TransportEvent,
};
pub use types::{
    ConnectionIdentity, ConnectionState, ConnectionStateChange, Error, ErrorReason, Result,
};
pub use websocket::{WebSocketTransport, WireError};
