//! Public entry point: [`RealtimeClient`].

use std::sync::Arc;

use crate::connection::{Connection, Lifeline};
use crate::events::{EventEmitter, ListenerId};
use crate::options::ClientOptions;
use crate::transport::Transport;
use crate::types::{ConnectionState, ConnectionStateChange, ErrorReason, Result};
use crate::websocket::WebSocketTransport;

/// A realtime client owning one logical connection.
///
/// Must be constructed inside a tokio runtime. Dropping the client closes the
/// connection; share [`Connection`] handles (e.g. with listeners) instead of
/// the client itself.
#[derive(Debug)]
pub struct RealtimeClient {
    options: Arc<ClientOptions>,
    connection: Connection,
    _lifeline: Lifeline,
}

impl RealtimeClient {
    /// Connect over WebSocket. Starts connecting immediately when
    /// `options.auto_connect` is set.
    pub fn new(options: ClientOptions) -> Result<Self> {
        Self::with_transport(options, Arc::new(WebSocketTransport::new()))
    }

    pub fn with_transport(options: ClientOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_emitter(options, transport, Arc::new(EventEmitter::new()))
    }

    /// Use a caller-supplied emitter, e.g. to register listeners before the
    /// first automatic connect attempt.
    pub fn with_emitter(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        emitter: Arc<EventEmitter<ConnectionStateChange>>,
    ) -> Result<Self> {
        options.validate()?;
        let options = Arc::new(options);
        let (connection, lifeline) = Connection::spawn(Arc::clone(&options), transport, emitter)?;
        if options.auto_connect {
            connection.connect()?;
        }
        Ok(Self {
            options,
            connection,
            _lifeline: lifeline,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connect(&self) -> Result<()> {
        self.connection.connect()
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection_key(&self) -> Result<String> {
        self.connection.connection_key()
    }

    pub fn connection_serial(&self) -> Result<u64> {
        self.connection.connection_serial()
    }

    pub fn recovery_key(&self) -> Result<String> {
        self.connection.recovery_key()
    }

    pub fn error_reason(&self) -> Option<ErrorReason> {
        self.connection.error_reason()
    }

    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.connection.on(handler)
    }

    pub fn once<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.connection.once(handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.connection.off(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;

    #[test]
    fn construction_outside_a_runtime_fails() {
        let mut options = ClientOptions::new();
        options.auto_connect = false;
        assert!(matches!(RealtimeClient::new(options), Err(Error::NoRuntime)));
    }

    #[test]
    fn invalid_options_are_rejected_before_spawning() {
        let mut options = ClientOptions::new();
        options.client_id = Some(String::new());
        assert!(matches!(
            RealtimeClient::new(options),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn recovery_key_requires_a_connection() {
        let mut options = ClientOptions::new();
        options.auto_connect = false;
        let client = RealtimeClient::new(options).unwrap();
        assert_eq!(client.state(), ConnectionState::Initialized);
        assert!(matches!(
            client.recovery_key(),
            Err(Error::IdentityUnavailable)
        ));
        assert!(matches!(
            client.connection_key(),
            Err(Error::IdentityUnavailable)
        ));
        assert!(client.error_reason().is_none());
    }
}
