//! WebSocket + MessagePack [`Transport`] for the Ably realtime service.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;

use crate::protocol::{ErrorInfo, ProtocolMessage, action, decode_msg, encode_msg, error_code};
use crate::transport::{
    ConnectRequest, Continuation, Handshake, Transport, TransportConnection, TransportError,
    TransportEvent,
};
use crate::types::ErrorReason;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const PROTOCOL_VERSION: &str = "1.2";
const AGENT_STRING: &str = "ably-realtime-rs/0.1";
const HEARTBEAT_MARGIN: Duration = Duration::from_secs(10);
const DEFAULT_MAX_IDLE_INTERVAL: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

/// Low-level failures while talking to the socket.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl From<tungstenite::Error> for WireError {
    fn from(e: tungstenite::Error) -> Self {
        WireError::WebSocket(Box::new(e))
    }
}

impl WireError {
    fn transient(self, description: &str) -> TransportError {
        TransportError::Transient(
            ErrorReason::new(self.to_string(), description).with_code(error_code::DISCONNECTED),
        )
    }
}

fn error_or_unknown(error: Option<ErrorInfo>) -> ErrorInfo {
    error.unwrap_or_else(|| ErrorInfo {
        code: error_code::FAILED,
        status_code: None,
        message: "no error details from server".to_string(),
    })
}

fn classify(error: ErrorInfo, description: &str) -> TransportError {
    if error.is_retriable() {
        TransportError::Transient(error.into_reason(description))
    } else {
        TransportError::Fatal(error.into_reason(description))
    }
}

// ---------------------------------------------------------------------------
// WebSocket URL construction
// ---------------------------------------------------------------------------

pub(crate) fn build_ws_url(request: &ConnectRequest) -> Result<String, WireError> {
    let scheme = if request.tls { "wss" } else { "ws" };
    let mut u = url::Url::parse(&format!("{scheme}://{}/", request.realtime_host))?;
    {
        let mut q = u.query_pairs_mut();
        q.append_pair("format", "msgpack");
        q.append_pair("v", PROTOCOL_VERSION);
        q.append_pair("agent", AGENT_STRING);
        q.append_pair("heartbeats", "true");
        q.append_pair("echo", if request.echo_messages { "true" } else { "false" });
        if let Some(client_id) = &request.client_id {
            q.append_pair("clientId", client_id);
        }
        if let Some(key) = &request.key {
            q.append_pair("key", key);
        }
        if let Some(token) = &request.token {
            q.append_pair("access_token", token);
        }
        let (param, point) = match &request.continuation {
            Continuation::Fresh => ("", None),
            Continuation::Recover(p) => ("recover", Some(p)),
            Continuation::Resume(p) => ("resume", Some(p)),
        };
        if let Some(point) = point {
            q.append_pair(param, &point.connection_key);
            // -1 tells the service nothing has been received yet.
            let serial = point
                .connection_serial
                .map_or_else(|| "-1".to_string(), |s| s.to_string());
            q.append_pair("connectionSerial", &serial);
        }
    }
    Ok(u.to_string())
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn wait_for_connected(ws_read: &mut WsRead) -> Result<ProtocolMessage, TransportError> {
    while let Some(frame) = ws_read.next().await {
        let frame = frame.map_err(|e| WireError::from(e).transient("handshake"))?;
        let tungstenite::Message::Binary(data) = frame else {
            continue;
        };
        let msg = match decode_msg(&data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Failed to decode handshake frame: {e}");
                continue;
            }
        };
        match msg.action {
            action::CONNECTED => return Ok(msg),
            action::ERROR => {
                // A connection-level ERROR without details is still final.
                return Err(match msg.error {
                    Some(err) => classify(err, "handshake rejected"),
                    None => TransportError::Fatal(
                        error_or_unknown(None).into_reason("handshake rejected"),
                    ),
                });
            }
            action::DISCONNECTED => {
                return Err(classify(error_or_unknown(msg.error), "handshake rejected"));
            }
            _ => {
                tracing::debug!(action = msg.action, "Ignoring pre-CONNECTED message");
            }
        }
    }
    Err(TransportError::Transient(
        ErrorReason::new("Connection closed before CONNECTED received", "handshake")
            .with_code(error_code::DISCONNECTED),
    ))
}

fn handshake_from(msg: &ProtocolMessage) -> Result<Handshake, TransportError> {
    let connection_key = msg.connection_key().ok_or_else(|| {
        TransportError::Fatal(
            ErrorReason::new("CONNECTED carried no connection key", "handshake")
                .with_code(error_code::FAILED),
        )
    })?;
    let max_idle_interval = msg
        .connection_details
        .as_ref()
        .and_then(|d| d.max_idle_interval)
        .map(|ms| Duration::from_millis(ms.max(0).unsigned_abs()));
    Ok(Handshake {
        connection_id: msg.connection_id.clone(),
        connection_key: connection_key.to_string(),
        connection_serial: msg.serial(),
        max_idle_interval,
        error: msg
            .error
            .clone()
            .map(|e| e.into_reason("requested continuation not honoured")),
    })
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Connects to `wss://<realtime_host>/` (or `ws://` without TLS).
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<(Handshake, Box<dyn TransportConnection>), TransportError> {
        let url = build_ws_url(request).map_err(|e| {
            TransportError::Fatal(
                ErrorReason::new(e.to_string(), "invalid realtime endpoint")
                    .with_code(error_code::BAD_REQUEST),
            )
        })?;
        tracing::debug!(host = %request.realtime_host, "Opening WebSocket");

        let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| WireError::from(e).transient("connect"))?;
        let (ws_write, mut ws_read) = ws.split();

        let connected = wait_for_connected(&mut ws_read).await?;
        let handshake = handshake_from(&connected)?;
        let idle_timeout =
            handshake.max_idle_interval.unwrap_or(DEFAULT_MAX_IDLE_INTERVAL) + HEARTBEAT_MARGIN;

        Ok((
            handshake,
            Box::new(WsConnection {
                ws_read,
                ws_write,
                idle_timeout,
                last_activity: Instant::now(),
            }),
        ))
    }
}

// ---------------------------------------------------------------------------
// Live connection
// ---------------------------------------------------------------------------

struct WsConnection {
    ws_read: WsRead,
    ws_write: WsWrite,
    idle_timeout: Duration,
    last_activity: Instant,
}

fn handle_message(msg: ProtocolMessage) -> Option<TransportEvent> {
    match msg.action {
        action::HEARTBEAT => {
            tracing::trace!("Heartbeat received");
            None
        }
        action::MESSAGE => msg.serial().map(TransportEvent::Serial),
        action::DISCONNECTED => Some(match msg.error {
            Some(err) if !err.is_retriable() => {
                TransportEvent::Failed(err.into_reason("service disconnected"))
            }
            other => {
                TransportEvent::Disconnected(other.map(|e| e.into_reason("service disconnected")))
            }
        }),
        action::ERROR if msg.channel.is_some() => {
            tracing::debug!(channel = ?msg.channel, "Ignoring channel-scoped error");
            None
        }
        action::ERROR => Some(TransportEvent::Failed(
            error_or_unknown(msg.error).into_reason("service error"),
        )),
        action::CLOSED => Some(TransportEvent::Closed),
        _ => {
            tracing::debug!(action = msg.action, "Ignoring action");
            None
        }
    }
}

#[async_trait]
impl TransportConnection for WsConnection {
    async fn next_event(&mut self) -> TransportEvent {
        loop {
            let idle_deadline = self.last_activity + self.idle_timeout;
            tokio::select! {
                frame = self.ws_read.next() => {
                    self.last_activity = Instant::now();
                    match frame {
                        Some(Ok(tungstenite::Message::Binary(data))) => match decode_msg(&data) {
                            Ok(msg) => {
                                if let Some(event) = handle_message(msg) {
                                    return event;
                                }
                            }
                            Err(e) => tracing::warn!("Failed to decode message: {e}"),
                        },
                        Some(Ok(_)) => {
                            // Ignore text, ping, pong frames
                        }
                        Some(Err(e)) => {
                            tracing::warn!("WebSocket error: {e}");
                            let reason = ErrorReason::new(e.to_string(), "transport error")
                                .with_code(error_code::DISCONNECTED);
                            return TransportEvent::Disconnected(Some(reason));
                        }
                        None => {
                            tracing::info!("WebSocket stream ended");
                            return TransportEvent::Disconnected(None);
                        }
                    }
                }

                _ = tokio::time::sleep_until(idle_deadline) => {
                    tracing::warn!("Heartbeat timeout");
                    let reason = ErrorReason::new("No activity seen from realtime", "heartbeat timeout")
                        .with_code(error_code::DISCONNECTED);
                    return TransportEvent::Disconnected(Some(reason));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let data = encode_msg(&ProtocolMessage::new(action::CLOSE))
            .map_err(|e| WireError::from(e).transient("close"))?;
        self.ws_write
            .send(tungstenite::Message::Binary(data.into()))
            .await
            .map_err(|e| WireError::from(e).transient("close"))?;

        while let Some(frame) = self.ws_read.next().await {
            match frame {
                Ok(tungstenite::Message::Binary(data)) => {
                    if decode_msg(&data).is_ok_and(|m| m.action == action::CLOSED) {
                        let _ = self.ws_write.close().await;
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(WireError::from(e).transient("close")),
            }
        }
        // Stream ended without CLOSED; the socket is gone either way.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
