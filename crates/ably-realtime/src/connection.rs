//! Connection state machine: lifecycle, retries, resumption, and identity.
//!
//! A [`Connection`] is a cheap handle. All transitions run on one background
//! driver task, which is also the only emitter of state changes; handles talk
//! to it over a command channel and read a shared snapshot. Because the
//! snapshot is updated before the event goes out, a handler always observes
//! the state it is being told about, and may call [`Connection::connect`] or
//! [`Connection::close`] without deadlocking.
//!
//! Handles hold only a weak end of the command channel. The single strong
//! end is the [`Lifeline`] owned by the client; dropping it closes the
//! transport, stops the driver and clears all listeners, even when a
//! listener still captures a handle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::events::{EventEmitter, ListenerId};
use crate::options::{ClientOptions, TimingConfig};
use crate::protocol::error_code;
use crate::recovery;
use crate::transport::{
    ConnectRequest, Continuation, Handshake, ResumePoint, Transport, TransportConnection,
    TransportEvent,
};
use crate::types::{
    ConnectionIdentity, ConnectionState, ConnectionStateChange, Error, ErrorReason, Result,
};

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Close,
}

/// Owning end of the command channel. The driver runs until it is dropped.
#[derive(Debug)]
pub(crate) struct Lifeline {
    _commands: mpsc::UnboundedSender<Command>,
}

struct Snapshot {
    state: ConnectionState,
    identity: Option<ConnectionIdentity>,
    /// Serial of the last message received; `None` until the first one.
    received_serial: Option<u64>,
    last_identity: Option<ConnectionIdentity>,
    connection_id: Option<String>,
    error_reason: Option<ErrorReason>,
}

struct Shared {
    snapshot: Mutex<Snapshot>,
    emitter: Arc<EventEmitter<ConnectionStateChange>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        // Only the driver writes, and never panics while holding the lock.
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one logical realtime connection.
///
/// Clones share the same connection but do not keep it alive: once the
/// owning [`RealtimeClient`](crate::RealtimeClient) is dropped, commands fail
/// with [`Error::DriverStopped`] and accessors report the final state.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Start the driver on the current tokio runtime. The connection stays
    /// `Initialized` until [`connect`](Self::connect).
    pub(crate) fn spawn(
        options: Arc<ClientOptions>,
        transport: Arc<dyn Transport>,
        emitter: Arc<EventEmitter<ConnectionStateChange>>,
    ) -> Result<(Self, Lifeline)> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let shared = Arc::new(Shared {
            snapshot: Mutex::new(Snapshot {
                state: ConnectionState::Initialized,
                identity: None,
                received_serial: None,
                last_identity: None,
                connection_id: None,
                error_reason: None,
            }),
            emitter,
        });
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            shared: Arc::clone(&shared),
            recover: options.recover.clone(),
            options,
            transport,
            commands: commands_rx,
            failed_attempts: 0,
            suspended: false,
            exiting: false,
        };
        runtime.spawn(driver.run());

        let handle = Self {
            shared,
            commands: commands.downgrade(),
        };
        Ok((handle, Lifeline { _commands: commands }))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .upgrade()
            .ok_or(Error::DriverStopped)?
            .send(command)
            .map_err(|_| Error::DriverStopped)
    }

    /// Schedule a connect attempt and return immediately.
    ///
    /// A no-op while `Connecting` or `Connected`; retries at once from
    /// `Disconnected` or `Suspended`. Fails with [`Error::InvalidState`] once
    /// the connection is closing, closed or failed. `Ok` means the request
    /// was queued: a `close()` queued earlier still wins, and the connect is
    /// then dropped with a warning.
    pub fn connect(&self) -> Result<()> {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
        ) {
            return Err(Error::InvalidState { state });
        }
        self.send(Command::Connect)
    }

    /// Request a graceful shutdown. Idempotent; always ends in `Closed`.
    pub fn close(&self) {
        if self.send(Command::Close).is_err() {
            tracing::debug!("Close requested after the connection driver stopped");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Current identity; unavailable before the first `Connected` and after
    /// `Closed` or `Failed`.
    pub fn identity(&self) -> Result<ConnectionIdentity> {
        self.shared
            .lock()
            .identity
            .clone()
            .ok_or(Error::IdentityUnavailable)
    }

    pub fn connection_key(&self) -> Result<String> {
        self.identity().map(|id| id.connection_key)
    }

    pub fn connection_serial(&self) -> Result<u64> {
        self.identity().map(|id| id.connection_serial)
    }

    /// Public connection id from the last handshake, if connected.
    pub fn connection_id(&self) -> Option<String> {
        self.shared.lock().connection_id.clone()
    }

    /// Recovery key for the current or last-known identity.
    pub fn recovery_key(&self) -> Result<String> {
        let snapshot = self.shared.lock();
        snapshot
            .identity
            .as_ref()
            .or(snapshot.last_identity.as_ref())
            .map(recovery::encode)
            .ok_or(Error::IdentityUnavailable)
    }

    pub fn error_reason(&self) -> Option<ErrorReason> {
        self.shared.lock().error_reason.clone()
    }

    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.shared.emitter.on(handler)
    }

    pub fn once<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.shared.emitter.once(handler)
    }

    /// Invoke `handler` every time the connection enters `state`.
    pub fn on_state<F>(&self, state: ConnectionState, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.shared
            .emitter
            .on_matching(move |change| change.current == state, handler)
    }

    /// Invoke `handler` the next time the connection enters `state`.
    pub fn once_state<F>(&self, state: ConnectionState, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.shared
            .emitter
            .once_matching(move |change| change.current == state, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.emitter.off(id)
    }

    /// Poll until the connection is in `target`, giving up after `timeout`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.state();
            if current == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout { target, current });
            }
            tokio::time::sleep(STATE_POLL_INTERVAL).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Delay before the next attempt after `failed_attempts` consecutive
/// failures while `Disconnected`: immediate after losing a live connection,
/// then exponential from `disconnected_retry_timeout` with up to 10% jitter.
fn disconnected_backoff(timing: &TimingConfig, failed_attempts: u32) -> Duration {
    if failed_attempts == 0 {
        return Duration::ZERO;
    }
    let exp = failed_attempts.saturating_sub(1).min(30);
    let backoff = timing
        .disconnected_retry_timeout
        .saturating_mul(1u32 << exp)
        .min(timing.max_retry_interval);
    // Subsecond nanos from the wall clock as non-deterministic jitter
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let spread_ms = u64::try_from(backoff.as_millis() / 10).unwrap_or(u64::MAX);
    backoff + Duration::from_millis(u64::from(nanos) % spread_ms.saturating_add(1))
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum Phase {
    /// Waiting for a command in `Initialized`, `Closed` or `Failed`.
    Idle,
    Attempt,
    Live(Box<dyn TransportConnection>),
    Backoff(Duration),
    Closing(Option<Box<dyn TransportConnection>>),
    Exit,
}

struct Driver {
    shared: Arc<Shared>,
    options: Arc<ClientOptions>,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Recovery key still to be presented; consumed by the first `Connected`.
    recover: Option<String>,
    failed_attempts: u32,
    suspended: bool,
    exiting: bool,
}

impl Driver {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Attempt => self.attempt().await,
                Phase::Live(conn) => self.live(conn).await,
                Phase::Backoff(delay) => self.backoff(delay).await,
                Phase::Closing(conn) => self.closing(conn).await,
                Phase::Exit => break,
            };
        }
        // Listeners may hold handles back into this connection.
        self.shared.emitter.off_all();
        tracing::debug!("Connection driver finished");
    }

    fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Apply `update` and the new state under one lock, then emit.
    fn transition_with(
        &self,
        to: ConnectionState,
        reason: Option<ErrorReason>,
        retry_in: Option<Duration>,
        update: impl FnOnce(&mut Snapshot),
    ) {
        let change = {
            let mut snapshot = self.shared.lock();
            update(&mut snapshot);
            let previous = snapshot.state;
            snapshot.state = to;
            if let Some(r) = &reason {
                snapshot.error_reason = Some(r.clone());
            }
            ConnectionStateChange {
                previous,
                current: to,
                reason,
                retry_in,
            }
        };
        match &change.reason {
            Some(reason) => tracing::info!(
                from = %change.previous,
                to = %change.current,
                code = ?reason.code,
                "Connection state changed: {reason}"
            ),
            None => tracing::info!(
                from = %change.previous,
                to = %change.current,
                "Connection state changed"
            ),
        }
        self.shared.emitter.emit(&change);
    }

    fn transition(&self, to: ConnectionState, reason: Option<ErrorReason>) {
        self.transition_with(to, reason, None, |_| {});
    }

    fn fail(&mut self, mut reason: ErrorReason) -> Phase {
        if reason.message.is_empty() {
            reason.message = "connection failed".to_string();
        }
        self.failed_attempts = 0;
        self.suspended = false;
        self.transition_with(ConnectionState::Failed, Some(reason), None, |s| {
            s.identity = None;
            s.received_serial = None;
            s.connection_id = None;
        });
        Phase::Idle
    }

    async fn idle(&mut self) -> Phase {
        match self.commands.recv().await {
            None => Phase::Exit,
            Some(Command::Connect) => match self.state() {
                ConnectionState::Initialized => Phase::Attempt,
                state => {
                    tracing::warn!(%state, "Dropping connect queued behind close or failure");
                    Phase::Idle
                }
            },
            Some(Command::Close) => match self.state() {
                ConnectionState::Initialized => Phase::Closing(None),
                ConnectionState::Failed => {
                    self.transition(ConnectionState::Closed, None);
                    Phase::Idle
                }
                _ => Phase::Idle,
            },
        }
    }

    fn continuation(&self) -> std::result::Result<Continuation, ErrorReason> {
        {
            let snapshot = self.shared.lock();
            if let Some(id) = &snapshot.identity {
                return Ok(Continuation::Resume(ResumePoint {
                    connection_key: id.connection_key.clone(),
                    connection_serial: snapshot.received_serial,
                }));
            }
        }
        match self.recover.as_deref() {
            None => Ok(Continuation::Fresh),
            Some(key) => recovery::decode(key)
                .map(|id| Continuation::Recover(id.into()))
                .map_err(|e| {
                    ErrorReason::new(format!("Invalid recovery key: {e}"), "recover option")
                        .with_code(error_code::INVALID_CONNECTION_KEY)
                        .with_status(Some(400))
                }),
        }
    }

    async fn attempt(&mut self) -> Phase {
        self.transition(ConnectionState::Connecting, None);

        let continuation = match self.continuation() {
            Ok(c) => c,
            Err(reason) => return self.fail(reason),
        };
        let request = ConnectRequest::new(&self.options, continuation);
        tracing::debug!(
            host = %request.realtime_host,
            attempt = self.failed_attempts + 1,
            continuation = ?request.continuation,
            "Connect attempt"
        );

        let transport = Arc::clone(&self.transport);
        let attempt = tokio::time::timeout(
            self.options.timing.connect_timeout,
            transport.connect(&request),
        );
        tokio::pin!(attempt);

        let outcome = loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => {}
                    // Dropping `attempt` cancels it.
                    Some(Command::Close) => return Phase::Closing(None),
                    None => {
                        self.exiting = true;
                        return Phase::Closing(None);
                    }
                },
                outcome = &mut attempt => break outcome,
            }
        };

        match outcome {
            Ok(Ok((handshake, conn))) => {
                self.connected(handshake, &request.continuation);
                Phase::Live(conn)
            }
            Ok(Err(err)) => {
                tracing::debug!(
                    retriable = err.is_retriable(),
                    "Connect attempt failed: {}",
                    err.reason()
                );
                if err.is_retriable() {
                    self.retry_later(err.into_reason())
                } else {
                    self.fail(err.into_reason())
                }
            }
            Err(_) => {
                tracing::warn!("Connect attempt timed out");
                let reason = ErrorReason::new(
                    format!(
                        "Connect attempt timed out after {:?}",
                        self.options.timing.connect_timeout
                    ),
                    "connect timeout",
                )
                .with_code(error_code::TIMEOUT);
                self.retry_later(reason)
            }
        }
    }

    fn connected(&mut self, handshake: Handshake, continuation: &Continuation) {
        let continued = continuation
            .resume_point()
            .filter(|p| p.connection_key == handshake.connection_key);
        if continuation.resume_point().is_some() && continued.is_none() {
            tracing::warn!(
                connection_key = %handshake.connection_key,
                "Service assigned a new connection instead of continuing"
            );
        }
        let received_serial = handshake
            .connection_serial
            .or(continued.and_then(|p| p.connection_serial));
        // The recovery key format has no "nothing received" marker.
        let identity =
            ConnectionIdentity::new(handshake.connection_key, received_serial.unwrap_or(0));

        self.recover = None;
        self.failed_attempts = 0;
        self.suspended = false;
        let connection_id = handshake.connection_id;
        self.transition_with(
            ConnectionState::Connected,
            handshake.error,
            None,
            move |s| {
                s.last_identity = Some(identity.clone());
                s.identity = Some(identity);
                s.received_serial = received_serial;
                s.connection_id = connection_id;
            },
        );
    }

    /// Route a transient failure to `Disconnected` or `Suspended`.
    fn retry_later(&mut self, reason: ErrorReason) -> Phase {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        let timing = &self.options.timing;
        if self.suspended || self.failed_attempts > timing.max_disconnected_retries {
            self.suspended = true;
            let delay = timing.suspended_retry_timeout;
            self.transition_with(ConnectionState::Suspended, Some(reason), Some(delay), |_| {});
            Phase::Backoff(delay)
        } else {
            let delay = disconnected_backoff(timing, self.failed_attempts);
            self.transition_with(
                ConnectionState::Disconnected,
                Some(reason),
                Some(delay),
                |_| {},
            );
            Phase::Backoff(delay)
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Phase {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => return Phase::Attempt,
                    Some(Command::Close) => return Phase::Closing(None),
                    None => {
                        self.exiting = true;
                        return Phase::Closing(None);
                    }
                },
                _ = &mut timer => return Phase::Attempt,
            }
        }
    }

    async fn live(&mut self, mut conn: Box<dyn TransportConnection>) -> Phase {
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => {}
                    Some(Command::Close) => return Phase::Closing(Some(conn)),
                    None => {
                        self.exiting = true;
                        return Phase::Closing(Some(conn));
                    }
                },
                event = conn.next_event() => match event {
                    TransportEvent::Serial(serial) => {
                        let mut guard = self.shared.lock();
                        let snapshot = &mut *guard;
                        if let Some(id) = snapshot.identity.as_mut()
                            && snapshot.received_serial.is_none_or(|last| serial > last)
                        {
                            snapshot.received_serial = Some(serial);
                            id.connection_serial = serial;
                            snapshot.last_identity = Some(id.clone());
                        }
                    }
                    TransportEvent::Disconnected(reason) => {
                        let reason = reason.unwrap_or_else(|| {
                            ErrorReason::new("Connection to server lost", "transport disconnected")
                                .with_code(error_code::DISCONNECTED)
                        });
                        let delay = disconnected_backoff(&self.options.timing, 0);
                        // Identity is kept for the resume request.
                        self.transition_with(
                            ConnectionState::Disconnected,
                            Some(reason),
                            Some(delay),
                            |_| {},
                        );
                        return Phase::Backoff(delay);
                    }
                    TransportEvent::Failed(reason) => return self.fail(reason),
                    TransportEvent::Closed => {
                        tracing::info!("Connection closed by server");
                        self.transition_with(ConnectionState::Closed, None, None, |s| {
                            s.identity = None;
                            s.received_serial = None;
                            s.connection_id = None;
                        });
                        return Phase::Idle;
                    }
                },
            }
        }
    }

    async fn closing(&mut self, conn: Option<Box<dyn TransportConnection>>) -> Phase {
        self.transition(ConnectionState::Closing, None);

        if let Some(mut conn) = conn {
            let timeout = self.options.timing.close_timeout;
            match tokio::time::timeout(timeout, conn.close()).await {
                Ok(Ok(())) => tracing::debug!("Close handshake completed"),
                Ok(Err(e)) => tracing::warn!("Close handshake failed: {e}"),
                Err(_) => tracing::warn!("Close handshake timed out after {timeout:?}"),
            }
        }

        self.failed_attempts = 0;
        self.suspended = false;
        self.transition_with(ConnectionState::Closed, None, None, |s| {
            s.identity = None;
            s.received_serial = None;
            s.connection_id = None;
        });

        if self.exiting {
            Phase::Exit
        } else {
            Phase::Idle
        }
    }
}
