//! Client options and retry timing.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::host::{Hosts, resolve_hosts};
use crate::types::{Error, Result};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISCONNECTED_RETRY_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_SUSPENDED_RETRY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_DISCONNECTED_RETRIES: u32 = 8; // ~1 min of backoff before suspending

/// Retry and timeout policy for the connection.
///
/// Durations are given in milliseconds when loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingConfig {
    /// Upper bound on a single connect attempt. Expiry counts as a
    /// transient failure.
    #[serde(deserialize_with = "millis")]
    pub connect_timeout: Duration,
    /// How long to wait for CLOSED after sending CLOSE.
    #[serde(deserialize_with = "millis")]
    pub close_timeout: Duration,
    /// First backoff after a failed attempt; doubles per failure.
    #[serde(deserialize_with = "millis")]
    pub disconnected_retry_timeout: Duration,
    #[serde(deserialize_with = "millis")]
    pub max_retry_interval: Duration,
    /// Failed attempts tolerated in `Disconnected` before `Suspended`.
    pub max_disconnected_retries: u32,
    #[serde(deserialize_with = "millis")]
    pub suspended_retry_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            disconnected_retry_timeout: DEFAULT_DISCONNECTED_RETRY_TIMEOUT,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
            max_disconnected_retries: DEFAULT_MAX_DISCONNECTED_RETRIES,
            suspended_retry_timeout: DEFAULT_SUSPENDED_RETRY_TIMEOUT,
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Options for a [`RealtimeClient`](crate::RealtimeClient).
///
/// The client takes ownership of its options; they cannot change once the
/// client exists. `rest_host` and `realtime_host` are derived from
/// `environment` and are rewritten whenever it is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Identity presented during the handshake.
    pub client_id: Option<String>,
    /// API key (`keyName:keySecret`), passed through to the transport.
    pub key: Option<String>,
    /// Access token, passed through to the transport.
    pub token: Option<String>,
    /// Connect as soon as the client is constructed.
    pub auto_connect: bool,
    /// Ask the service to echo our own messages back. Not interpreted here.
    pub echo_messages: bool,
    /// `wss://` when true, `ws://` otherwise.
    pub tls: bool,
    /// Recovery key from a previous connection, presented on the first
    /// connect attempt.
    pub recover: Option<String>,
    pub timing: TimingConfig,
    environment: Option<String>,
    hosts: Hosts,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            key: None,
            token: None,
            auto_connect: true,
            echo_messages: true,
            tls: true,
            recover: None,
            timing: TimingConfig::default(),
            environment: None,
            hosts: Hosts::default(),
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// Select a deployment environment, rewriting both hosts. An empty name
    /// restores the production defaults.
    pub fn set_environment(&mut self, environment: impl Into<String>) {
        let environment = environment.into();
        self.environment = (!environment.is_empty()).then_some(environment);
        self.hosts = resolve_hosts(self.environment.as_deref());
    }

    pub fn rest_host(&self) -> &str {
        &self.hosts.rest
    }

    pub fn realtime_host(&self) -> &str {
        &self.hosts.realtime
    }

    /// Override the REST host. A later [`set_environment`](Self::set_environment)
    /// replaces it.
    pub fn set_rest_host(&mut self, host: impl Into<String>) {
        self.hosts.rest = host.into();
    }

    /// Override the realtime host. A later [`set_environment`](Self::set_environment)
    /// replaces it.
    pub fn set_realtime_host(&mut self, host: impl Into<String>) {
        self.hosts.realtime = host.into();
    }

    /// Load options from JSON with camelCase keys, e.g.
    /// `{"clientId": "me", "environment": "sandbox", "autoConnect": false}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawOptions =
            serde_json::from_str(json).map_err(|e| Error::InvalidOptions(format!("parse: {e}")))?;
        let options = raw.into_options();
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        match self.client_id.as_deref() {
            Some("") => return Err(Error::InvalidOptions("clientId must not be empty".into())),
            Some("*") => {
                return Err(Error::InvalidOptions(
                    "clientId \"*\" is reserved for token wildcards".into(),
                ));
            }
            _ => {}
        }
        if let Some(key) = self.key.as_deref()
            && !key.contains(':')
        {
            return Err(Error::InvalidOptions(
                "key must be in format keyName:keySecret".into(),
            ));
        }
        if self.hosts.rest.is_empty() || self.hosts.realtime.is_empty() {
            return Err(Error::InvalidOptions("hosts must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawOptions {
    client_id: Option<String>,
    key: Option<String>,
    token: Option<String>,
    auto_connect: bool,
    echo_messages: bool,
    tls: bool,
    recover: Option<String>,
    environment: Option<String>,
    rest_host: Option<String>,
    realtime_host: Option<String>,
    timing: TimingConfig,
}

impl Default for RawOptions {
    fn default() -> Self {
        let defaults = ClientOptions::default();
        Self {
            client_id: None,
            key: None,
            token: None,
            auto_connect: defaults.auto_connect,
            echo_messages: defaults.echo_messages,
            tls: defaults.tls,
            recover: None,
            environment: None,
            rest_host: None,
            realtime_host: None,
            timing: defaults.timing,
        }
    }
}

impl RawOptions {
    fn into_options(self) -> ClientOptions {
        let mut options = ClientOptions {
            client_id: self.client_id,
            key: self.key,
            token: self.token,
            auto_connect: self.auto_connect,
            echo_messages: self.echo_messages,
            tls: self.tls,
            recover: self.recover,
            timing: self.timing,
            ..ClientOptions::default()
        };
        if let Some(host) = self.rest_host {
            options.set_rest_host(host);
        }
        if let Some(host) = self.realtime_host {
            options.set_realtime_host(host);
        }
        // Environment wins over explicit hosts.
        if let Some(env) = self.environment {
            options.set_environment(env);
        }
        options
    }
}
