//! Client, timing and channel configuration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::Error;
use crate::protocol::{Format, error_code, flags};
use crate::transport::{TransportFactory, WebSocketTransportFactory};
use crate::types::{AuthCallback, TokenDetails, TokenFuture, TokenParams};

pub(crate) const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";
pub(crate) const DEFAULT_REST_HOST: &str = "rest.ably.io";
const DEFAULT_FALLBACK_HOSTS: [&str; 5] = [
    "a.ably-realtime.com",
    "b.ably-realtime.com",
    "c.ably-realtime.com",
    "d.ably-realtime.com",
    "e.ably-realtime.com",
];
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_536;
pub(crate) const MAX_PROTOCOL_MESSAGE_BATCH_SIZE: usize = 50;
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Timeouts and retry intervals. The defaults match Ably's published client
/// library defaults; tests shrink them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Bound on every request/response exchange: connect, attach, detach,
    /// close, ping and token requests.
    pub realtime_request_timeout: Duration,
    /// Pause between reconnect attempts while disconnected.
    pub disconnected_retry_timeout: Duration,
    /// Pause between reconnect attempts while suspended.
    pub suspended_retry_timeout: Duration,
    /// Pause before a suspended channel tries to attach again.
    pub channel_retry_timeout: Duration,
    /// How long connection state is kept for resume; the server may override.
    pub connection_state_ttl: Duration,
    /// Longest expected silence from the server; the server may override.
    pub max_idle_interval: Duration,
    /// Grace period before messages are failed after continuity loss.
    pub nack_grace: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            realtime_request_timeout: Duration::from_secs(10),
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            channel_retry_timeout: Duration::from_secs(15),
            connection_state_ttl: Duration::from_secs(120),
            max_idle_interval: Duration::from_secs(15),
            nack_grace: Duration::from_millis(100),
        }
    }
}

/// HTTP method used for `auth_url`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    #[default]
    Get,
    Post,
}

/// Configuration for a [`Realtime`](crate::Realtime) client.
///
/// Start from [`ClientOptions::with_key`], [`ClientOptions::with_token`],
/// [`ClientOptions::with_auth_callback`] or [`ClientOptions::with_auth_url`]
/// and refine with the `with_*` builder methods.
#[derive(Clone)]
pub struct ClientOptions {
    /// Full API key, `"{appId}.{keyId}:{secret}"`.
    pub key: Option<String>,
    pub token_details: Option<TokenDetails>,
    pub auth_callback: Option<AuthCallback>,
    pub auth_url: Option<String>,
    pub auth_method: AuthMethod,
    pub auth_headers: HashMap<String, String>,
    pub auth_params: HashMap<String, String>,
    /// Force token auth even when a key is configured.
    pub use_token_auth: bool,
    pub default_token_params: TokenParams,
    pub client_id: Option<String>,

    pub environment: Option<String>,
    pub realtime_host: Option<String>,
    pub rest_host: Option<String>,
    pub fallback_hosts: Option<Vec<String>>,
    pub port: Option<u16>,
    pub tls: bool,

    pub format: Format,
    pub echo_messages: bool,
    /// Queue publishes while the connection is initialized, connecting or
    /// disconnected instead of failing them.
    pub queue_messages: bool,
    pub auto_connect: bool,
    /// A recovery key or serialized recovery context from a previous client.
    pub recover: Option<String>,
    pub transport_params: HashMap<String, String>,
    pub timing: TimingConfig,
    /// Buffer size of every [`Subscription`](crate::Subscription).
    pub event_capacity: usize,
    pub transport_factory: Arc<dyn TransportFactory>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            key: None,
            token_details: None,
            auth_callback: None,
            auth_url: None,
            auth_method: AuthMethod::default(),
            auth_headers: HashMap::new(),
            auth_params: HashMap::new(),
            use_token_auth: false,
            default_token_params: TokenParams::default(),
            client_id: None,
            environment: None,
            realtime_host: None,
            rest_host: None,
            fallback_hosts: None,
            port: None,
            tls: true,
            format: Format::default(),
            echo_messages: true,
            queue_messages: true,
            auto_connect: true,
            recover: None,
            transport_params: HashMap::new(),
            timing: TimingConfig::default(),
            event_capacity: EVENT_CHANNEL_CAPACITY,
            transport_factory: Arc::new(WebSocketTransportFactory),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("key_name", &self.key.as_deref().and_then(|k| k.split(':').next()))
            .field("token", &self.token_details.as_ref().map(|_| "<redacted>"))
            .field("auth_callback", &self.auth_callback.is_some())
            .field("auth_url", &self.auth_url)
            .field("client_id", &self.client_id)
            .field("environment", &self.environment)
            .field("realtime_host", &self.realtime_host)
            .field("tls", &self.tls)
            .field("format", &self.format)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        ClientOptions {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        ClientOptions {
            token_details: Some(TokenDetails::from_token(token)),
            ..Default::default()
        }
    }

    pub fn with_token_details(details: TokenDetails) -> Self {
        ClientOptions {
            token_details: Some(details),
            ..Default::default()
        }
    }

    /// Obtain tokens from your own code. The callback may return a signed
    /// [`TokenRequest`](crate::TokenRequest), [`TokenDetails`] or a bare token.
    pub fn with_auth_callback<F>(callback: F) -> Self
    where
        F: Fn(TokenParams) -> TokenFuture + Send + Sync + 'static,
    {
        ClientOptions {
            auth_callback: Some(Arc::new(callback)),
            ..Default::default()
        }
    }

    pub fn with_auth_url(url: impl Into<String>) -> Self {
        ClientOptions {
            auth_url: Some(url.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn with_use_token_auth(mut self, use_token_auth: bool) -> Self {
        self.use_token_auth = use_token_auth;
        self
    }

    #[must_use]
    pub fn with_auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    #[must_use]
    pub fn with_auth_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_auth_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_default_token_params(mut self, params: TokenParams) -> Self {
        self.default_token_params = params;
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    #[must_use]
    pub fn with_realtime_host(mut self, host: impl Into<String>) -> Self {
        self.realtime_host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_rest_host(mut self, host: impl Into<String>) -> Self {
        self.rest_host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_fallback_hosts(mut self, hosts: Vec<String>) -> Self {
        self.fallback_hosts = Some(hosts);
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_echo_messages(mut self, echo: bool) -> Self {
        self.echo_messages = echo;
        self
    }

    #[must_use]
    pub fn with_queue_messages(mut self, queue: bool) -> Self {
        self.queue_messages = queue;
        self
    }

    #[must_use]
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    #[must_use]
    pub fn with_recover(mut self, recovery_key: impl Into<String>) -> Self {
        self.recover = Some(recovery_key.into());
        self
    }

    #[must_use]
    pub fn with_transport_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.transport_params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Reject inconsistent options before anything is started.
    pub fn validate(&self) -> Result<(), Error> {
        let has_token_source = self.token_details.is_some()
            || self.auth_callback.is_some()
            || self.auth_url.is_some();
        if self.key.is_none() && !has_token_source {
            return Err(Error::configuration(
                error_code::NO_CREDENTIALS,
                "no authentication options provided: set a key, token, auth callback or auth URL",
            ));
        }
        if let Some(key) = &self.key {
            match key.split_once(':') {
                Some((name, secret)) if !name.is_empty() && !secret.is_empty() => {}
                _ => {
                    return Err(Error::configuration(
                        error_code::INVALID_KEY,
                        "invalid key: expected \"{keyName}:{keySecret}\"",
                    ));
                }
            }
        }
        if self.auth_callback.is_some() && self.auth_url.is_some() {
            return Err(Error::configuration(
                error_code::BAD_REQUEST,
                "auth_callback and auth_url are mutually exclusive",
            ));
        }
        if self.client_id.as_deref() == Some("*") {
            return Err(Error::configuration(
                error_code::INVALID_CLIENT_ID,
                "the wildcard client id \"*\" cannot be used as a client's own identity",
            ));
        }
        if self.client_id.as_deref() == Some("") {
            return Err(Error::configuration(
                error_code::INVALID_CLIENT_ID,
                "client id must not be empty",
            ));
        }
        if self.environment.is_some() && (self.realtime_host.is_some() || self.rest_host.is_some()) {
            return Err(Error::configuration(
                error_code::BAD_REQUEST,
                "environment cannot be combined with a custom realtime or REST host",
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::configuration(
                error_code::INVALID_PARAMETER,
                "event_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    fn environment_prefix(&self) -> Option<&str> {
        self.environment
            .as_deref()
            .filter(|env| !env.is_empty() && *env != "production")
    }

    pub(crate) fn primary_realtime_host(&self) -> String {
        if let Some(host) = &self.realtime_host {
            return host.clone();
        }
        match self.environment_prefix() {
            Some(env) => format!("{env}-{DEFAULT_REALTIME_HOST}"),
            None => DEFAULT_REALTIME_HOST.to_string(),
        }
    }

    /// Explicit fallbacks win; a custom host without explicit fallbacks has
    /// none; otherwise the default list, prefixed by the environment if set.
    pub(crate) fn fallback_host_list(&self) -> Vec<String> {
        if let Some(hosts) = &self.fallback_hosts {
            return hosts.clone();
        }
        if self.realtime_host.is_some() {
            return Vec::new();
        }
        match self.environment_prefix() {
            Some(env) => ["a", "b", "c", "d", "e"]
                .iter()
                .map(|letter| format!("{env}-{letter}-fallback.ably-realtime.com"))
                .collect(),
            None => DEFAULT_FALLBACK_HOSTS.iter().map(|h| (*h).to_string()).collect(),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 443 } else { 80 })
    }

    /// Base URL of the REST API used for token exchange.
    pub(crate) fn rest_base_url(&self) -> String {
        let host = match (&self.rest_host, &self.realtime_host, self.environment_prefix()) {
            (Some(host), _, _) => host.clone(),
            (None, Some(host), _) => host.clone(),
            (None, None, Some(env)) => format!("{env}-{DEFAULT_REST_HOST}"),
            (None, None, None) => DEFAULT_REST_HOST.to_string(),
        };
        let scheme = if self.tls { "https" } else { "http" };
        match self.port {
            // A host that already names its port keeps it.
            Some(port) if !host.contains(':') => format!("{scheme}://{host}:{port}"),
            _ => format!("{scheme}://{host}"),
        }
    }
}

/// Channel operating modes requested on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    Presence,
    Publish,
    Subscribe,
    PresenceSubscribe,
}

impl ChannelMode {
    pub(crate) fn flag(self) -> i32 {
        match self {
            ChannelMode::Presence => flags::MODE_PRESENCE,
            ChannelMode::Publish => flags::MODE_PUBLISH,
            ChannelMode::Subscribe => flags::MODE_SUBSCRIBE,
            ChannelMode::PresenceSubscribe => flags::MODE_PRESENCE_SUBSCRIBE,
        }
    }
}

/// Per-channel options sent with every attach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Channel params such as `rewind`.
    pub params: HashMap<String, String>,
    /// Requested modes; empty means the server default (all).
    pub modes: Vec<ChannelMode>,
}

impl ChannelOptions {
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_modes(mut self, modes: Vec<ChannelMode>) -> Self {
        self.modes = modes;
        self
    }

    pub(crate) fn mode_flags(&self) -> i32 {
        self.modes.iter().fold(0, |acc, mode| acc | mode.flag())
    }
}
