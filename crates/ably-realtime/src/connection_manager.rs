//! Connection lifecycle policy: when and where to connect, retry, resume or
//! give up, plus the outgoing and pending-ack queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::Error;
use crate::auth::{PROTOCOL_VERSION, TOKEN_EXPIRY_BUFFER, now_ms, random_string};
use crate::connection::{
    ConnectionEvent, ConnectionSnapshot, ConnectionState, ConnectionStateChange,
};
use crate::deferred::Resolver;
use crate::event_emitter::EventEmitter;
use crate::event_loop::{Core, Input};
use crate::message_queue::{AckTarget, Envelope, MessageQueue};
use crate::options::{
    ClientOptions, DEFAULT_MAX_MESSAGE_SIZE, MAX_PROTOCOL_MESSAGE_BATCH_SIZE, TimingConfig,
};
use crate::protocol::{
    Action, AuthDetails, ConnectionDetails, ErrorInfo, ProtocolMessage, error_code,
};
use crate::recovery::RecoveryContext;
use crate::timers::TimerKey;
use crate::transport::{Transport, TransportEvent, TransportParams, TransportSink};
use crate::types::{TokenDetails, TokenParams};

const AGENT_STRING: &str = concat!("ably-realtime-rs/", env!("CARGO_PKG_VERSION"));
const LIB_VERSION: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));
const PING_ID_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Host selection
// ---------------------------------------------------------------------------

/// Primary host first; once retries reach the fallback threshold, a fallback
/// picked from a shuffled list, kept until it fails.
#[derive(Debug)]
pub(crate) struct HostSelector {
    primary: String,
    fallbacks: Vec<String>,
    untried: Vec<String>,
    current: Option<String>,
}

impl HostSelector {
    pub(crate) fn new(primary: String, fallbacks: Vec<String>) -> Self {
        let mut selector = HostSelector {
            primary,
            fallbacks,
            untried: Vec::new(),
            current: None,
        };
        selector.reset();
        selector
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
        self.untried = self.fallbacks.clone();
        self.untried.shuffle(&mut rand::thread_rng());
    }

    pub(crate) fn select(&mut self, use_fallback: bool) -> String {
        if !use_fallback || self.fallbacks.is_empty() {
            return self.primary.clone();
        }
        if let Some(host) = &self.current {
            return host.clone();
        }
        if self.untried.is_empty() {
            self.reset();
        }
        match self.untried.pop() {
            Some(host) => {
                self.current = Some(host.clone());
                host
            }
            None => self.primary.clone(),
        }
    }

    pub(crate) fn host_failed(&mut self, host: &str) {
        if self.current.as_deref() == Some(host) {
            tracing::debug!(host, "Fallback host failed");
            self.current = None;
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket URL construction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectMode {
    Fresh,
    /// Continue the previous connection of this client.
    Resume { key: String, serial: Option<i64> },
    /// Continue a connection from a recovery key.
    Recover { key: String, serial: Option<i64> },
}

impl ConnectMode {
    fn as_str(&self) -> &'static str {
        match self {
            ConnectMode::Fresh => "fresh",
            ConnectMode::Resume { .. } => "resume",
            ConnectMode::Recover { .. } => "recover",
        }
    }
}

pub(crate) fn build_ws_url(
    options: &ClientOptions,
    host: &str,
    auth_params: &[(String, String)],
    mode: &ConnectMode,
) -> Result<url::Url, Error> {
    let scheme = if options.tls { "wss" } else { "ws" };
    let authority = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{}", options.port())
    };
    let mut u = url::Url::parse(&format!("{scheme}://{authority}/"))?;
    {
        let mut q = u.query_pairs_mut();
        for (name, value) in auth_params {
            q.append_pair(name, value);
        }
        q.append_pair("format", options.format.as_str());
        q.append_pair("echo", if options.echo_messages { "true" } else { "false" });
        q.append_pair("v", PROTOCOL_VERSION);
        q.append_pair("lib", LIB_VERSION);
        q.append_pair("agent", AGENT_STRING);
        q.append_pair("heartbeats", "true");
        if let Some(client_id) = &options.client_id {
            q.append_pair("clientId", client_id);
        }
        match mode {
            ConnectMode::Fresh => {}
            ConnectMode::Resume { key, serial } => {
                q.append_pair("resume", key);
                if let Some(serial) = serial {
                    q.append_pair("connection_serial", &serial.to_string());
                }
            }
            ConnectMode::Recover { key, serial } => {
                q.append_pair("recover", key);
                if let Some(serial) = serial {
                    q.append_pair("connectionSerial", &serial.to_string());
                }
            }
        }
        let mut extra: Vec<_> = options.transport_params.iter().collect();
        extra.sort();
        for (name, value) in extra {
            q.append_pair(name, value);
        }
    }
    Ok(u)
}

/// Mirrors ably-js `isRetriable()` from `connectionerrors.ts`.
///
/// An error is retriable when it has no status code, is a server error (5xx),
/// or carries a well-known connection error code even at 4xx.
pub(crate) fn is_retriable(err: &ErrorInfo) -> bool {
    const CONNECTION_ERROR_CODES: &[i32] = &[
        80003, // DISCONNECTED
        80002, // SUSPENDED
        80000, // FAILED
        80017, // CLOSING / CLOSED
        50002, // UNKNOWN_CONNECTION_ERR
        50001, // UNKNOWN_CHANNEL_ERR
    ];
    match err.status_code {
        None => true,
        Some(sc) if sc >= 500 => true,
        Some(_) => CONNECTION_ERROR_CODES.contains(&err.code),
    }
}

fn millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Consecutive failed attempts in the current retry state.
#[derive(Debug, Default)]
struct RetryState {
    kind: Option<ConnectionState>,
    attempts: u32,
}

impl RetryState {
    fn record(&mut self, kind: ConnectionState) -> u32 {
        if self.kind != Some(kind) {
            self.kind = Some(kind);
            self.attempts = 0;
        }
        self.attempts += 1;
        self.attempts
    }

    fn use_fallback(&self) -> bool {
        self.attempts >= 2
    }

    fn reset(&mut self) {
        *self = RetryState::default();
    }
}

pub(crate) struct ConnectionCore {
    pub(crate) state: crate::state_machine::StateMachine<ConnectionState>,
    pub(crate) id: Option<String>,
    pub(crate) key: Option<String>,
    pub(crate) serial: Option<i64>,
    /// Last serial handed to an ack-required envelope. Never reset.
    pub(crate) msg_serial: i64,
    pub(crate) details: Option<ConnectionDetails>,
    pub(crate) error_reason: Option<ErrorInfo>,
    /// Identity confirmed by the server or the current token.
    pub(crate) client_id: Option<String>,
    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) generation: u64,
    /// Frames that raced ahead of the transport handle.
    early_events: Vec<TransportEvent>,
    pub(crate) queue: MessageQueue,
    hosts: HostSelector,
    current_host: Option<String>,
    attempt_mode: ConnectMode,
    retry: RetryState,
    disconnected_since: Option<Instant>,
    renewed_this_cycle: bool,
    token_fetch_in_flight: bool,
    awaiting_token: bool,
    pub(crate) connection_state_ttl: Duration,
    pub(crate) max_idle_interval: Duration,
    pub(crate) max_message_size: usize,
    last_activity: Instant,
    recover: Option<RecoveryContext>,
    pub(crate) emitter: EventEmitter<ConnectionEvent, ConnectionStateChange>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    close_waiters: Vec<Resolver<()>>,
    pings: HashMap<String, (Instant, Resolver<Duration>)>,
    authorize_waiters: Vec<Resolver<TokenDetails>>,
    grace: HashMap<u64, (Vec<Envelope>, ErrorInfo)>,
    next_grace_id: u64,
}

impl ConnectionCore {
    pub(crate) fn new(
        options: &ClientOptions,
        recover: Option<RecoveryContext>,
        snapshot_tx: watch::Sender<ConnectionSnapshot>,
    ) -> Self {
        ConnectionCore {
            state: crate::state_machine::StateMachine::new(
                "connection",
                ConnectionState::Initialized,
            ),
            id: None,
            key: None,
            serial: None,
            msg_serial: recover.as_ref().map_or(-1, |ctx| ctx.msg_serial),
            details: None,
            error_reason: None,
            client_id: None,
            transport: None,
            generation: 0,
            early_events: Vec::new(),
            queue: MessageQueue::default(),
            hosts: HostSelector::new(options.primary_realtime_host(), options.fallback_host_list()),
            current_host: None,
            attempt_mode: ConnectMode::Fresh,
            retry: RetryState::default(),
            disconnected_since: None,
            renewed_this_cycle: false,
            token_fetch_in_flight: false,
            awaiting_token: false,
            connection_state_ttl: options.timing.connection_state_ttl,
            max_idle_interval: options.timing.max_idle_interval,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            last_activity: Instant::now(),
            recover,
            emitter: EventEmitter::default(),
            snapshot_tx,
            close_waiters: Vec::new(),
            pings: HashMap::new(),
            authorize_waiters: Vec::new(),
            grace: HashMap::new(),
            next_grace_id: 0,
        }
    }

    /// Any frame from the server counts as liveness.
    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn publish_snapshot(&self) {
        let next = ConnectionSnapshot {
            state: self.state.current(),
            id: self.id.clone(),
            key: self.key.clone(),
            serial: self.serial,
            msg_serial: self.msg_serial,
            error_reason: self.error_reason.clone(),
            details: self.details.clone(),
            client_id: self.client_id.clone(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn can_resume(&self) -> bool {
        self.key.is_some()
            && self
                .disconnected_since
                .is_none_or(|since| since.elapsed() < self.connection_state_ttl)
    }

    fn connect_mode(&self) -> ConnectMode {
        if let Some(key) = &self.key
            && self.can_resume()
        {
            return ConnectMode::Resume {
                key: key.clone(),
                serial: self.serial,
            };
        }
        if let Some(ctx) = &self.recover {
            return ConnectMode::Recover {
                key: ctx.connection_key.clone(),
                serial: ctx.connection_serial,
            };
        }
        ConnectMode::Fresh
    }

    fn apply_details(&mut self, details: &ConnectionDetails, timing: &TimingConfig) {
        self.connection_state_ttl = details
            .connection_state_ttl
            .and_then(millis)
            .unwrap_or(timing.connection_state_ttl);
        self.max_idle_interval = details
            .max_idle_interval
            .and_then(millis)
            .unwrap_or(timing.max_idle_interval);
        self.max_message_size = details
            .max_message_size
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);
        if let Some(client_id) = &details.client_id {
            self.client_id = Some(client_id.clone());
        }
        self.details = Some(details.clone());
    }

    /// Why an operation that needs a live connection cannot proceed now.
    pub(crate) fn state_error(&self) -> ErrorInfo {
        let state = self.state.current();
        let message = format!("connection is {state}");
        match state {
            ConnectionState::Suspended => ErrorInfo::new(error_code::SUSPENDED, None, message),
            ConnectionState::Closing | ConnectionState::Closed => {
                ErrorInfo::new(error_code::CLOSED, None, message)
            }
            ConnectionState::Failed => self
                .error_reason
                .clone()
                .unwrap_or_else(|| ErrorInfo::new(error_code::FAILED, None, message)),
            _ => ErrorInfo::new(error_code::DISCONNECTED, None, message),
        }
    }

    fn clear_identity(&mut self) {
        self.id = None;
        self.key = None;
        self.disconnected_since = None;
        self.awaiting_token = false;
        self.retry.reset();
    }
}

// ---------------------------------------------------------------------------
// Connection operations and event handling
// ---------------------------------------------------------------------------

impl Core {
    pub(crate) fn connect(&mut self) {
        use ConnectionState::*;
        let state = self.conn.state.current();
        match state {
            Connecting | Connected | Closing => {
                tracing::debug!(%state, "connect() ignored");
            }
            Disconnected | Suspended => {
                self.timers.cancel(&TimerKey::ConnectionRetry);
                self.start_connecting();
            }
            Initialized | Closed | Failed => {
                self.conn.retry.reset();
                self.conn.hosts.reset();
                self.conn.disconnected_since = None;
                self.conn.renewed_this_cycle = false;
                self.start_connecting();
            }
        }
    }

    fn start_connecting(&mut self) {
        if self.transition_connection(ConnectionState::Connecting, None, None) {
            self.begin_attempt();
        }
    }

    fn begin_attempt(&mut self) {
        self.drop_transport();
        self.conn.generation += 1;
        self.timers.schedule(
            TimerKey::ConnectionOpen,
            self.options.timing.realtime_request_timeout,
        );
        match self.auth.auth_params(self.options.tls) {
            Ok(Some(params)) => self.open_transport(params),
            Ok(None) => {
                self.conn.awaiting_token = true;
                self.fetch_token(None);
            }
            Err(e) => self.fail_connection(e.info()),
        }
    }

    fn open_transport(&mut self, auth_params: Vec<(String, String)>) {
        let host = self.conn.hosts.select(self.conn.retry.use_fallback());
        let mode = self.conn.connect_mode();
        let url = match build_ws_url(&self.options, &host, &auth_params, &mode) {
            Ok(url) => url,
            Err(e) => {
                self.fail_connection(e.info());
                return;
            }
        };
        tracing::info!(%host, mode = mode.as_str(), "Opening connection");
        self.conn.attempt_mode = mode;
        self.conn.current_host = Some(host.clone());

        let generation = self.conn.generation;
        let params = TransportParams {
            url,
            host,
            format: self.options.format,
        };
        let sink = TransportSink::new(generation, self.input_tx.clone());
        let factory = Arc::clone(&self.options.transport_factory);
        let tx = self.input_tx.clone();
        tokio::spawn(async move {
            let result = factory.connect(params, sink).await;
            let _ = tx.send(Input::TransportOpened { generation, result });
        });
    }

    pub(crate) fn on_transport_opened(
        &mut self,
        generation: u64,
        result: Result<Box<dyn Transport>, Error>,
    ) {
        if generation != self.conn.generation
            || !self.conn.state.is(&[ConnectionState::Connecting])
        {
            if let Ok(mut transport) = result {
                tracing::debug!(generation, "Discarding transport from an abandoned attempt");
                transport.disconnect();
            }
            return;
        }
        match result {
            Ok(transport) => {
                tracing::debug!("Transport open, waiting for CONNECTED");
                self.conn.transport = Some(transport);
                self.conn.touch();
                for event in std::mem::take(&mut self.conn.early_events) {
                    self.on_transport_event(generation, event);
                }
            }
            Err(e) => {
                tracing::warn!("Transport connect failed: {e}");
                self.on_transport_failure(e.info());
            }
        }
    }

    pub(crate) fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.conn.generation {
            tracing::trace!(generation, "Ignoring event from a stale transport");
            return;
        }
        if self.conn.transport.is_none() {
            if self.conn.state.is(&[ConnectionState::Connecting]) {
                self.conn.early_events.push(event);
            }
            return;
        }
        match event {
            TransportEvent::Message(msg) => self.on_protocol_message(msg),
            TransportEvent::Closed(reason) => {
                self.conn.transport = None;
                let reason = reason.unwrap_or_else(|| {
                    ErrorInfo::new(error_code::DISCONNECTED, None, "connection closed unexpectedly")
                });
                self.on_transport_failure(reason);
            }
        }
    }

    pub(crate) fn drop_transport(&mut self) {
        if let Some(mut transport) = self.conn.transport.take() {
            transport.disconnect();
        }
        self.conn.early_events.clear();
    }

    fn cancel_connection_timers(&mut self) {
        for key in [
            TimerKey::ConnectionRetry,
            TimerKey::ConnectionOpen,
            TimerKey::Liveness,
            TimerKey::CloseAck,
            TimerKey::TokenRenewal,
        ] {
            self.timers.cancel(&key);
        }
    }

    /// The transport is gone or unusable.
    pub(crate) fn on_transport_failure(&mut self, reason: ErrorInfo) {
        self.drop_transport();
        self.conn.awaiting_token = false;
        self.timers.cancel(&TimerKey::ConnectionOpen);
        self.timers.cancel(&TimerKey::Liveness);
        if let Some(host) = self.conn.current_host.take() {
            self.conn.hosts.host_failed(&host);
        }
        let state = self.conn.state.current();
        match state {
            ConnectionState::Closing => {
                self.finish_close(None);
                return;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
            _ => {
                tracing::debug!(%state, "Ignoring transport failure");
                return;
            }
        }
        if reason.is_token_error() {
            self.on_token_error(reason);
            return;
        }
        tracing::warn!(%reason, "Connection lost");
        self.retry_after_failure(reason);
    }

    /// `disconnected` while within the connection state TTL of the first
    /// failure, `suspended` after that.
    fn retry_after_failure(&mut self, reason: ErrorInfo) {
        let since = *self.conn.disconnected_since.get_or_insert_with(Instant::now);
        let target = if since.elapsed() >= self.conn.connection_state_ttl {
            ConnectionState::Suspended
        } else {
            ConnectionState::Disconnected
        };
        let attempts = self.conn.retry.record(target);
        let retry_in = if attempts <= 1 {
            Duration::ZERO
        } else if target == ConnectionState::Suspended {
            self.options.timing.suspended_retry_timeout
        } else {
            self.options.timing.disconnected_retry_timeout
        };
        tracing::info!(state = %target, attempts, ?retry_in, "Scheduling reconnect");
        if self.transition_connection(target, Some(reason), Some(retry_in)) {
            self.timers.schedule(TimerKey::ConnectionRetry, retry_in);
        }
    }

    pub(crate) fn on_retry_timer(&mut self) {
        if self
            .conn
            .state
            .is(&[ConnectionState::Disconnected, ConnectionState::Suspended])
        {
            self.start_connecting();
        }
    }

    pub(crate) fn on_connect_timeout(&mut self) {
        if self.conn.state.is(&[ConnectionState::Connecting]) {
            tracing::warn!("Connection attempt timed out");
            self.on_transport_failure(ErrorInfo::new(
                error_code::CONNECTION_TIMED_OUT,
                Some(408),
                "connection attempt timed out",
            ));
        }
    }

    fn schedule_liveness(&mut self) {
        let limit = self.conn.max_idle_interval + self.options.timing.realtime_request_timeout;
        self.timers.schedule(TimerKey::Liveness, limit);
    }

    pub(crate) fn on_liveness_timer(&mut self) {
        if !self.conn.state.is(&[ConnectionState::Connected]) {
            return;
        }
        let limit = self.conn.max_idle_interval + self.options.timing.realtime_request_timeout;
        let idle = self.conn.last_activity.elapsed();
        if idle >= limit {
            tracing::warn!(?idle, "Heartbeat timeout");
            self.on_transport_failure(ErrorInfo::new(
                error_code::DISCONNECTED,
                None,
                format!("no activity from server for {}ms", idle.as_millis()),
            ));
        } else {
            self.timers.schedule(TimerKey::Liveness, limit - idle);
        }
    }

    pub(crate) fn on_connected(&mut self, msg: ProtocolMessage) {
        self.timers.cancel(&TimerKey::ConnectionOpen);
        let details = msg.connection_details.clone().unwrap_or_default();
        self.conn.apply_details(&details, &self.options.timing);

        let already_connected = self.conn.state.is(&[ConnectionState::Connected]);
        let previous_id = self.conn.id.take();
        let mode = std::mem::replace(&mut self.conn.attempt_mode, ConnectMode::Fresh);
        let resumed = if already_connected {
            previous_id == msg.connection_id
        } else {
            match mode {
                ConnectMode::Fresh => false,
                ConnectMode::Resume { .. } => {
                    previous_id.is_some() && previous_id == msg.connection_id
                }
                ConnectMode::Recover { .. } => msg.error.is_none(),
            }
        };
        let had_previous = previous_id.is_some() || self.conn.recover.is_some();
        let continuity_lost = had_previous && !resumed;

        self.conn.id = msg.connection_id.clone();
        if let Some(key) = msg
            .connection_key
            .clone()
            .or_else(|| details.connection_key.clone())
        {
            self.conn.key = Some(key);
        }
        self.conn.recover = None;

        let reason = msg.error.clone();
        if already_connected {
            self.conn.error_reason = reason.clone();
            self.emit_connection_update(reason.clone());
        } else {
            self.conn.retry.reset();
            self.conn.disconnected_since = None;
            self.conn.renewed_this_cycle = false;
            self.conn.awaiting_token = false;
            self.transition_connection(ConnectionState::Connected, reason.clone(), None);
        }
        tracing::info!(
            connection_id = ?self.conn.id,
            resumed,
            continuity_lost,
            "Connected"
        );

        self.schedule_liveness();
        self.schedule_token_renewal();
        if continuity_lost {
            let err = reason.clone().unwrap_or_else(|| {
                ErrorInfo::new(error_code::UNABLE_TO_RECOVER, None, "connection continuity lost")
            });
            self.fail_after_continuity_loss(err);
        } else if resumed {
            self.conn.queue.requeue_pending();
        }
        self.channels_on_connected(continuity_lost, reason);
        self.flush_queue();
    }

    /// Queued and unacknowledged envelopes from the lost connection will never
    /// be answered. Those for channels that are still usable get a short grace
    /// period first.
    fn fail_after_continuity_loss(&mut self, err: ErrorInfo) {
        let mut held = Vec::new();
        for env in self.conn.queue.drain_all() {
            let channel_down = env
                .channel()
                .and_then(|name| self.channels.get(name))
                .is_none_or(|ch| ch.is_inactive());
            if channel_down {
                self.fail_envelope(env, &Error::Delivery(err.clone()));
            } else {
                held.push(env);
            }
        }
        if held.is_empty() {
            return;
        }
        self.conn.next_grace_id += 1;
        let id = self.conn.next_grace_id;
        self.conn.grace.insert(id, (held, err));
        self.timers
            .schedule(TimerKey::NackGrace(id), self.options.timing.nack_grace);
    }

    pub(crate) fn on_nack_grace(&mut self, id: u64) {
        if let Some((envelopes, err)) = self.conn.grace.remove(&id) {
            let err = Error::Delivery(err);
            for env in envelopes {
                self.fail_envelope(env, &err);
            }
        }
    }

    pub(crate) fn on_server_disconnected(&mut self, msg: ProtocolMessage) {
        let reason = msg.error.unwrap_or_else(|| {
            ErrorInfo::new(error_code::DISCONNECTED, None, "disconnected by server")
        });
        if !reason.is_token_error() && !is_retriable(&reason) {
            self.fail_connection(reason);
            return;
        }
        self.on_transport_failure(reason);
    }

    pub(crate) fn on_connection_error(&mut self, msg: ProtocolMessage) {
        let reason = msg.error.unwrap_or_else(|| {
            ErrorInfo::new(error_code::FAILED, None, "no error details from server")
        });
        if reason.is_token_error() {
            self.on_transport_failure(reason);
        } else {
            self.fail_connection(reason);
        }
    }

    pub(crate) fn on_closed(&mut self, msg: ProtocolMessage) {
        if !self.conn.state.is(&[ConnectionState::Closing]) {
            tracing::info!("Connection closed by server");
            self.transition_connection(ConnectionState::Closing, None, None);
        }
        self.finish_close(msg.error);
    }

    // -- Tokens ------------------------------------------------------------

    fn on_token_error(&mut self, reason: ErrorInfo) {
        self.auth.clear_token();
        if !self.auth.is_renewable() {
            self.fail_connection(ErrorInfo::new(
                error_code::NO_MEANS_TO_RENEW,
                Some(401),
                format!("token rejected and no means to renew it: {reason}"),
            ));
            return;
        }
        if self.conn.renewed_this_cycle {
            tracing::warn!(%reason, "Renewed token rejected again");
            self.retry_after_failure(reason);
            return;
        }
        tracing::info!(%reason, "Token rejected, renewing");
        self.conn.renewed_this_cycle = true;
        if self.transition_connection(
            ConnectionState::Disconnected,
            Some(reason),
            Some(Duration::ZERO),
        ) {
            self.timers.schedule(TimerKey::ConnectionRetry, Duration::ZERO);
        }
    }

    /// Request a token off-loop. Concurrent requests share one fetch.
    fn fetch_token(&mut self, params: Option<TokenParams>) {
        if self.conn.token_fetch_in_flight {
            tracing::debug!("Token request already in flight");
            return;
        }
        self.conn.token_fetch_in_flight = true;
        let auth = self.auth.clone();
        let tx = self.input_tx.clone();
        let timeout = self.options.timing.realtime_request_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, auth.request_token(params.as_ref())).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(ErrorInfo::new(
                    error_code::TIMEOUT,
                    Some(504),
                    "token request timed out",
                ))),
            };
            let _ = tx.send(Input::Token(result));
        });
    }

    pub(crate) fn on_token(&mut self, result: Result<TokenDetails, Error>) {
        self.conn.token_fetch_in_flight = false;
        let awaiting = std::mem::take(&mut self.conn.awaiting_token);
        let state = self.conn.state.current();
        match result {
            Ok(details) => {
                tracing::info!(expires = details.expires, "Token obtained");
                if let Some(client_id) = &details.client_id {
                    self.conn.client_id = Some(client_id.clone());
                }
                self.auth.set_token(details.clone());
                for waiter in std::mem::take(&mut self.conn.authorize_waiters) {
                    waiter.resolve(details.clone());
                }
                match state {
                    ConnectionState::Connecting if awaiting => {
                        match self.auth.auth_params(self.options.tls) {
                            Ok(Some(params)) => self.open_transport(params),
                            Ok(None) => self.fail_connection(ErrorInfo::new(
                                error_code::INVALID_CREDENTIALS,
                                Some(401),
                                "obtained token has already expired",
                            )),
                            Err(e) => self.fail_connection(e.info()),
                        }
                    }
                    ConnectionState::Connected => {
                        let mut msg = ProtocolMessage::new(Action::Auth);
                        msg.auth = Some(AuthDetails {
                            access_token: details.token,
                        });
                        self.send_protocol_message(msg, Vec::new());
                        self.schedule_token_renewal();
                    }
                    _ => {}
                }
            }
            Err(e) => {
                tracing::error!("Token request failed: {e}");
                for waiter in std::mem::take(&mut self.conn.authorize_waiters) {
                    waiter.reject(e.duplicate());
                }
                let info = e.info();
                let fatal = match state {
                    ConnectionState::Connecting => awaiting,
                    ConnectionState::Connected => info.status_code == Some(403),
                    _ => false,
                };
                if fatal {
                    self.fail_connection(info);
                }
            }
        }
    }

    pub(crate) fn authorize(&mut self, params: Option<TokenParams>, resolver: Resolver<TokenDetails>) {
        self.conn.authorize_waiters.push(resolver);
        if self.conn.token_fetch_in_flight {
            return;
        }
        tracing::info!("Explicit authorize requested");
        self.auth.clear_token();
        self.fetch_token(params);
    }

    pub(crate) fn on_server_auth(&mut self) {
        if !self.conn.state.is(&[ConnectionState::Connected]) {
            return;
        }
        tracing::info!("Server requested reauthentication");
        self.auth.clear_token();
        self.fetch_token(None);
    }

    fn schedule_token_renewal(&mut self) {
        self.timers.cancel(&TimerKey::TokenRenewal);
        let Some(token) = self.auth.token_details() else {
            return;
        };
        if token.expires <= 0 || !self.auth.is_renewable() {
            return;
        }
        let buffer_ms = i64::try_from(TOKEN_EXPIRY_BUFFER.as_millis()).unwrap_or(i64::MAX);
        let remaining = token.expires.saturating_sub(now_ms()).saturating_sub(buffer_ms);
        let after = millis(remaining).unwrap_or(Duration::ZERO);
        self.timers.schedule(TimerKey::TokenRenewal, after);
    }

    pub(crate) fn on_token_renewal_timer(&mut self) {
        if self.conn.state.is(&[ConnectionState::Connected]) {
            tracing::info!("Renewing token ahead of expiry");
            self.auth.clear_token();
            self.fetch_token(None);
        }
    }

    // -- Ping --------------------------------------------------------------

    pub(crate) fn ping(&mut self, resolver: Resolver<Duration>) {
        if !self.conn.state.is(&[ConnectionState::Connected]) {
            resolver.reject(Error::Connection(self.conn.state_error()));
            return;
        }
        let Some(transport) = self.conn.transport.as_mut() else {
            resolver.reject(Error::Connection(self.conn.state_error()));
            return;
        };
        let id = random_string(PING_ID_LEN);
        let mut msg = ProtocolMessage::new(Action::Heartbeat);
        msg.id = Some(id.clone());
        if let Err(e) = transport.send(&msg) {
            resolver.reject(e);
            return;
        }
        self.conn.pings.insert(id.clone(), (Instant::now(), resolver));
        self.timers.schedule(
            TimerKey::Ping(id),
            self.options.timing.realtime_request_timeout,
        );
    }

    pub(crate) fn on_heartbeat(&mut self, msg: &ProtocolMessage) {
        tracing::trace!("Heartbeat received");
        if let Some(id) = &msg.id
            && let Some((sent_at, resolver)) = self.conn.pings.remove(id)
        {
            self.timers.cancel(&TimerKey::Ping(id.clone()));
            resolver.resolve(sent_at.elapsed());
        }
    }

    pub(crate) fn on_ping_timeout(&mut self, id: &str) {
        if let Some((_, resolver)) = self.conn.pings.remove(id) {
            resolver.reject(Error::Timeout(ErrorInfo::new(
                error_code::TIMEOUT,
                Some(504),
                "no heartbeat response from server",
            )));
        }
    }

    fn reject_pings(&mut self, err: &Error) {
        for (id, (_, resolver)) in self.conn.pings.drain() {
            self.timers.cancel(&TimerKey::Ping(id));
            resolver.reject(err.duplicate());
        }
    }

    // -- Close and failure -------------------------------------------------

    pub(crate) fn close(&mut self, resolver: Resolver<()>) {
        use ConnectionState::*;
        match self.conn.state.current() {
            Closed | Failed => resolver.resolve(()),
            Closing => self.conn.close_waiters.push(resolver),
            Connected => {
                self.conn.close_waiters.push(resolver);
                self.transition_connection(Closing, None, None);
                if let Some(transport) = self.conn.transport.as_mut()
                    && let Err(e) = transport.send(&ProtocolMessage::new(Action::Close))
                {
                    tracing::warn!("Failed to send CLOSE: {e}");
                }
                self.timers.schedule(
                    TimerKey::CloseAck,
                    self.options.timing.realtime_request_timeout,
                );
            }
            Initialized | Connecting | Disconnected | Suspended => {
                self.conn.close_waiters.push(resolver);
                self.transition_connection(Closing, None, None);
                self.finish_close(None);
            }
        }
    }

    pub(crate) fn on_close_timeout(&mut self) {
        if self.conn.state.is(&[ConnectionState::Closing]) {
            tracing::warn!("No CLOSED from server, closing locally");
            self.finish_close(None);
        }
    }

    fn finish_close(&mut self, reason: Option<ErrorInfo>) {
        self.cancel_connection_timers();
        self.drop_transport();
        self.conn.clear_identity();
        self.transition_connection(ConnectionState::Closed, reason, None);
        let err = Error::Connection(ErrorInfo::new(error_code::CLOSED, None, "connection closed"));
        self.fail_all_queued(&err);
        self.reject_pings(&err);
        for waiter in std::mem::take(&mut self.conn.close_waiters) {
            waiter.resolve(());
        }
        tracing::info!("Connection closed");
    }

    pub(crate) fn fail_connection(&mut self, reason: ErrorInfo) {
        tracing::error!(%reason, "Connection failed");
        self.cancel_connection_timers();
        self.drop_transport();
        self.conn.clear_identity();
        self.transition_connection(ConnectionState::Failed, Some(reason.clone()), None);
        let err = Error::Connection(reason);
        self.fail_all_queued(&err);
        self.reject_pings(&err);
        for waiter in std::mem::take(&mut self.conn.close_waiters) {
            waiter.reject(err.duplicate());
        }
    }

    fn fail_all_queued(&mut self, err: &Error) {
        let mut envelopes = self.conn.queue.drain_all();
        for (_, (held, _)) in self.conn.grace.drain() {
            envelopes.extend(held);
        }
        for env in envelopes {
            self.fail_envelope(env, err);
        }
    }

    // -- State changes -----------------------------------------------------

    /// Apply a connection state change and its side effects. Returns `false`
    /// if the transition table does not allow it.
    pub(crate) fn transition_connection(
        &mut self,
        next: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) -> bool {
        let Some(previous) = self.conn.state.transition(next) else {
            return false;
        };
        if reason.is_some() || next == ConnectionState::Connected {
            self.conn.error_reason = reason.clone();
        }
        match &reason {
            Some(reason) => tracing::info!(from = %previous, to = %next, %reason, "Connection state changed"),
            None => tracing::info!(from = %previous, to = %next, "Connection state changed"),
        }
        self.conn.publish_snapshot();
        self.conn.emitter.emit(
            &ConnectionEvent::from(next),
            ConnectionStateChange {
                current: next,
                previous,
                event: ConnectionEvent::from(next),
                reason: reason.clone(),
                retry_in,
            },
        );
        self.timers
            .cancel_where(|key| matches!(key, TimerKey::ChannelRetry(_)));
        if next == ConnectionState::Suspended {
            let err = Error::Connection(ErrorInfo::new(
                error_code::SUSPENDED,
                None,
                "connection suspended",
            ));
            self.fail_all_queued(&err);
        }
        self.channels_on_connection_state(next, reason.as_ref());
        true
    }

    fn emit_connection_update(&mut self, reason: Option<ErrorInfo>) {
        let current = self.conn.state.current();
        self.conn.emitter.emit(
            &ConnectionEvent::Update,
            ConnectionStateChange {
                current,
                previous: current,
                event: ConnectionEvent::Update,
                reason,
                retry_in: None,
            },
        );
    }

    // -- Sending -----------------------------------------------------------

    /// `true` if a publish may be accepted now, either for immediate sending
    /// or for the outgoing queue.
    pub(crate) fn can_send_or_queue(&self) -> bool {
        use ConnectionState::*;
        match self.conn.state.current() {
            Connected => true,
            Initialized | Connecting | Disconnected => self.options.queue_messages,
            Suspended | Closing | Closed | Failed => false,
        }
    }

    /// The single entry point for outbound traffic.
    pub(crate) fn send_protocol_message(&mut self, msg: ProtocolMessage, targets: Vec<AckTarget>) {
        let env = Envelope::new(msg, targets);
        if self.conn.state.is(&[ConnectionState::Connected]) && self.conn.transport.is_some() {
            self.send_now(env);
            return;
        }
        if !env.msg.action.ack_required() {
            tracing::debug!(action = ?env.msg.action, "Not connected, not sending");
            return;
        }
        if self.can_send_or_queue() {
            self.conn.queue.push(
                env,
                MAX_PROTOCOL_MESSAGE_BATCH_SIZE,
                self.conn.max_message_size,
            );
            return;
        }
        let err = Error::Connection(self.conn.state_error());
        self.fail_envelope(env, &err);
    }

    fn send_now(&mut self, mut env: Envelope) {
        let ack_required = env.msg.action.ack_required();
        if ack_required && env.msg.msg_serial.is_none() {
            self.conn.msg_serial += 1;
            env.msg.msg_serial = Some(self.conn.msg_serial);
        }
        if let Some(id) = self.conn.id.as_deref() {
            env.msg.assign_ids(id);
        }
        if let Err(info) = env.msg.validate_for_send() {
            tracing::error!(%info, "Refusing to send invalid envelope");
            self.fail_envelope(env, &Error::Protocol(info));
            return;
        }
        let Some(transport) = self.conn.transport.as_mut() else {
            if ack_required {
                self.conn.queue.push(
                    env,
                    MAX_PROTOCOL_MESSAGE_BATCH_SIZE,
                    self.conn.max_message_size,
                );
            }
            return;
        };
        if let Err(e) = transport.send(&env.msg) {
            // The transport reports its own closure; the envelope waits for
            // resume or continuity-loss handling like any other pending one.
            tracing::warn!(action = ?env.msg.action, "Send failed: {e}");
        }
        if ack_required {
            self.conn.queue.push_pending(env);
        }
    }

    fn flush_queue(&mut self) {
        while self.conn.state.is(&[ConnectionState::Connected]) && self.conn.transport.is_some() {
            let Some(env) = self.conn.queue.pop_outgoing() else {
                break;
            };
            self.send_now(env);
        }
    }

    pub(crate) fn on_ack(&mut self, msg: &ProtocolMessage, nack: Option<ErrorInfo>) {
        let Some(serial) = msg.msg_serial else {
            tracing::warn!(action = ?msg.action, "Acknowledgement without msgSerial");
            return;
        };
        let settled = self.conn.queue.settle(serial, msg.count.unwrap_or(1));
        for env in settled.lost {
            tracing::warn!(serial = ?env.msg.msg_serial, "Message skipped by acknowledgement");
            self.fail_envelope(
                env,
                &Error::Delivery(ErrorInfo::new(
                    error_code::INTERNAL,
                    Some(500),
                    "message was not acknowledged by the server",
                )),
            );
        }
        for env in settled.matched {
            match &nack {
                Some(err) => self.fail_envelope(env, &Error::Delivery(err.clone())),
                None => self.ack_envelope(env),
            }
        }
    }

    fn ack_envelope(&mut self, env: Envelope) {
        for target in env.targets {
            match target {
                AckTarget::Caller(resolver) => resolver.resolve(()),
                // Local presence settles when the server echoes it back.
                AckTarget::LocalPresence { .. } | AckTarget::ReEnter { .. } => {}
            }
        }
    }

    pub(crate) fn fail_envelope(&mut self, env: Envelope, err: &Error) {
        for target in env.targets {
            match target {
                AckTarget::Caller(resolver) => resolver.reject(err.duplicate()),
                AckTarget::LocalPresence {
                    channel,
                    client_id,
                    action,
                } => self.fail_local_presence(&channel, &client_id, action, err),
                AckTarget::ReEnter { channel, client_id } => {
                    self.on_reenter_failed(&channel, &client_id, &err.info());
                }
            }
        }
    }

    /// The identity messages are published under, if known.
    pub(crate) fn identity(&self) -> Option<String> {
        self.conn
            .client_id
            .clone()
            .or_else(|| self.auth.client_id().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(url: &url::Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn url_carries_protocol_params() {
        let options = ClientOptions::with_key("app.key:secret").with_client_id("alice");
        let auth = vec![("key".to_string(), "app.key:secret".to_string())];
        let url = build_ws_url(&options, "realtime.ably.io", &auth, &ConnectMode::Fresh).unwrap();
        assert!(url.as_str().starts_with("wss://realtime.ably.io/"));
        let q = query(&url);
        assert_eq!(q["key"], "app.key:secret");
        assert_eq!(q["format"], "msgpack");
        assert_eq!(q["echo"], "true");
        assert_eq!(q["v"], PROTOCOL_VERSION);
        assert_eq!(q["heartbeats"], "true");
        assert_eq!(q["clientId"], "alice");
        assert!(q["lib"].starts_with("rust-"));
        assert!(!q.contains_key("resume"));
        assert!(!q.contains_key("recover"));
    }

    #[test]
    fn url_resume_and_recover_params() {
        let options = ClientOptions::with_token("tok").with_tls(false).with_port(8080);
        let auth = vec![("access_token".to_string(), "tok".to_string())];

        let resume = ConnectMode::Resume {
            key: "k1".into(),
            serial: Some(4),
        };
        let url = build_ws_url(&options, "localhost", &auth, &resume).unwrap();
        assert!(url.as_str().starts_with("ws://localhost:8080/"));
        let q = query(&url);
        assert_eq!(q["resume"], "k1");
        assert_eq!(q["connection_serial"], "4");

        let recover = ConnectMode::Recover {
            key: "k2".into(),
            serial: Some(9),
        };
        let q = query(&build_ws_url(&options, "localhost", &auth, &recover).unwrap());
        assert_eq!(q["recover"], "k2");
        assert_eq!(q["connectionSerial"], "9");
        assert!(!q.contains_key("resume"));
    }

    #[test]
    fn url_appends_transport_params() {
        let options = ClientOptions::with_token("tok").with_transport_param("remainPresentFor", "1000");
        let q = query(&build_ws_url(&options, "h", &[], &ConnectMode::Fresh).unwrap());
        assert_eq!(q["remainPresentFor"], "1000");
    }

    #[test]
    fn fallback_only_after_repeated_failures_and_sticky() {
        let mut hosts = HostSelector::new("primary".into(), vec!["a".into(), "b".into()]);
        assert_eq!(hosts.select(false), "primary");
        let first = hosts.select(true);
        assert_ne!(first, "primary");
        assert_eq!(hosts.select(true), first);

        hosts.host_failed(&first);
        let second = hosts.select(true);
        assert_ne!(second, first);

        hosts.host_failed(&second);
        let third = hosts.select(true);
        assert!(third == "a" || third == "b");
    }

    #[test]
    fn no_fallbacks_means_primary() {
        let mut hosts = HostSelector::new("custom".into(), Vec::new());
        assert_eq!(hosts.select(true), "custom");
    }

    #[test]
    fn retry_state_counts_per_state() {
        let mut retry = RetryState::default();
        assert_eq!(retry.record(ConnectionState::Disconnected), 1);
        assert!(!retry.use_fallback());
        assert_eq!(retry.record(ConnectionState::Disconnected), 2);
        assert!(retry.use_fallback());
        assert_eq!(retry.record(ConnectionState::Suspended), 1);
        retry.reset();
        assert_eq!(retry.attempts, 0);
    }

    #[test]
    fn is_retriable_no_status_code() {
        let err = ErrorInfo::new(12345, None, "");
        assert!(is_retriable(&err));
    }

    #[test]
    fn is_retriable_server_error() {
        let err = ErrorInfo::new(50000, Some(500), "");
        assert!(is_retriable(&err));
    }

    #[test]
    fn is_retriable_connection_error_code_with_4xx() {
        let err = ErrorInfo::new(80003, Some(400), "");
        assert!(is_retriable(&err));
    }

    #[test]
    fn is_retriable_auth_error_not_retriable() {
        let err = ErrorInfo::new(40142, Some(401), "");
        assert!(!is_retriable(&err));
    }

    #[test]
    fn is_retriable_rate_limit_not_retriable() {
        let err = ErrorInfo::new(42910, Some(429), "");
        assert!(!is_retriable(&err));
    }
}
