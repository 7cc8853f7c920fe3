//! Public connection types and the [`Connection`] handle.

use std::collections::HashMap;
use std::fmt;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::Error;
use crate::channel::ChannelState;
use crate::channels::Registry;
use crate::deferred::Deferred;
use crate::event_emitter::Subscription;
use crate::event_loop::{Command, dispatch};
use crate::protocol::{ConnectionDetails, ErrorInfo, error_code};
use crate::recovery::RecoveryContext;
use crate::state_machine::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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

impl State for ConnectionState {
    fn transitions(self) -> &'static [Self] {
        use ConnectionState::*;
        match self {
            Initialized => &[Connecting, Closing],
            Connecting => &[Connected, Disconnected, Suspended, Closing, Failed],
            Connected => &[Disconnected, Suspended, Closing, Failed],
            Disconnected => &[Connecting, Suspended, Closing, Failed],
            Suspended => &[Connecting, Closing, Failed],
            Closing => &[Closed, Failed],
            Closed => &[Connecting],
            Failed => &[Connecting],
        }
    }
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
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the connection: one per state, plus `Update` for
/// changes that leave the state as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
    Update,
}

impl From<ConnectionState> for ConnectionEvent {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Initialized => ConnectionEvent::Initialized,
            ConnectionState::Connecting => ConnectionEvent::Connecting,
            ConnectionState::Connected => ConnectionEvent::Connected,
            ConnectionState::Disconnected => ConnectionEvent::Disconnected,
            ConnectionState::Suspended => ConnectionEvent::Suspended,
            ConnectionState::Closing => ConnectionEvent::Closing,
            ConnectionState::Closed => ConnectionEvent::Closed,
            ConnectionState::Failed => ConnectionEvent::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub current: ConnectionState,
    pub previous: ConnectionState,
    pub event: ConnectionEvent,
    pub reason: Option<ErrorInfo>,
    /// Delay before the next connection attempt, for `disconnected` and
    /// `suspended`.
    pub retry_in: Option<Duration>,
}

/// The loop's view of the connection as published to handles.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConnectionSnapshot {
    pub(crate) state: ConnectionState,
    pub(crate) id: Option<String>,
    pub(crate) key: Option<String>,
    pub(crate) serial: Option<i64>,
    pub(crate) msg_serial: i64,
    pub(crate) error_reason: Option<ErrorInfo>,
    pub(crate) details: Option<ConnectionDetails>,
    pub(crate) client_id: Option<String>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        ConnectionSnapshot {
            state: ConnectionState::Initialized,
            id: None,
            key: None,
            serial: None,
            msg_serial: -1,
            error_reason: None,
            details: None,
            client_id: None,
        }
    }
}

/// Handle to the client's single connection.
///
/// Accessors read the latest state published by the event loop; operations
/// are executed by the loop and return a [`Deferred`].
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    registry: Registry,
    capacity: usize,
}

impl Connection {
    pub(crate) fn new(
        cmd_tx: mpsc::UnboundedSender<Command>,
        snapshot: watch::Receiver<ConnectionSnapshot>,
        registry: Registry,
        capacity: usize,
    ) -> Self {
        Connection {
            cmd_tx,
            snapshot,
            registry,
            capacity,
        }
    }

    pub(crate) fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn id(&self) -> Option<String> {
        self.snapshot.borrow().id.clone()
    }

    /// Secret used to resume this connection.
    pub fn key(&self) -> Option<String> {
        self.snapshot.borrow().key.clone()
    }

    /// Last connection serial received from the server.
    pub fn serial(&self) -> Option<i64> {
        self.snapshot.borrow().serial
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.snapshot.borrow().error_reason.clone()
    }

    pub fn details(&self) -> Option<ConnectionDetails> {
        self.snapshot.borrow().details.clone()
    }

    /// Start connecting. A no-op while connecting or connected.
    pub fn connect(&self) {
        dispatch(&self.cmd_tx, Command::Connect);
    }

    /// Close the connection. Resolves once the connection is closed.
    pub fn close(&self) -> Deferred<()> {
        let (resolver, deferred) = Deferred::pair();
        dispatch(&self.cmd_tx, Command::Close(resolver));
        deferred
    }

    /// Round-trip a heartbeat with the server.
    pub fn ping(&self) -> Deferred<Duration> {
        let (resolver, deferred) = Deferred::pair();
        dispatch(&self.cmd_tx, Command::Ping(resolver));
        deferred
    }

    /// Every state change and update from now on.
    pub fn on_state_change(&self) -> Subscription<ConnectionStateChange> {
        self.listen(None)
    }

    /// Only the given event.
    pub fn on(&self, event: ConnectionEvent) -> Subscription<ConnectionStateChange> {
        self.listen(Some(event))
    }

    fn listen(&self, filter: Option<ConnectionEvent>) -> Subscription<ConnectionStateChange> {
        let (tx, sub) = Subscription::channel(self.capacity);
        dispatch(&self.cmd_tx, Command::OnConnectionState { filter, tx });
        sub
    }

    /// Wait until the connection reaches `state`. Fails if the connection
    /// lands in `failed` instead, or if the client has shut down.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), Error> {
        let mut rx = self.snapshot.clone();
        let reached = rx
            .wait_for(|s| s.state == state || s.state == ConnectionState::Failed)
            .await
            .map_err(|_| {
                Error::Connection(ErrorInfo::new(
                    error_code::INTERNAL,
                    Some(500),
                    "client event loop has stopped",
                ))
            })?
            .clone();
        if reached.state == state {
            return Ok(());
        }
        Err(Error::Connection(reached.error_reason.unwrap_or_else(|| {
            ErrorInfo::new(error_code::FAILED, None, "connection failed")
        })))
    }

    /// State a new client needs to continue this connection, or `None` when
    /// there is nothing to recover.
    pub fn recovery_context(&self) -> Option<RecoveryContext> {
        let snapshot = self.snapshot();
        if matches!(
            snapshot.state,
            ConnectionState::Closing
                | ConnectionState::Closed
                | ConnectionState::Failed
                | ConnectionState::Suspended
        ) {
            return None;
        }
        let key = snapshot.key?;
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let channel_serials: HashMap<String, String> = registry
            .iter()
            .filter_map(|(name, channel)| {
                let ch = channel.snapshot();
                match (ch.state, ch.channel_serial) {
                    (ChannelState::Attached, Some(serial)) => Some((name.clone(), serial)),
                    _ => None,
                }
            })
            .collect();
        Some(RecoveryContext {
            connection_key: key,
            msg_serial: snapshot.msg_serial,
            connection_serial: snapshot.serial,
            channel_serials,
        })
    }

    /// The compact `"{connection_key}:{serial}:{msg_serial}"` recovery key.
    pub fn recovery_key(&self) -> Option<String> {
        self.recovery_context().map(|ctx| ctx.to_key())
    }

    /// The recovery context encoded as JSON, including channel positions.
    pub fn create_recovery_key(&self) -> Option<String> {
        self.recovery_context().and_then(|ctx| ctx.encode().ok())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.borrow();
        f.debug_struct("Connection")
            .field("state", &snapshot.state)
            .field("id", &snapshot.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use ConnectionState::*;
        assert!(Initialized.can_transition_to(Connecting));
        assert!(!Initialized.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(Closing.can_transition_to(Closed));
        assert!(Failed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Failed));
    }

    #[test]
    fn every_state_maps_to_its_event() {
        assert_eq!(
            ConnectionEvent::from(ConnectionState::Suspended),
            ConnectionEvent::Suspended
        );
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }
}
