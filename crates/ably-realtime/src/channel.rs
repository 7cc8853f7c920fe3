//! Public channel types, the [`Channel`] handle and the loop-side channel
//! record.

use std::fmt;

use tokio::sync::{mpsc, watch};

use crate::Error;
use crate::deferred::{Deferred, Resolver};
use crate::event_emitter::{EventEmitter, Subscription};
use crate::event_loop::{Command, dispatch};
use crate::options::{ChannelOptions, MAX_PROTOCOL_MESSAGE_BATCH_SIZE};
use crate::presence::{Presence, PresenceCore, PresenceState};
use crate::protocol::{ErrorInfo, error_code};
use crate::state_machine::{State, StateMachine};
use crate::types::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl State for ChannelState {
    fn transitions(self) -> &'static [Self] {
        use ChannelState::*;
        match self {
            Initialized => &[Attaching, Detaching, Detached, Failed],
            Attaching => &[Attached, Detaching, Detached, Suspended, Failed],
            Attached => &[Attaching, Detaching, Detached, Suspended, Failed],
            Detaching => &[Detached, Attaching, Attached, Suspended, Failed],
            Detached => &[Attaching, Failed],
            Suspended => &[Attaching, Detached, Failed],
            Failed => &[Attaching],
        }
    }
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
    Update,
}

impl From<ChannelState> for ChannelEvent {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Initialized => ChannelEvent::Initialized,
            ChannelState::Attaching => ChannelEvent::Attaching,
            ChannelState::Attached => ChannelEvent::Attached,
            ChannelState::Detaching => ChannelEvent::Detaching,
            ChannelState::Detached => ChannelEvent::Detached,
            ChannelState::Suspended => ChannelEvent::Suspended,
            ChannelState::Failed => ChannelEvent::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub current: ChannelState,
    pub previous: ChannelState,
    pub event: ChannelEvent,
    pub reason: Option<ErrorInfo>,
    /// For `attached` and `update`: whether message continuity was kept.
    pub resumed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ChannelSnapshot {
    pub(crate) state: ChannelState,
    pub(crate) error_reason: Option<ErrorInfo>,
    pub(crate) attached_serial: Option<String>,
    pub(crate) channel_serial: Option<String>,
    pub(crate) presence_state: PresenceState,
    pub(crate) sync_complete: bool,
}

/// Handle to a named channel. Cheap to clone; every clone refers to the same
/// channel.
#[derive(Clone)]
pub struct Channel {
    cmd_tx: mpsc::UnboundedSender<Command>,
    name: String,
    snapshot: watch::Receiver<ChannelSnapshot>,
    capacity: usize,
}

impl Channel {
    pub(crate) fn new(
        cmd_tx: mpsc::UnboundedSender<Command>,
        name: String,
        snapshot: watch::Receiver<ChannelSnapshot>,
        capacity: usize,
    ) -> Self {
        Channel {
            cmd_tx,
            name,
            snapshot,
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ChannelState {
        self.snapshot.borrow().state
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.snapshot.borrow().error_reason.clone()
    }

    /// Serial from the last ATTACHED.
    pub fn attached_serial(&self) -> Option<String> {
        self.snapshot.borrow().attached_serial.clone()
    }

    /// Position in the channel's message stream, used to resume.
    pub fn channel_serial(&self) -> Option<String> {
        self.snapshot.borrow().channel_serial.clone()
    }

    fn command(&self, build: impl FnOnce(Resolver<()>) -> Command) -> Deferred<()> {
        let (resolver, deferred) = Deferred::pair();
        dispatch(&self.cmd_tx, build(resolver));
        deferred
    }

    /// Attach, connecting first if needed. Resolves once attached.
    pub fn attach(&self) -> Deferred<()> {
        let channel = self.name.clone();
        self.command(|resolver| Command::Attach { channel, resolver })
    }

    pub fn detach(&self) -> Deferred<()> {
        let channel = self.name.clone();
        self.command(|resolver| Command::Detach { channel, resolver })
    }

    /// Replace the channel options. An attached channel reattaches with them.
    pub fn set_options(&self, options: ChannelOptions) {
        dispatch(&self.cmd_tx, Command::SetChannelOptions {
            name: self.name.clone(),
            options,
        });
    }

    /// Publish one message. Resolves when the server acknowledges it.
    pub fn publish(&self, name: impl Into<String>, data: serde_json::Value) -> Deferred<()> {
        self.publish_messages(vec![Message::new(name, data)])
    }

    pub fn publish_message(&self, message: Message) -> Deferred<()> {
        self.publish_messages(vec![message])
    }

    /// Publish a batch in a single envelope. At most 50 messages.
    pub fn publish_messages(&self, messages: Vec<Message>) -> Deferred<()> {
        if messages.len() > MAX_PROTOCOL_MESSAGE_BATCH_SIZE {
            return Deferred::failed(Error::invalid_request(
                error_code::BAD_REQUEST,
                format!(
                    "cannot publish {} messages at once, the limit is {MAX_PROTOCOL_MESSAGE_BATCH_SIZE}",
                    messages.len()
                ),
            ));
        }
        let (resolvers, deferreds): (Vec<_>, Vec<_>) =
            messages.iter().map(|_| Deferred::pair()).unzip();
        dispatch(&self.cmd_tx, Command::Publish {
            channel: self.name.clone(),
            messages,
            resolvers,
        });
        Deferred::all(deferreds).then(|_| (), |_| {})
    }

    /// Every message on the channel. Attaches implicitly.
    pub fn subscribe(&self) -> Subscription<Message> {
        self.listen(None)
    }

    /// Messages with the given name. Attaches implicitly.
    pub fn subscribe_to(&self, name: impl Into<String>) -> Subscription<Message> {
        self.listen(Some(name.into()))
    }

    fn listen(&self, name: Option<String>) -> Subscription<Message> {
        let (tx, sub) = Subscription::channel(self.capacity);
        dispatch(&self.cmd_tx, Command::Subscribe {
            channel: self.name.clone(),
            name,
            tx,
        });
        sub
    }

    pub fn on_state_change(&self) -> Subscription<ChannelStateChange> {
        self.listen_state(None)
    }

    pub fn on(&self, event: ChannelEvent) -> Subscription<ChannelStateChange> {
        self.listen_state(Some(event))
    }

    fn listen_state(&self, filter: Option<ChannelEvent>) -> Subscription<ChannelStateChange> {
        let (tx, sub) = Subscription::channel(self.capacity);
        dispatch(&self.cmd_tx, Command::OnChannelState {
            channel: self.name.clone(),
            filter,
            tx,
        });
        sub
    }

    pub fn presence(&self) -> Presence {
        Presence::new(
            self.cmd_tx.clone(),
            self.name.clone(),
            self.snapshot.clone(),
            self.capacity,
        )
    }

    /// Wait until the channel reaches `state`. Fails if it lands in `failed`
    /// instead.
    pub async fn wait_for_state(&self, state: ChannelState) -> Result<(), Error> {
        let mut rx = self.snapshot.clone();
        let reached = rx
            .wait_for(|s| s.state == state || s.state == ChannelState::Failed)
            .await
            .map_err(|_| {
                Error::Channel(ErrorInfo::new(
                    error_code::CHANNEL_INVALID_STATE,
                    None,
                    format!("channel {} was released", self.name),
                ))
            })?
            .clone();
        if reached.state == state {
            return Ok(());
        }
        Err(Error::Channel(reached.error_reason.unwrap_or_else(|| {
            ErrorInfo::new(error_code::CHANNEL_OPERATION_FAILED, None, "channel failed")
        })))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("state", &self.snapshot.borrow().state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loop-side record
// ---------------------------------------------------------------------------

pub(crate) struct ChannelCore {
    pub(crate) options: ChannelOptions,
    pub(crate) state: StateMachine<ChannelState>,
    pub(crate) error_reason: Option<ErrorInfo>,
    pub(crate) attached_serial: Option<String>,
    pub(crate) channel_serial: Option<String>,
    pub(crate) attach_waiters: Vec<Resolver<()>>,
    pub(crate) detach_waiters: Vec<Resolver<()>>,
    pub(crate) state_emitter: EventEmitter<ChannelEvent, ChannelStateChange>,
    /// Keyed by message name; `None` listeners get everything.
    pub(crate) message_emitter: EventEmitter<String, Message>,
    pub(crate) presence: PresenceCore,
    pub(crate) snapshot_tx: watch::Sender<ChannelSnapshot>,
}

impl ChannelCore {
    pub(crate) fn new(
        options: ChannelOptions,
        channel_serial: Option<String>,
        snapshot_tx: watch::Sender<ChannelSnapshot>,
    ) -> Self {
        ChannelCore {
            options,
            state: StateMachine::new("channel", ChannelState::Initialized),
            error_reason: None,
            attached_serial: None,
            channel_serial,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            state_emitter: EventEmitter::default(),
            message_emitter: EventEmitter::default(),
            presence: PresenceCore::default(),
            snapshot_tx,
        }
    }

    pub(crate) fn current(&self) -> ChannelState {
        self.state.current()
    }

    /// Nothing sent on this channel can be delivered until it reattaches.
    pub(crate) fn is_inactive(&self) -> bool {
        self.state.is(&[
            ChannelState::Detached,
            ChannelState::Suspended,
            ChannelState::Failed,
        ])
    }

    pub(crate) fn publish_snapshot(&self) {
        let next = ChannelSnapshot {
            state: self.state.current(),
            error_reason: self.error_reason.clone(),
            attached_serial: self.attached_serial.clone(),
            channel_serial: self.channel_serial.clone(),
            presence_state: self.presence.state.current(),
            sync_complete: self.presence.members.is_in_sync(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
