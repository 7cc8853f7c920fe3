//! Presence on a channel: the public [`Presence`] handle and the loop-side
//! bookkeeping for local members, queued actions and `get` waiters.

use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::{mpsc, watch};

use crate::Error;
use crate::channel::{ChannelEvent, ChannelSnapshot, ChannelState, ChannelStateChange};
use crate::deferred::{Deferred, Resolver};
use crate::event_emitter::{EventEmitter, Subscription};
use crate::event_loop::{Command, Core, dispatch};
use crate::members_map::MembersMap;
use crate::message_queue::AckTarget;
use crate::protocol::{Action, ErrorInfo, ProtocolMessage, decode_data, encode_data, error_code};
use crate::state_machine::{State, StateMachine};
use crate::types::{PresenceAction, PresenceMessage};

/// This client's own presence on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresenceState {
    #[default]
    Initialized,
    Entering,
    Entered,
    Leaving,
    Left,
    Failed,
}

impl State for PresenceState {
    fn transitions(self) -> &'static [Self] {
        use PresenceState::*;
        match self {
            Initialized => &[Entering, Failed],
            Entering => &[Entered, Leaving, Left, Failed],
            Entered => &[Entering, Leaving, Left, Failed],
            Leaving => &[Left, Entering, Failed],
            Left => &[Entering, Failed],
            Failed => &[Entering],
        }
    }
}

impl PresenceState {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceState::Initialized => "initialized",
            PresenceState::Entering => "entering",
            PresenceState::Entered => "entered",
            PresenceState::Leaving => "leaving",
            PresenceState::Left => "left",
            PresenceState::Failed => "failed",
        }
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to the presence set of one channel.
#[derive(Clone)]
pub struct Presence {
    cmd_tx: mpsc::UnboundedSender<Command>,
    channel: String,
    snapshot: watch::Receiver<ChannelSnapshot>,
    capacity: usize,
}

impl Presence {
    pub(crate) fn new(
        cmd_tx: mpsc::UnboundedSender<Command>,
        channel: String,
        snapshot: watch::Receiver<ChannelSnapshot>,
        capacity: usize,
    ) -> Self {
        Presence {
            cmd_tx,
            channel,
            snapshot,
            capacity,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.snapshot.borrow().presence_state
    }

    /// `true` once the member set has been fully synchronised.
    pub fn sync_complete(&self) -> bool {
        self.snapshot.borrow().sync_complete
    }

    fn action(
        &self,
        action: PresenceAction,
        client_id: Option<String>,
        data: serde_json::Value,
    ) -> Deferred<()> {
        let (resolver, deferred) = Deferred::pair();
        dispatch(&self.cmd_tx, Command::PresenceAction {
            channel: self.channel.clone(),
            action,
            client_id,
            data,
            resolver,
        });
        deferred
    }

    /// Enter with this client's id. Resolves when the server reflects the
    /// enter back.
    pub fn enter(&self, data: serde_json::Value) -> Deferred<()> {
        self.action(PresenceAction::Enter, None, data)
    }

    pub fn update(&self, data: serde_json::Value) -> Deferred<()> {
        self.action(PresenceAction::Update, None, data)
    }

    pub fn leave(&self, data: serde_json::Value) -> Deferred<()> {
        self.action(PresenceAction::Leave, None, data)
    }

    /// Enter on behalf of another client id. Resolves on acknowledgement.
    pub fn enter_client(&self, client_id: impl Into<String>, data: serde_json::Value) -> Deferred<()> {
        self.action(PresenceAction::Enter, Some(client_id.into()), data)
    }

    pub fn update_client(&self, client_id: impl Into<String>, data: serde_json::Value) -> Deferred<()> {
        self.action(PresenceAction::Update, Some(client_id.into()), data)
    }

    pub fn leave_client(&self, client_id: impl Into<String>, data: serde_json::Value) -> Deferred<()> {
        self.action(PresenceAction::Leave, Some(client_id.into()), data)
    }

    /// Current members, after waiting for the sync to complete.
    pub fn get(&self) -> Deferred<Vec<PresenceMessage>> {
        self.get_with(true)
    }

    /// Current members. With `wait_for_sync == false` the possibly
    /// incomplete set is returned at once.
    pub fn get_with(&self, wait_for_sync: bool) -> Deferred<Vec<PresenceMessage>> {
        let (resolver, deferred) = Deferred::pair();
        dispatch(&self.cmd_tx, Command::PresenceGet {
            channel: self.channel.clone(),
            wait_for_sync,
            resolver,
        });
        deferred
    }

    /// Every presence event. Attaches implicitly.
    pub fn subscribe(&self) -> Subscription<PresenceMessage> {
        self.listen(None)
    }

    pub fn subscribe_to(&self, action: PresenceAction) -> Subscription<PresenceMessage> {
        self.listen(Some(action))
    }

    fn listen(&self, filter: Option<PresenceAction>) -> Subscription<PresenceMessage> {
        let (tx, sub) = Subscription::channel(self.capacity);
        dispatch(&self.cmd_tx, Command::PresenceSubscribe {
            channel: self.channel.clone(),
            filter,
            tx,
        });
        sub
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Presence")
            .field("channel", &self.channel)
            .field("state", &self.snapshot.borrow().presence_state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loop-side record
// ---------------------------------------------------------------------------

/// A local enter/update/leave waiting for the server to reflect it.
struct LocalWaiter {
    client_id: String,
    action: PresenceAction,
    resolver: Resolver<()>,
}

fn same_kind(a: PresenceAction, b: PresenceAction) -> bool {
    (a == PresenceAction::Leave) == (b == PresenceAction::Leave)
}

pub(crate) struct PresenceCore {
    pub(crate) members: MembersMap,
    pub(crate) state: StateMachine<PresenceState>,
    /// Members entered from this connection, by client id, for re-entry.
    local_members: BTreeMap<String, PresenceMessage>,
    /// Actions waiting for the channel to attach.
    pending: Vec<(PresenceMessage, AckTarget)>,
    local_waiters: Vec<LocalWaiter>,
    get_waiters: Vec<Resolver<Vec<PresenceMessage>>>,
    pub(crate) emitter: EventEmitter<PresenceAction, PresenceMessage>,
}

impl Default for PresenceCore {
    fn default() -> Self {
        PresenceCore {
            members: MembersMap::default(),
            state: StateMachine::new("presence", PresenceState::Initialized),
            local_members: BTreeMap::new(),
            pending: Vec::new(),
            local_waiters: Vec::new(),
            get_waiters: Vec::new(),
            emitter: EventEmitter::default(),
        }
    }
}

impl PresenceCore {
    fn set_state(&mut self, next: PresenceState) {
        if self.state.current().can_transition_to(next) {
            self.state.transition(next);
        }
    }

    fn emit(&mut self, events: Vec<PresenceMessage>) {
        for event in events {
            let action = event.action;
            self.emitter.emit(&action, event);
        }
    }

    /// Resolve local waiters reflected by `msg`.
    fn on_reflection(&mut self, msg: &PresenceMessage) {
        let Some(client_id) = msg.client_id.as_deref() else {
            return;
        };
        let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.local_waiters)
            .into_iter()
            .partition(|w| w.client_id == client_id && same_kind(w.action, msg.action));
        self.local_waiters = rest;
        if matched.is_empty() {
            return;
        }
        self.set_state(if msg.action == PresenceAction::Leave {
            PresenceState::Left
        } else {
            PresenceState::Entered
        });
        for waiter in matched {
            waiter.resolver.resolve(());
        }
    }

    fn reject_pending(&mut self, err: &Error) {
        for (_, target) in std::mem::take(&mut self.pending) {
            if let AckTarget::Caller(resolver) = target {
                resolver.reject(err.duplicate());
            }
        }
        for waiter in std::mem::take(&mut self.local_waiters) {
            waiter.resolver.reject(err.duplicate());
        }
    }

    fn reject_get_waiters(&mut self, err: &Error) {
        for waiter in std::mem::take(&mut self.get_waiters) {
            waiter.reject(err.duplicate());
        }
    }

    /// Reject everything waiting on this channel's presence.
    pub(crate) fn reject_all(&mut self, err: &Error) {
        self.reject_pending(err);
        self.reject_get_waiters(err);
    }
}

/// Decode data and fill per-item defaults from the envelope.
fn normalize(msg: &mut ProtocolMessage) -> Vec<PresenceMessage> {
    let mut items = msg.presence.take().unwrap_or_default();
    for (index, item) in items.iter_mut().enumerate() {
        let (data, remaining) = decode_data(std::mem::take(&mut item.data), item.encoding.as_deref());
        item.data = data;
        item.encoding = remaining;
        if item.id.is_none()
            && let Some(id) = &msg.id
        {
            item.id = Some(format!("{id}:{index}"));
        }
        if item.connection_id.is_none() {
            item.connection_id = msg.connection_id.clone();
        }
        if item.timestamp.is_none() {
            item.timestamp = msg.timestamp;
        }
    }
    items
}

fn presence_error(code: i32, message: impl Into<String>) -> Error {
    Error::Presence(ErrorInfo::new(code, None, message))
}

// ---------------------------------------------------------------------------
// Event loop integration
// ---------------------------------------------------------------------------

impl Core {
    pub(crate) fn presence_action(
        &mut self,
        channel: &str,
        action: PresenceAction,
        client_id: Option<String>,
        data: serde_json::Value,
        resolver: Resolver<()>,
    ) {
        let local = client_id.is_none();
        let client_id = match client_id.or_else(|| self.identity()) {
            Some(id) if id != "*" => id,
            _ => {
                resolver.reject(Error::invalid_request(
                    error_code::INVALID_CLIENT_ID,
                    "presence requires a concrete client id",
                ));
                return;
            }
        };
        let Some(state) = self.channels.get(channel).map(|ch| ch.current()) else {
            resolver.reject(presence_error(
                error_code::CHANNEL_INVALID_STATE,
                format!("channel {channel} does not exist"),
            ));
            return;
        };
        if state == ChannelState::Failed {
            resolver.reject(presence_error(
                error_code::PRESENCE_INVALID_STATE,
                format!("cannot update presence on channel {channel}: channel is failed"),
            ));
            return;
        }
        if !self.can_send_or_queue() {
            resolver.reject(Error::Connection(self.conn.state_error()));
            return;
        }
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };

        let (data, encoding) = encode_data(data);
        let msg = PresenceMessage {
            action,
            client_id: Some(client_id.clone()),
            data,
            encoding,
            ..Default::default()
        };
        let target = if local {
            ch.presence.set_state(if action == PresenceAction::Leave {
                PresenceState::Leaving
            } else if ch.presence.state.is(&[PresenceState::Entered]) {
                PresenceState::Entered
            } else {
                PresenceState::Entering
            });
            ch.presence.local_waiters.push(LocalWaiter {
                client_id: client_id.clone(),
                action,
                resolver,
            });
            AckTarget::LocalPresence {
                channel: channel.to_string(),
                client_id,
                action,
            }
        } else {
            AckTarget::Caller(resolver)
        };

        if state == ChannelState::Attached {
            self.send_presence(channel, msg, target);
        } else {
            tracing::debug!(channel, ?action, "Queueing presence action until attached");
            ch.presence.pending.push((msg, target));
            self.attach_channel(channel, None);
        }
    }

    fn send_presence(&mut self, channel: &str, item: PresenceMessage, target: AckTarget) {
        let mut msg = ProtocolMessage::for_channel(Action::Presence, channel);
        msg.presence = Some(vec![item]);
        self.send_protocol_message(msg, vec![target]);
    }

    pub(crate) fn presence_get(
        &mut self,
        channel: &str,
        wait_for_sync: bool,
        resolver: Resolver<Vec<PresenceMessage>>,
    ) {
        let Some(ch) = self.channels.get_mut(channel) else {
            resolver.reject(presence_error(
                error_code::CHANNEL_INVALID_STATE,
                format!("channel {channel} does not exist"),
            ));
            return;
        };
        let state = ch.current();
        match state {
            ChannelState::Failed => {
                resolver.reject(Error::Channel(ErrorInfo::new(
                    error_code::CHANNEL_INVALID_STATE,
                    None,
                    format!("cannot get presence of channel {channel}: channel is failed"),
                )));
                return;
            }
            ChannelState::Suspended if wait_for_sync => {
                resolver.reject(presence_error(
                    error_code::PRESENCE_SYNC_INCOMPLETE,
                    format!("presence of channel {channel} cannot sync while suspended"),
                ));
                return;
            }
            _ => {}
        }
        if !wait_for_sync || ch.presence.members.is_in_sync() {
            resolver.resolve(ch.presence.members.values());
            return;
        }
        ch.presence.get_waiters.push(resolver);
        if !matches!(state, ChannelState::Attached | ChannelState::Attaching) {
            self.attach_channel(channel, None);
        }
    }

    pub(crate) fn presence_subscribe(
        &mut self,
        channel: &str,
        filter: Option<PresenceAction>,
        tx: mpsc::Sender<PresenceMessage>,
    ) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        ch.presence.emitter.on(filter, tx);
        self.attach_channel(channel, None);
    }

    // -- Inbound -----------------------------------------------------------

    pub(crate) fn on_presence(&mut self, channel: &str, mut msg: ProtocolMessage) {
        let own_connection = self.conn.id.clone();
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        if let Some(serial) = &msg.channel_serial {
            ch.channel_serial = Some(serial.clone());
        }
        let items = normalize(&mut msg);
        for item in &items {
            if own_connection.is_none() || item.connection_id != own_connection {
                continue;
            }
            let Some(client_id) = item.client_id.clone() else {
                continue;
            };
            match item.action {
                PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                    ch.presence.local_members.insert(client_id, item.clone());
                }
                // A leave synthesized by the server does not end local
                // membership; the member is re-entered after the next sync.
                PresenceAction::Leave if item.has_connection_scoped_id() => {
                    ch.presence.local_members.remove(&client_id);
                }
                PresenceAction::Leave | PresenceAction::Absent => {}
            }
            ch.presence.on_reflection(item);
        }
        let events = ch.presence.members.apply_live(items);
        ch.presence.emit(events);
    }

    pub(crate) fn on_sync(&mut self, channel: &str, mut msg: ProtocolMessage) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        let items = normalize(&mut msg);
        let count = items.len();
        let (events, complete) = ch
            .presence
            .members
            .apply_sync(msg.channel_serial.as_deref(), items);
        tracing::debug!(
            channel,
            count,
            complete,
            sync = ?ch.presence.members.state(),
            "Presence SYNC"
        );
        ch.presence.emit(events);
        if complete {
            self.on_sync_complete(channel);
        }
    }

    /// The member set is complete: answer `get` waiters and re-enter local
    /// members the server no longer lists for this connection.
    fn on_sync_complete(&mut self, channel: &str) {
        let own_connection = self.conn.id.clone();
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        let members = ch.presence.members.values();
        for waiter in std::mem::take(&mut ch.presence.get_waiters) {
            waiter.resolve(members.clone());
        }
        let Some(connection_id) = own_connection else {
            return;
        };
        let present = ch.presence.members.client_ids_for_connection(&connection_id);
        let missing: Vec<PresenceMessage> = ch
            .presence
            .local_members
            .iter()
            .filter(|(client_id, _)| !present.contains(client_id))
            .map(|(_, msg)| msg.clone())
            .collect();
        for member in missing {
            let Some(client_id) = member.client_id.clone() else {
                continue;
            };
            tracing::info!(channel, client_id = %client_id, "Re-entering local presence member");
            let (data, encoding) = encode_data(member.data);
            let item = PresenceMessage {
                action: PresenceAction::Enter,
                client_id: Some(client_id.clone()),
                data,
                encoding,
                ..Default::default()
            };
            let target = AckTarget::ReEnter {
                channel: channel.to_string(),
                client_id,
            };
            self.send_presence(channel, item, target);
        }
    }

    pub(crate) fn presence_on_attached(&mut self, channel: &str, has_presence: bool) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        let events = ch.presence.members.on_attached(has_presence);
        ch.presence.emit(events);
        let pending = std::mem::take(&mut ch.presence.pending);
        if !has_presence {
            self.on_sync_complete(channel);
        }
        for (item, target) in pending {
            self.send_presence(channel, item, target);
        }
    }

    pub(crate) fn presence_on_channel_state(
        &mut self,
        channel: &str,
        next: ChannelState,
        reason: Option<&ErrorInfo>,
    ) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        match next {
            ChannelState::Suspended => {
                let sync_err = presence_error(
                    error_code::PRESENCE_SYNC_INCOMPLETE,
                    format!("presence sync of channel {channel} interrupted: channel suspended"),
                );
                ch.presence.reject_get_waiters(&sync_err);
                let err = Error::Presence(reason.cloned().unwrap_or_else(|| {
                    ErrorInfo::new(error_code::PRESENCE_INVALID_STATE, None, "channel suspended")
                }));
                ch.presence.reject_pending(&err);
            }
            ChannelState::Detached | ChannelState::Failed => {
                ch.presence.members.fail();
                let err = Error::Presence(reason.cloned().unwrap_or_else(|| {
                    ErrorInfo::new(
                        error_code::PRESENCE_INVALID_STATE,
                        None,
                        format!("channel {channel} is {next}"),
                    )
                }));
                ch.presence.reject_all(&err);
                ch.presence.local_members.clear();
                if next == ChannelState::Failed {
                    ch.presence.set_state(PresenceState::Failed);
                } else if !ch
                    .presence
                    .state
                    .is(&[PresenceState::Initialized, PresenceState::Left])
                {
                    ch.presence.set_state(PresenceState::Left);
                }
            }
            ChannelState::Initialized
            | ChannelState::Attaching
            | ChannelState::Attached
            | ChannelState::Detaching => {}
        }
    }

    /// A local presence action was rejected before it could be reflected.
    pub(crate) fn fail_local_presence(
        &mut self,
        channel: &str,
        client_id: &str,
        action: PresenceAction,
        err: &Error,
    ) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        let (failed, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut ch.presence.local_waiters)
            .into_iter()
            .partition(|w| w.client_id == client_id && same_kind(w.action, action));
        ch.presence.local_waiters = rest;
        if failed.is_empty() {
            return;
        }
        tracing::warn!(channel, client_id, ?action, "Presence action failed: {err}");
        ch.presence.set_state(PresenceState::Failed);
        for waiter in failed {
            waiter.resolver.reject(err.duplicate());
        }
    }

    /// Automatic re-entry failed; surfaced as a channel `update`.
    pub(crate) fn on_reenter_failed(&mut self, channel: &str, client_id: &str, cause: &ErrorInfo) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        tracing::warn!(channel, client_id, %cause, "Presence re-entry failed");
        let current = ch.current();
        let reason = ErrorInfo::new(
            error_code::PRESENCE_REENTER_FAILED,
            cause.status_code,
            format!("failed to re-enter presence member {client_id}: {}", cause.message),
        );
        ch.state_emitter.emit(
            &ChannelEvent::Update,
            ChannelStateChange {
                current,
                previous: current,
                event: ChannelEvent::Update,
                reason: Some(reason),
                resumed: true,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(action: PresenceAction, client: &str) -> PresenceMessage {
        PresenceMessage {
            action,
            client_id: Some(client.into()),
            connection_id: Some("conn".into()),
            ..Default::default()
        }
    }

    #[test]
    fn transition_table() {
        use PresenceState::*;
        assert!(Initialized.can_transition_to(Entering));
        assert!(!Initialized.can_transition_to(Left));
        assert!(Entering.can_transition_to(Entered));
        assert!(Leaving.can_transition_to(Left));
        assert!(Failed.can_transition_to(Entering));
    }

    #[tokio::test]
    async fn reflection_resolves_matching_waiter_only() {
        let mut core = PresenceCore::default();
        core.set_state(PresenceState::Entering);
        let (enter, entered) = Deferred::pair();
        let (leave, _left) = Deferred::<()>::pair();
        core.local_waiters.push(LocalWaiter {
            client_id: "alice".into(),
            action: PresenceAction::Enter,
            resolver: enter,
        });
        core.local_waiters.push(LocalWaiter {
            client_id: "alice".into(),
            action: PresenceAction::Leave,
            resolver: leave,
        });

        core.on_reflection(&member(PresenceAction::Enter, "alice"));
        entered.await.unwrap();
        assert_eq!(core.state.current(), PresenceState::Entered);
        assert_eq!(core.local_waiters.len(), 1);
        assert_eq!(core.local_waiters[0].action, PresenceAction::Leave);
    }

    #[tokio::test]
    async fn reject_all_fails_every_waiter() {
        let mut core = PresenceCore::default();
        let (get, got) = Deferred::pair();
        core.get_waiters.push(get);
        let (caller, called) = Deferred::pair();
        core.pending
            .push((member(PresenceAction::Enter, "bob"), AckTarget::Caller(caller)));

        core.reject_all(&presence_error(error_code::PRESENCE_INVALID_STATE, "detached"));
        assert_eq!(got.await.unwrap_err().code(), error_code::PRESENCE_INVALID_STATE);
        assert_eq!(called.await.unwrap_err().code(), error_code::PRESENCE_INVALID_STATE);
    }

    #[test]
    fn normalize_fills_defaults_from_envelope() {
        let mut msg = ProtocolMessage::for_channel(Action::Presence, "ch");
        msg.id = Some("conn:4".into());
        msg.connection_id = Some("conn".into());
        msg.timestamp = Some(1_000);
        msg.presence = Some(vec![
            PresenceMessage {
                action: PresenceAction::Enter,
                client_id: Some("a".into()),
                data: serde_json::Value::String("{\"x\":1}".into()),
                encoding: Some("json".into()),
                ..Default::default()
            },
            PresenceMessage {
                action: PresenceAction::Enter,
                client_id: Some("b".into()),
                ..Default::default()
            },
        ]);
        let items = normalize(&mut msg);
        assert_eq!(items[0].id.as_deref(), Some("conn:4:0"));
        assert_eq!(items[1].id.as_deref(), Some("conn:4:1"));
        assert_eq!(items[0].data, serde_json::json!({"x": 1}));
        assert_eq!(items[0].encoding, None);
        assert_eq!(items[1].timestamp, Some(1_000));
        assert!(items[0].has_connection_scoped_id());
    }
}
