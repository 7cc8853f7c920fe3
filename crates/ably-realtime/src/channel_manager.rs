//! Channel lifecycle inside the event loop: attach/detach flows, inbound
//! channel envelopes, publish validation and reactions to connection state.

use tokio::sync::{mpsc, watch};

use crate::Error;
use crate::channel::{ChannelCore, ChannelEvent, ChannelSnapshot, ChannelState, ChannelStateChange};
use crate::connection::ConnectionState;
use crate::deferred::Resolver;
use crate::event_loop::Core;
use crate::message_queue::AckTarget;
use crate::options::ChannelOptions;
use crate::protocol::{
    Action, ErrorInfo, ProtocolMessage, build_attach_msg, build_detach_msg, decode_data,
    encode_data, error_code, flags,
};
use crate::timers::TimerKey;
use crate::types::Message;

fn channel_error(code: i32, message: impl Into<String>) -> Error {
    Error::Channel(ErrorInfo::new(code, None, message))
}

fn reject_all(resolvers: Vec<Resolver<()>>, err: &Error) {
    for resolver in resolvers {
        resolver.reject(err.duplicate());
    }
}

impl Core {
    fn channel_state(&self, name: &str) -> Option<ChannelState> {
        self.channels.get(name).map(ChannelCore::current)
    }

    fn is_connected(&self) -> bool {
        self.conn.state.is(&[ConnectionState::Connected])
    }

    fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    // -- Registry ----------------------------------------------------------

    pub(crate) fn create_channel(
        &mut self,
        name: String,
        options: ChannelOptions,
        snapshot_tx: watch::Sender<ChannelSnapshot>,
    ) {
        if let Some(ch) = self.channels.get_mut(&name) {
            ch.snapshot_tx = snapshot_tx;
            ch.publish_snapshot();
            self.set_channel_options(&name, options);
            return;
        }
        tracing::debug!(channel = %name, "Channel created");
        let serial = self.recovered_channel_serials.remove(&name);
        let ch = ChannelCore::new(options, serial, snapshot_tx);
        ch.publish_snapshot();
        self.channels.insert(name, ch);
    }

    pub(crate) fn set_channel_options(&mut self, name: &str, options: ChannelOptions) {
        let Some(ch) = self.channels.get_mut(name) else {
            return;
        };
        if ch.options == options {
            return;
        }
        ch.options = options;
        if ch.state.is(&[ChannelState::Attached, ChannelState::Attaching]) {
            tracing::info!(channel = %name, "Options changed, reattaching");
            self.request_attach(name, None);
        }
    }

    pub(crate) fn release_channel(&mut self, name: &str, resolver: Resolver<()>) {
        let Some(mut ch) = self.channels.remove(name) else {
            resolver.resolve(());
            return;
        };
        tracing::info!(channel = %name, "Releasing channel");
        if ch.state.is(&[ChannelState::Attached, ChannelState::Attaching]) && self.is_connected() {
            self.send_protocol_message(build_detach_msg(name), Vec::new());
        }
        let owned = name.to_string();
        self.timers.cancel_where(|key| match key {
            TimerKey::ChannelAttach(n) | TimerKey::ChannelDetach(n) | TimerKey::ChannelRetry(n) => {
                *n == owned
            }
            _ => false,
        });
        let err = channel_error(
            error_code::CHANNEL_INVALID_STATE,
            format!("channel {name} was released"),
        );
        reject_all(std::mem::take(&mut ch.attach_waiters), &err);
        reject_all(std::mem::take(&mut ch.detach_waiters), &err);
        ch.presence.reject_all(&err);
        ch.state_emitter.clear();
        ch.message_emitter.clear();
        ch.presence.emitter.clear();
        for env in self.conn.queue.drain_channel(name) {
            self.fail_envelope(env, &err);
        }
        resolver.resolve(());
    }

    // -- Attach / detach ---------------------------------------------------

    pub(crate) fn attach_channel(&mut self, name: &str, resolver: Option<Resolver<()>>) {
        let Some(state) = self.channel_state(name) else {
            if let Some(resolver) = resolver {
                resolver.reject(channel_error(
                    error_code::CHANNEL_INVALID_STATE,
                    format!("channel {name} does not exist"),
                ));
            }
            return;
        };
        match state {
            ChannelState::Attached => {
                if let Some(resolver) = resolver {
                    resolver.resolve(());
                }
                return;
            }
            ChannelState::Attaching => {
                if let Some(resolver) = resolver
                    && let Some(ch) = self.channels.get_mut(name)
                {
                    ch.attach_waiters.push(resolver);
                }
                return;
            }
            _ => {}
        }
        if self.conn.state.is(&[
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Suspended,
            ConnectionState::Failed,
        ]) {
            if let Some(resolver) = resolver {
                resolver.reject(Error::Connection(self.conn.state_error()));
            }
            return;
        }
        if let Some(resolver) = resolver
            && let Some(ch) = self.channels.get_mut(name)
        {
            ch.attach_waiters.push(resolver);
        }
        self.request_attach(name, None);
        if self.conn.state.is(&[ConnectionState::Initialized]) {
            self.connect();
        }
    }

    /// Enter `attaching` and send ATTACH if the connection is up. Otherwise
    /// the attach goes out when it connects.
    fn request_attach(&mut self, name: &str, reason: Option<ErrorInfo>) {
        if self.channel_state(name) != Some(ChannelState::Attaching)
            && !self.transition_channel(name, ChannelState::Attaching, reason, false)
        {
            return;
        }
        if self.is_connected() {
            self.send_attach(name);
        }
    }

    fn send_attach(&mut self, name: &str) {
        let Some(ch) = self.channels.get(name) else {
            return;
        };
        let msg = build_attach_msg(
            name,
            Some(&ch.options.params),
            ch.channel_serial.as_deref(),
            ch.options.mode_flags(),
        );
        tracing::debug!(channel = %name, resume = ch.channel_serial.is_some(), "Sending ATTACH");
        self.timers.schedule(
            TimerKey::ChannelAttach(name.to_string()),
            self.options.timing.realtime_request_timeout,
        );
        self.send_protocol_message(msg, Vec::new());
    }

    fn send_detach(&mut self, name: &str) {
        tracing::debug!(channel = %name, "Sending DETACH");
        self.timers.schedule(
            TimerKey::ChannelDetach(name.to_string()),
            self.options.timing.realtime_request_timeout,
        );
        self.send_protocol_message(build_detach_msg(name), Vec::new());
    }

    pub(crate) fn detach_channel(&mut self, name: &str, resolver: Resolver<()>) {
        let Some(state) = self.channel_state(name) else {
            resolver.resolve(());
            return;
        };
        match state {
            ChannelState::Initialized | ChannelState::Detached => resolver.resolve(()),
            ChannelState::Detaching => {
                if let Some(ch) = self.channels.get_mut(name) {
                    ch.detach_waiters.push(resolver);
                }
            }
            ChannelState::Failed => resolver.reject(channel_error(
                error_code::CHANNEL_INVALID_STATE,
                format!("cannot detach channel {name}: channel is failed"),
            )),
            ChannelState::Suspended => {
                self.transition_channel(name, ChannelState::Detached, None, false);
                resolver.resolve(());
            }
            ChannelState::Attached | ChannelState::Attaching => {
                if !self.is_connected() {
                    self.transition_channel(name, ChannelState::Detached, None, false);
                    resolver.resolve(());
                    return;
                }
                if let Some(ch) = self.channels.get_mut(name) {
                    ch.detach_waiters.push(resolver);
                }
                if self.transition_channel(name, ChannelState::Detaching, None, false) {
                    self.send_detach(name);
                }
            }
        }
    }

    pub(crate) fn on_attach_timeout(&mut self, name: &str) {
        if self.channel_state(name) == Some(ChannelState::Attaching) {
            tracing::warn!(channel = %name, "Attach timed out");
            let reason = ErrorInfo::new(
                error_code::CHANNEL_TIMEOUT,
                Some(408),
                "channel attach timed out",
            );
            self.transition_channel(name, ChannelState::Suspended, Some(reason), false);
        }
    }

    pub(crate) fn on_detach_timeout(&mut self, name: &str) {
        if self.channel_state(name) == Some(ChannelState::Detaching) {
            tracing::warn!(channel = %name, "Detach timed out");
            let reason = ErrorInfo::new(
                error_code::CHANNEL_TIMEOUT,
                Some(408),
                "channel detach timed out",
            );
            self.transition_channel(name, ChannelState::Attached, Some(reason), false);
        }
    }

    pub(crate) fn on_channel_retry(&mut self, name: &str) {
        if self.channel_state(name) == Some(ChannelState::Suspended) && self.is_connected() {
            tracing::info!(channel = %name, "Retrying attach of suspended channel");
            self.request_attach(name, None);
        }
    }

    // -- Inbound -----------------------------------------------------------

    pub(crate) fn on_channel_message(&mut self, msg: ProtocolMessage) {
        let Some(name) = msg.channel.clone() else {
            return;
        };
        if !self.channels.contains_key(&name) {
            tracing::debug!(channel = %name, action = ?msg.action, "Frame for unknown channel");
            return;
        }
        match msg.action {
            Action::Attached => self.on_attached(&name, msg),
            Action::Detached => self.on_detached(&name, msg),
            Action::Error => self.on_channel_error(&name, msg),
            Action::Message => self.on_message(&name, msg),
            Action::Presence => self.on_presence(&name, msg),
            Action::Sync => self.on_sync(&name, msg),
            other => tracing::debug!(channel = %name, action = ?other, "Unexpected channel frame"),
        }
    }

    fn on_attached(&mut self, name: &str, msg: ProtocolMessage) {
        let resumed = msg.has_flag(flags::HAS_CHANNEL_RESUMED);
        let has_presence = msg.has_flag(flags::HAS_PRESENCE);
        self.timers.cancel(&TimerKey::ChannelAttach(name.to_string()));
        let Some(ch) = self.channels.get_mut(name) else {
            return;
        };
        ch.attached_serial = msg.channel_serial.clone();
        if msg.channel_serial.is_some() {
            ch.channel_serial = msg.channel_serial.clone();
        }
        match ch.current() {
            ChannelState::Attached => {
                if let Some(error) = &msg.error {
                    ch.error_reason = Some(error.clone());
                }
                ch.publish_snapshot();
                ch.state_emitter.emit(
                    &ChannelEvent::Update,
                    ChannelStateChange {
                        current: ChannelState::Attached,
                        previous: ChannelState::Attached,
                        event: ChannelEvent::Update,
                        reason: msg.error,
                        resumed,
                    },
                );
                if !resumed {
                    self.presence_on_attached(name, has_presence);
                }
            }
            ChannelState::Detaching => {
                tracing::debug!(channel = %name, "ATTACHED while detaching, ignoring");
            }
            _ => {
                if self.transition_channel(name, ChannelState::Attached, msg.error, resumed) {
                    self.presence_on_attached(name, has_presence);
                }
            }
        }
    }

    fn on_detached(&mut self, name: &str, msg: ProtocolMessage) {
        let Some(state) = self.channel_state(name) else {
            return;
        };
        match state {
            ChannelState::Detaching => {
                self.transition_channel(name, ChannelState::Detached, msg.error, false);
            }
            ChannelState::Attached | ChannelState::Suspended => {
                let reason = msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(
                        error_code::CHANNEL_OPERATION_FAILED,
                        None,
                        "channel detached by server",
                    )
                });
                tracing::warn!(channel = %name, %reason, "Detached by server, reattaching");
                self.request_attach(name, Some(reason));
            }
            ChannelState::Attaching => {
                let reason = msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(
                        error_code::CHANNEL_OPERATION_FAILED,
                        None,
                        "attach rejected by server",
                    )
                });
                self.transition_channel(name, ChannelState::Suspended, Some(reason), false);
            }
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed => {
                tracing::debug!(channel = %name, %state, "Ignoring DETACHED");
            }
        }
    }

    fn on_channel_error(&mut self, name: &str, msg: ProtocolMessage) {
        let reason = msg.error.unwrap_or_else(|| {
            ErrorInfo::new(error_code::CHANNEL_OPERATION_FAILED, None, "channel error")
        });
        tracing::error!(channel = %name, %reason, "Channel failed");
        self.transition_channel(name, ChannelState::Failed, Some(reason.clone()), false);
        let err = Error::Channel(reason);
        for env in self.conn.queue.drain_channel(name) {
            self.fail_envelope(env, &err);
        }
    }

    fn on_message(&mut self, name: &str, msg: ProtocolMessage) {
        let Some(ch) = self.channels.get_mut(name) else {
            return;
        };
        if let Some(serial) = &msg.channel_serial {
            ch.channel_serial = Some(serial.clone());
        }
        if !ch.state.is(&[ChannelState::Attached]) {
            tracing::debug!(channel = %name, state = %ch.current(), "Dropping message on unattached channel");
            return;
        }
        for (index, mut message) in msg.messages.unwrap_or_default().into_iter().enumerate() {
            let (data, remaining) =
                decode_data(std::mem::take(&mut message.data), message.encoding.as_deref());
            message.data = data;
            message.encoding = remaining;
            if message.id.is_none()
                && let Some(id) = &msg.id
            {
                message.id = Some(format!("{id}:{index}"));
            }
            if message.connection_id.is_none() {
                message.connection_id = msg.connection_id.clone();
            }
            if message.timestamp.is_none() {
                message.timestamp = msg.timestamp;
            }
            let key = message.name.clone().unwrap_or_default();
            ch.message_emitter.emit(&key, message);
        }
    }

    // -- Publish and subscribe ---------------------------------------------

    pub(crate) fn publish(
        &mut self,
        name: &str,
        mut messages: Vec<Message>,
        resolvers: Vec<Resolver<()>>,
    ) {
        let Some(state) = self.channel_state(name) else {
            reject_all(
                resolvers,
                &channel_error(error_code::CHANNEL_INVALID_STATE, format!("channel {name} does not exist")),
            );
            return;
        };
        if matches!(state, ChannelState::Suspended | ChannelState::Failed) {
            reject_all(
                resolvers,
                &channel_error(
                    error_code::CHANNEL_INVALID_STATE,
                    format!("cannot publish to channel {name}: channel is {state}"),
                ),
            );
            return;
        }
        if !self.can_send_or_queue() {
            reject_all(resolvers, &Error::Connection(self.conn.state_error()));
            return;
        }
        if messages.is_empty() {
            return;
        }
        let identity = self.identity();
        let forbidden = messages.iter().find_map(|message| {
            let client_id = message.client_id.as_deref()?;
            let mismatched = identity
                .as_deref()
                .is_some_and(|id| id != "*" && id != client_id);
            (client_id == "*" || mismatched).then(|| client_id.to_string())
        });
        if let Some(client_id) = forbidden {
            reject_all(
                resolvers,
                &Error::invalid_request(
                    error_code::INVALID_CLIENT_ID,
                    format!("client id {client_id:?} is not permitted for this connection"),
                ),
            );
            return;
        }
        let size: usize = messages.iter().map(Message::size).sum();
        if size > self.conn.max_message_size {
            reject_all(
                resolvers,
                &Error::invalid_request(
                    error_code::MAX_MESSAGE_LENGTH_EXCEEDED,
                    format!(
                        "message size {size} exceeds the limit of {} bytes",
                        self.conn.max_message_size
                    ),
                ),
            );
            return;
        }
        for message in &mut messages {
            if message.encoding.is_none() {
                let (data, encoding) = encode_data(std::mem::take(&mut message.data));
                message.data = data;
                message.encoding = encoding;
            }
        }
        let mut msg = ProtocolMessage::for_channel(Action::Message, name);
        msg.messages = Some(messages);
        let targets = resolvers.into_iter().map(AckTarget::Caller).collect();
        self.send_protocol_message(msg, targets);
    }

    pub(crate) fn subscribe(&mut self, name: &str, event: Option<String>, tx: mpsc::Sender<Message>) {
        let Some(ch) = self.channels.get_mut(name) else {
            return;
        };
        ch.message_emitter.on(event, tx);
        self.attach_channel(name, None);
    }

    // -- State changes -----------------------------------------------------

    /// Apply a channel state change with its side effects. Returns `false`
    /// if the transition table does not allow it.
    pub(crate) fn transition_channel(
        &mut self,
        name: &str,
        next: ChannelState,
        reason: Option<ErrorInfo>,
        resumed: bool,
    ) -> bool {
        let connected = self.is_connected();
        let Some(ch) = self.channels.get_mut(name) else {
            return false;
        };
        let Some(previous) = ch.state.transition(next) else {
            return false;
        };
        if reason.is_some() || next == ChannelState::Attached {
            ch.error_reason = reason.clone();
        }
        match &reason {
            Some(reason) => {
                tracing::info!(channel = %name, from = %previous, to = %next, %reason, "Channel state changed");
            }
            None => tracing::info!(channel = %name, from = %previous, to = %next, "Channel state changed"),
        }
        if next != ChannelState::Attaching {
            self.timers.cancel(&TimerKey::ChannelAttach(name.to_string()));
        }
        if next != ChannelState::Detaching {
            self.timers.cancel(&TimerKey::ChannelDetach(name.to_string()));
        }
        self.timers.cancel(&TimerKey::ChannelRetry(name.to_string()));

        ch.publish_snapshot();
        ch.state_emitter.emit(
            &ChannelEvent::from(next),
            ChannelStateChange {
                current: next,
                previous,
                event: ChannelEvent::from(next),
                reason: reason.clone(),
                resumed,
            },
        );

        let err = Error::Channel(reason.clone().unwrap_or_else(|| {
            ErrorInfo::new(
                error_code::CHANNEL_INVALID_STATE,
                None,
                format!("channel {name} is {next}"),
            )
        }));
        match next {
            ChannelState::Attached => {
                for waiter in std::mem::take(&mut ch.attach_waiters) {
                    waiter.resolve(());
                }
                reject_all(std::mem::take(&mut ch.detach_waiters), &err);
            }
            ChannelState::Detached => {
                for waiter in std::mem::take(&mut ch.detach_waiters) {
                    waiter.resolve(());
                }
                reject_all(std::mem::take(&mut ch.attach_waiters), &err);
            }
            ChannelState::Attaching => reject_all(std::mem::take(&mut ch.detach_waiters), &err),
            ChannelState::Detaching => reject_all(std::mem::take(&mut ch.attach_waiters), &err),
            ChannelState::Suspended | ChannelState::Failed => {
                reject_all(std::mem::take(&mut ch.attach_waiters), &err);
                reject_all(std::mem::take(&mut ch.detach_waiters), &err);
            }
            ChannelState::Initialized => {}
        }

        self.presence_on_channel_state(name, next, reason.as_ref());
        if next == ChannelState::Suspended && connected {
            self.timers.schedule(
                TimerKey::ChannelRetry(name.to_string()),
                self.options.timing.channel_retry_timeout,
            );
        }
        true
    }

    /// The connection (re)connected. After a continuity loss every channel
    /// that was attached reattaches from scratch.
    pub(crate) fn channels_on_connected(&mut self, continuity_lost: bool, reason: Option<ErrorInfo>) {
        for name in self.channel_names() {
            let Some(state) = self.channel_state(&name) else {
                continue;
            };
            match state {
                ChannelState::Attached if continuity_lost => {
                    let reason = reason.clone().unwrap_or_else(|| {
                        ErrorInfo::new(
                            error_code::UNABLE_TO_RECOVER,
                            None,
                            "connection continuity lost",
                        )
                    });
                    self.request_attach(&name, Some(reason));
                }
                ChannelState::Attaching | ChannelState::Suspended => {
                    self.request_attach(&name, None);
                }
                ChannelState::Detaching => self.send_detach(&name),
                ChannelState::Initialized
                | ChannelState::Attached
                | ChannelState::Detached
                | ChannelState::Failed => {}
            }
        }
    }

    pub(crate) fn channels_on_connection_state(
        &mut self,
        next: ConnectionState,
        reason: Option<&ErrorInfo>,
    ) {
        for name in self.channel_names() {
            let Some(state) = self.channel_state(&name) else {
                continue;
            };
            match next {
                ConnectionState::Disconnected => {
                    self.timers.cancel(&TimerKey::ChannelAttach(name.clone()));
                    if state == ChannelState::Detaching {
                        self.transition_channel(&name, ChannelState::Detached, None, false);
                    }
                }
                ConnectionState::Suspended => {
                    if matches!(state, ChannelState::Attached | ChannelState::Attaching) {
                        let reason = reason.cloned().unwrap_or_else(|| {
                            ErrorInfo::new(error_code::SUSPENDED, None, "connection suspended")
                        });
                        self.transition_channel(&name, ChannelState::Suspended, Some(reason), false);
                    }
                }
                ConnectionState::Closed => {
                    if matches!(
                        state,
                        ChannelState::Attached
                            | ChannelState::Attaching
                            | ChannelState::Detaching
                            | ChannelState::Suspended
                    ) {
                        self.transition_channel(&name, ChannelState::Detached, None, false);
                    }
                }
                ConnectionState::Failed => {
                    if matches!(
                        state,
                        ChannelState::Attached
                            | ChannelState::Attaching
                            | ChannelState::Detaching
                            | ChannelState::Suspended
                    ) {
                        self.transition_channel(&name, ChannelState::Failed, reason.cloned(), false);
                    }
                }
                ConnectionState::Initialized
                | ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Closing => {}
            }
        }
    }
}
