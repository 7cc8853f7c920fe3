//! The reactor task that owns every state machine.
//!
//! Public handles never touch connection or channel state directly: they send
//! a [`Command`] and get a [`Deferred`](crate::Deferred) back. Transport
//! frames, spawned token fetches and timers come back as [`Input`]s. Both are
//! processed one at a time by [`run`], so no state is ever shared across
//! tasks.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::Error;
use crate::auth::Auth;
use crate::channel::{ChannelCore, ChannelEvent, ChannelSnapshot, ChannelStateChange};
use crate::connection::{ConnectionEvent, ConnectionSnapshot, ConnectionStateChange};
use crate::connection_manager::ConnectionCore;
use crate::deferred::Resolver;
use crate::options::{ChannelOptions, ClientOptions};
use crate::protocol::{Action, ErrorInfo, ProtocolMessage, error_code};
use crate::recovery::RecoveryContext;
use crate::timers::{TimerKey, Timers};
use crate::transport::{Transport, TransportEvent};
use crate::types::{Message, PresenceAction, PresenceMessage, TokenDetails, TokenParams};

/// Internal events delivered to the loop. Transport and timer events carry
/// the generation they were started under so late arrivals can be ignored.
pub(crate) enum Input {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    TransportOpened {
        generation: u64,
        result: Result<Box<dyn Transport>, Error>,
    },
    Token(Result<TokenDetails, Error>),
    Timer {
        key: TimerKey,
        generation: u64,
    },
}

/// Requests from the public handles.
pub(crate) enum Command {
    Connect,
    Close(Resolver<()>),
    Ping(Resolver<Duration>),
    Authorize {
        params: Option<TokenParams>,
        resolver: Resolver<TokenDetails>,
    },
    OnConnectionState {
        filter: Option<ConnectionEvent>,
        tx: mpsc::Sender<ConnectionStateChange>,
    },
    CreateChannel {
        name: String,
        options: ChannelOptions,
        snapshot_tx: watch::Sender<ChannelSnapshot>,
    },
    SetChannelOptions {
        name: String,
        options: ChannelOptions,
    },
    ReleaseChannel {
        name: String,
        resolver: Resolver<()>,
    },
    Attach {
        channel: String,
        resolver: Resolver<()>,
    },
    Detach {
        channel: String,
        resolver: Resolver<()>,
    },
    Publish {
        channel: String,
        messages: Vec<Message>,
        resolvers: Vec<Resolver<()>>,
    },
    Subscribe {
        channel: String,
        name: Option<String>,
        tx: mpsc::Sender<Message>,
    },
    OnChannelState {
        channel: String,
        filter: Option<ChannelEvent>,
        tx: mpsc::Sender<ChannelStateChange>,
    },
    PresenceAction {
        channel: String,
        action: PresenceAction,
        /// `None` acts for this client's own identity.
        client_id: Option<String>,
        data: serde_json::Value,
        resolver: Resolver<()>,
    },
    PresenceGet {
        channel: String,
        wait_for_sync: bool,
        resolver: Resolver<Vec<PresenceMessage>>,
    },
    PresenceSubscribe {
        channel: String,
        filter: Option<PresenceAction>,
        tx: mpsc::Sender<PresenceMessage>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Close(_) => "close",
            Command::Ping(_) => "ping",
            Command::Authorize { .. } => "authorize",
            Command::OnConnectionState { .. } => "on_connection_state",
            Command::CreateChannel { .. } => "create_channel",
            Command::SetChannelOptions { .. } => "set_channel_options",
            Command::ReleaseChannel { .. } => "release_channel",
            Command::Attach { .. } => "attach",
            Command::Detach { .. } => "detach",
            Command::Publish { .. } => "publish",
            Command::Subscribe { .. } => "subscribe",
            Command::OnChannelState { .. } => "on_channel_state",
            Command::PresenceAction { .. } => "presence_action",
            Command::PresenceGet { .. } => "presence_get",
            Command::PresenceSubscribe { .. } => "presence_subscribe",
        }
    }
}

/// Hand a command to the loop. After the loop has stopped the command is
/// dropped, which rejects any resolver it carries as abandoned.
pub(crate) fn dispatch(cmd_tx: &mpsc::UnboundedSender<Command>, command: Command) {
    if let Err(mpsc::error::SendError(command)) = cmd_tx.send(command) {
        tracing::debug!(command = command.name(), "Event loop stopped, dropping command");
    }
}

pub(crate) struct Core {
    pub(crate) options: ClientOptions,
    pub(crate) auth: Auth,
    pub(crate) input_tx: mpsc::UnboundedSender<Input>,
    pub(crate) timers: Timers,
    pub(crate) conn: ConnectionCore,
    pub(crate) channels: HashMap<String, ChannelCore>,
    /// Channel serials from a recovery key, consumed as channels are created.
    pub(crate) recovered_channel_serials: HashMap<String, String>,
}

impl Core {
    pub(crate) fn new(
        options: ClientOptions,
        auth: Auth,
        recover: Option<RecoveryContext>,
        input_tx: mpsc::UnboundedSender<Input>,
        snapshot_tx: watch::Sender<ConnectionSnapshot>,
    ) -> Self {
        let recovered_channel_serials = recover
            .as_ref()
            .map(|ctx| ctx.channel_serials.clone())
            .unwrap_or_default();
        let conn = ConnectionCore::new(&options, recover, snapshot_tx);
        Core {
            timers: Timers::new(input_tx.clone()),
            options,
            auth,
            input_tx,
            conn,
            channels: HashMap::new(),
            recovered_channel_serials,
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Close(resolver) => self.close(resolver),
            Command::Ping(resolver) => self.ping(resolver),
            Command::Authorize { params, resolver } => self.authorize(params, resolver),
            Command::OnConnectionState { filter, tx } => self.conn.emitter.on(filter, tx),
            Command::CreateChannel {
                name,
                options,
                snapshot_tx,
            } => self.create_channel(name, options, snapshot_tx),
            Command::SetChannelOptions { name, options } => self.set_channel_options(&name, options),
            Command::ReleaseChannel { name, resolver } => self.release_channel(&name, resolver),
            Command::Attach { channel, resolver } => self.attach_channel(&channel, Some(resolver)),
            Command::Detach { channel, resolver } => self.detach_channel(&channel, resolver),
            Command::Publish {
                channel,
                messages,
                resolvers,
            } => self.publish(&channel, messages, resolvers),
            Command::Subscribe { channel, name, tx } => self.subscribe(&channel, name, tx),
            Command::OnChannelState {
                channel,
                filter,
                tx,
            } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.state_emitter.on(filter, tx);
                }
            }
            Command::PresenceAction {
                channel,
                action,
                client_id,
                data,
                resolver,
            } => self.presence_action(&channel, action, client_id, data, resolver),
            Command::PresenceGet {
                channel,
                wait_for_sync,
                resolver,
            } => self.presence_get(&channel, wait_for_sync, resolver),
            Command::PresenceSubscribe {
                channel,
                filter,
                tx,
            } => self.presence_subscribe(&channel, filter, tx),
        }
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Transport { generation, event } => self.on_transport_event(generation, event),
            Input::TransportOpened { generation, result } => {
                self.on_transport_opened(generation, result);
            }
            Input::Token(result) => self.on_token(result),
            Input::Timer { key, generation } => {
                if self.timers.take_fired(&key, generation) {
                    self.on_timer(key);
                }
            }
        }
    }

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::ConnectionRetry => self.on_retry_timer(),
            TimerKey::ConnectionOpen => self.on_connect_timeout(),
            TimerKey::Liveness => self.on_liveness_timer(),
            TimerKey::CloseAck => self.on_close_timeout(),
            TimerKey::TokenRenewal => self.on_token_renewal_timer(),
            TimerKey::Ping(id) => self.on_ping_timeout(&id),
            TimerKey::ChannelAttach(name) => self.on_attach_timeout(&name),
            TimerKey::ChannelDetach(name) => self.on_detach_timeout(&name),
            TimerKey::ChannelRetry(name) => self.on_channel_retry(&name),
            TimerKey::NackGrace(id) => self.on_nack_grace(id),
        }
    }

    /// Route a decoded frame to the connection or to its channel.
    pub(crate) fn on_protocol_message(&mut self, msg: ProtocolMessage) {
        tracing::trace!(action = ?msg.action, channel = ?msg.channel, "Received protocol message");
        self.conn.touch();
        if let Some(serial) = msg.connection_serial
            && serial >= 0
        {
            self.conn.serial = Some(serial);
        }
        match msg.action {
            Action::Heartbeat => self.on_heartbeat(&msg),
            Action::Ack => self.on_ack(&msg, None),
            Action::Nack => {
                let error = msg.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(error_code::INTERNAL, Some(500), "message rejected by server")
                });
                self.on_ack(&msg, Some(error));
            }
            Action::Connected => self.on_connected(msg),
            Action::Disconnected => self.on_server_disconnected(msg),
            Action::Closed => self.on_closed(msg),
            Action::Auth => self.on_server_auth(),
            Action::Error if msg.channel.is_none() => self.on_connection_error(msg),
            Action::Error
            | Action::Attached
            | Action::Detached
            | Action::Message
            | Action::Presence
            | Action::Sync => self.on_channel_message(msg),
            Action::Connect
            | Action::Disconnect
            | Action::Close
            | Action::Attach
            | Action::Detach => {
                tracing::debug!(action = ?msg.action, "Ignoring client-only action from server");
            }
        }
    }

    /// Bring every handle's view up to date.
    pub(crate) fn publish_snapshots(&mut self) {
        self.conn.publish_snapshot();
        for ch in self.channels.values() {
            ch.publish_snapshot();
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("Client dropped, stopping event loop");
        self.timers.cancel_all();
        if self.conn.state.is(&[crate::connection::ConnectionState::Connected])
            && let Some(transport) = self.conn.transport.as_mut()
        {
            let _ = transport.send(&ProtocolMessage::new(Action::Close));
        }
        self.drop_transport();
        self.conn.emitter.clear();
        for ch in self.channels.values_mut() {
            ch.state_emitter.clear();
            ch.message_emitter.clear();
        }
    }
}

/// Run until every public handle has been dropped.
pub(crate) async fn run(
    mut core: Core,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut input_rx: mpsc::UnboundedReceiver<Input>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => core.handle_command(cmd),
                None => {
                    core.shutdown();
                    break;
                }
            },
            Some(input) = input_rx.recv() => core.handle_input(input),
        }
        core.publish_snapshots();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;

    #[tokio::test]
    async fn commands_after_shutdown_are_dropped() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        drop(cmd_rx);

        dispatch(&cmd_tx, Command::Connect);
        let (resolver, closed) = Deferred::pair();
        dispatch(&cmd_tx, Command::Close(resolver));

        let err = closed.await.unwrap_err();
        assert_eq!(err.code(), error_code::INTERNAL);
        assert_eq!(Command::Connect.name(), "connect");
    }
}
