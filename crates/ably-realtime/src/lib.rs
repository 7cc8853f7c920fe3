//! Ably Pub/Sub Realtime client.
//!
//! A single connection to Ably over WebSocket, multiplexing any number of
//! channels with publish, subscribe and presence.
//!
//! # Features
//! - Basic (API key) and token authentication, with token requests signed
//!   locally, fetched from an auth URL or produced by a callback
//! - MessagePack (default) or JSON wire format
//! - Connection resume after short disconnections, recovery keys for
//!   continuing a connection in a new client, fallback hosts
//! - Proactive and server-requested token renewal
//! - Heartbeat-based liveness detection and `ping`
//! - Presence with full member-set synchronisation and automatic re-entry
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), ably_realtime::Error> {
//! use ably_realtime::{ClientOptions, ConnectionState, Realtime};
//!
//! let client = Realtime::new(ClientOptions::with_key("appId.keyId:secret"))?;
//! client.connection().wait_for_state(ConnectionState::Connected).await?;
//!
//! let channel = client.channels().get("my-channel");
//! let mut messages = channel.subscribe();
//! channel.publish("greeting", serde_json::json!("hello")).await?;
//!
//! while let Some(msg) = messages.next().await {
//!     println!("got: {:?} {}", msg.name, msg.data);
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod channel_manager;
mod channels;
mod client;
mod connection;
mod connection_manager;
mod deferred;
mod error;
mod event_emitter;
mod event_loop;
mod members_map;
mod message_queue;
mod options;
mod presence;
pub mod protocol;
mod recovery;
mod state_machine;
mod timers;
mod transport;
mod types;

pub use auth::{Auth, TOKEN_EXPIRY_BUFFER, sign_token_request};
pub use channel::{Channel, ChannelEvent, ChannelState, ChannelStateChange};
pub use channels::Channels;
pub use client::Realtime;
pub use connection::{Connection, ConnectionEvent, ConnectionState, ConnectionStateChange};
pub use deferred::Deferred;
pub use error::{Error, Result};
pub use event_emitter::Subscription;
pub use options::{AuthMethod, ChannelMode, ChannelOptions, ClientOptions, TimingConfig};
pub use presence::{Presence, PresenceState};
pub use protocol::{ConnectionDetails, ErrorInfo, Format};
pub use recovery::RecoveryContext;
pub use state_machine::State;
pub use transport::{
    Transport, TransportEvent, TransportFactory, TransportParams, TransportSink,
    WebSocketTransportFactory,
};
pub use types::{
    AuthCallback, BoxError, Message, PresenceAction, PresenceMessage, TokenDetails, TokenFuture,
    TokenParams, TokenRequest, TokenSource,
};
