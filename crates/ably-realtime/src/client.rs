//! The [`Realtime`] client.

use tokio::sync::{mpsc, watch};

use crate::Error;
use crate::auth::Auth;
use crate::channels::{Channels, Registry};
use crate::connection::{Connection, ConnectionSnapshot};
use crate::deferred::Deferred;
use crate::event_loop::{Command, Core, dispatch, run};
use crate::options::ClientOptions;
use crate::protocol::error_code;
use crate::recovery::RecoveryContext;
use crate::types::{TokenDetails, TokenParams};

/// A realtime client: one connection plus its channels.
///
/// Must be created inside a Tokio runtime. The client's event loop runs
/// until the `Realtime` and every handle obtained from it are dropped.
pub struct Realtime {
    cmd_tx: mpsc::UnboundedSender<Command>,
    auth: Auth,
    connection: Connection,
    channels: Channels,
}

impl Realtime {
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        options.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::configuration(
                error_code::BAD_REQUEST,
                "Realtime::new must be called from within a Tokio runtime",
            )
        })?;
        let recover = options
            .recover
            .as_deref()
            .map(RecoveryContext::parse)
            .transpose()?;
        let auth = Auth::new(&options);
        let capacity = options.event_capacity;
        let auto_connect = options.auto_connect;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());
        let core = Core::new(options, auth.clone(), recover, input_tx, snapshot_tx);
        runtime.spawn(run(core, cmd_rx, input_rx));

        let registry = Registry::default();
        let connection = Connection::new(cmd_tx.clone(), snapshot_rx, registry.clone(), capacity);
        let channels = Channels::new(cmd_tx.clone(), registry, capacity);
        if auto_connect {
            connection.connect();
        }
        Ok(Realtime {
            cmd_tx,
            auth,
            connection,
            channels,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Standalone token operations with this client's credentials, such as
    /// [`Auth::create_token_request`] for handing to other clients.
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// Obtain a fresh token now. When connected, the new token is sent to
    /// the server without reconnecting.
    pub fn authorize(&self, params: Option<TokenParams>) -> Deferred<TokenDetails> {
        let (resolver, deferred) = Deferred::pair();
        dispatch(&self.cmd_tx, Command::Authorize { params, resolver });
        deferred
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn close(&self) -> Deferred<()> {
        self.connection.close()
    }

    /// The identity confirmed by the server, or the configured one before
    /// connecting.
    pub fn client_id(&self) -> Option<String> {
        self.connection
            .snapshot()
            .client_id
            .or_else(|| self.auth.client_id().map(str::to_string))
    }
}

impl std::fmt::Debug for Realtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realtime")
            .field("connection", &self.connection)
            .field("channels", &self.channels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_outside_runtime_is_a_configuration_error() {
        let err = Realtime::new(ClientOptions::with_key("app.key:secret")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn invalid_options_fail_synchronously() {
        let err = Realtime::new(ClientOptions::default()).unwrap_err();
        assert_eq!(err.code(), error_code::NO_CREDENTIALS);

        let err = Realtime::new(ClientOptions::with_key("app.key:secret").with_recover("garbage"))
            .unwrap_err();
        assert_eq!(err.code(), error_code::INVALID_PARAMETER);
    }

    #[tokio::test]
    async fn client_id_falls_back_to_options() {
        let client = Realtime::new(
            ClientOptions::with_key("app.key:secret")
                .with_client_id("alice")
                .with_auto_connect(false),
        )
        .unwrap();
        assert_eq!(client.client_id().as_deref(), Some("alice"));
        assert_eq!(
            client.connection().state(),
            crate::connection::ConnectionState::Initialized
        );
    }
}
