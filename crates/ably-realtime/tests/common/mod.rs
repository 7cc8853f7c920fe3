//! In-process transport that lets tests play the server.
#![allow(dead_code)]

use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ably_realtime::protocol::{Action, ConnectionDetails, ErrorInfo, ProtocolMessage, flags};
use ably_realtime::{
    Channel, ClientOptions, ConnectionState, Error, Realtime, Transport, TransportEvent,
    TransportFactory, TransportParams, TransportSink,
};
use tokio::sync::mpsc;

pub type TestResult<T> = Result<T, Box<dyn StdError>>;

/// How long a test waits for the client to do something.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ---------------------------------------------------------------------------
// Fake transport
// ---------------------------------------------------------------------------

struct FakeFactory {
    attempts: mpsc::UnboundedSender<FakeConnection>,
    refuse: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl TransportFactory for FakeFactory {
    async fn connect(
        &self,
        params: TransportParams,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, Error> {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let refused = self.refuse.load(Ordering::SeqCst);
        let _ = self.attempts.send(FakeConnection {
            params,
            refused,
            sink,
            sent: sent_rx,
            closed: Arc::clone(&closed),
        });
        if refused {
            return Err(Error::Connection(ErrorInfo::new(
                80003,
                None,
                "connection refused",
            )));
        }
        Ok(Box::new(FakeTransport {
            sent: Some(sent_tx),
            closed,
        }))
    }
}

struct FakeTransport {
    sent: Option<mpsc::UnboundedSender<ProtocolMessage>>,
    closed: Arc<AtomicBool>,
}

impl Transport for FakeTransport {
    fn send(&mut self, msg: &ProtocolMessage) -> Result<(), Error> {
        if let Some(sent) = &self.sent {
            let _ = sent.send(msg.clone());
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sent = None;
    }
}

/// The server side of every connection attempt the client makes.
pub struct FakeServer {
    attempts: mpsc::UnboundedReceiver<FakeConnection>,
    refuse: Arc<AtomicBool>,
}

impl FakeServer {
    pub fn new() -> (FakeServer, Arc<dyn TransportFactory>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicBool::new(false));
        let factory = FakeFactory {
            attempts: tx,
            refuse: Arc::clone(&refuse),
        };
        (
            FakeServer {
                attempts: rx,
                refuse,
            },
            Arc::new(factory),
        )
    }

    /// Fail every following attempt at the transport level.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// The next connection attempt, refused or not.
    pub async fn accept(&mut self) -> TestResult<FakeConnection> {
        let attempt = tokio::time::timeout(STEP_TIMEOUT, self.attempts.recv())
            .await
            .map_err(|_| "timed out waiting for a connection attempt")?;
        Ok(attempt.ok_or("client dropped its transport factory")?)
    }

    pub fn try_accept(&mut self) -> Option<FakeConnection> {
        self.attempts.try_recv().ok()
    }
}

pub struct FakeConnection {
    pub params: TransportParams,
    pub refused: bool,
    sink: TransportSink,
    sent: mpsc::UnboundedReceiver<ProtocolMessage>,
    closed: Arc<AtomicBool>,
}

impl FakeConnection {
    pub fn query(&self, name: &str) -> Option<String> {
        self.params
            .url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Deliver a frame to the client.
    pub fn deliver(&self, msg: ProtocolMessage) {
        self.sink.emit(TransportEvent::Message(msg));
    }

    /// Drop the connection from the server side.
    pub fn drop_connection(&self, reason: Option<ErrorInfo>) {
        self.sink.emit(TransportEvent::Closed(reason));
    }

    /// `true` once the client has disconnected this transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The next frame the client sent.
    pub async fn next_sent(&mut self) -> TestResult<ProtocolMessage> {
        let msg = tokio::time::timeout(STEP_TIMEOUT, self.sent.recv())
            .await
            .map_err(|_| "timed out waiting for the client to send")?;
        Ok(msg.ok_or("transport closed by client")?)
    }

    /// The next frame the client sent, which must carry `action`.
    pub async fn expect_sent(&mut self, action: Action) -> TestResult<ProtocolMessage> {
        let msg = self.next_sent().await?;
        assert_eq!(msg.action, action, "unexpected frame: {msg:?}");
        Ok(msg)
    }

    pub fn try_sent(&mut self) -> Option<ProtocolMessage> {
        self.sent.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

pub fn connected_msg(id: &str, key: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: Action::Connected,
        connection_id: Some(id.into()),
        connection_key: Some(key.into()),
        connection_serial: Some(0),
        connection_details: Some(ConnectionDetails {
            connection_key: Some(key.into()),
            connection_state_ttl: Some(120_000),
            max_idle_interval: Some(15_000),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn attached_msg(channel: &str, serial: &str, flags: i32) -> ProtocolMessage {
    ProtocolMessage {
        action: Action::Attached,
        channel: Some(channel.into()),
        channel_serial: Some(serial.into()),
        flags: (flags != 0).then_some(flags),
        ..Default::default()
    }
}

pub fn ack_msg(serial: i64, count: i64) -> ProtocolMessage {
    ProtocolMessage {
        action: Action::Ack,
        msg_serial: Some(serial),
        count: Some(count),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

pub const TEST_KEY: &str = "appid.keyname:keysecret";

pub fn test_options(factory: Arc<dyn TransportFactory>) -> ClientOptions {
    ClientOptions::with_key(TEST_KEY)
        .with_auto_connect(false)
        .with_transport_factory(factory)
}

/// Connect and complete the handshake as connection `id`.
pub async fn connect(
    client: &Realtime,
    server: &mut FakeServer,
    id: &str,
) -> TestResult<FakeConnection> {
    client.connect();
    let conn = server.accept().await?;
    conn.deliver(connected_msg(id, &format!("{id}-key")));
    client
        .connection()
        .wait_for_state(ConnectionState::Connected)
        .await?;
    Ok(conn)
}

/// Attach `channel`, answering its ATTACH with serial `s1`.
pub async fn attach(channel: &Channel, conn: &mut FakeConnection, with_presence: bool) -> TestResult<()> {
    let attached = channel.attach();
    let msg = conn.expect_sent(Action::Attach).await?;
    assert_eq!(msg.channel.as_deref(), Some(channel.name()));
    let flags = if with_presence { flags::HAS_PRESENCE } else { 0 };
    conn.deliver(attached_msg(channel.name(), "s1", flags));
    attached.await?;
    Ok(())
}
