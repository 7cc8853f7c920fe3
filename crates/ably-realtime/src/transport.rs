//! Transport abstraction and the WebSocket implementation.
//!
//! A transport lives for one connection attempt. The connection owns it and
//! pushes [`ProtocolMessage`]s through [`Transport::send`]; everything the
//! transport receives comes back through its [`TransportSink`].

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite;

use crate::Error;
use crate::event_loop::Input;
use crate::protocol::{
    ErrorInfo, Format, ProtocolMessage, decode_json, decode_msg, encode_json, encode_msg,
    error_code,
};

/// Everything a factory needs to open a transport.
#[derive(Debug, Clone)]
pub struct TransportParams {
    /// Complete connection URL including auth and protocol query parameters.
    pub url: url::Url,
    pub host: String,
    pub format: Format,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A decoded frame.
    Message(ProtocolMessage),
    /// The transport is gone. `None` means a clean close.
    Closed(Option<ErrorInfo>),
}

/// Delivers transport events into the client's event loop, tagged with the
/// connection attempt they belong to.
#[derive(Clone)]
pub struct TransportSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Input>,
}

impl TransportSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Input>) -> Self {
        TransportSink { generation, tx }
    }

    /// Returns `false` once the client has shut down.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Input::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

impl std::fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// An open transport.
pub trait Transport: Send {
    /// Queue a message for transmission. Fails only if the transport is gone.
    fn send(&mut self, msg: &ProtocolMessage) -> Result<(), Error>;

    /// Close the transport. No [`TransportEvent::Closed`] is emitted for a
    /// disconnect requested through this method.
    fn disconnect(&mut self);
}

/// Opens transports. Implement this to run the client over something other
/// than a real WebSocket (tests use an in-process fake).
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        params: TransportParams,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, Error>;
}

/// WebSocket transport over `tokio-tungstenite` with rustls.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransportFactory;

#[async_trait::async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn connect(
        &self,
        params: TransportParams,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, Error> {
        tracing::debug!(host = %params.host, format = params.format.as_str(), "Opening WebSocket");
        let (ws, _resp) = tokio_tungstenite::connect_async(params.url.as_str()).await?;
        let (mut ws_write, mut ws_read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<tungstenite::Message>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, tungstenite::Message::Close(_));
                if let Err(e) = ws_write.send(frame).await {
                    tracing::debug!("WebSocket write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_read.next().await {
                    Some(Ok(tungstenite::Message::Binary(data))) => match decode_msg(&data) {
                        Ok(msg) => {
                            if !sink.emit(TransportEvent::Message(msg)) {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!("Dropping malformed binary frame: {e}"),
                    },
                    Some(Ok(tungstenite::Message::Text(text))) => match decode_json(text.as_str()) {
                        Ok(msg) => {
                            if !sink.emit(TransportEvent::Message(msg)) {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!("Dropping malformed text frame: {e}"),
                    },
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        tracing::info!(?frame, "WebSocket closed by server");
                        break None;
                    }
                    Some(Ok(_)) => {
                        // Ignore ping, pong and raw frames
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {e}");
                        break Some(ErrorInfo::new(
                            error_code::DISCONNECTED,
                            None,
                            format!("WebSocket error: {e}"),
                        ));
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break None;
                    }
                }
            };
            sink.emit(TransportEvent::Closed(reason));
        });

        Ok(Box::new(WebSocketTransport {
            out_tx,
            format: params.format,
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
        }))
    }
}

struct WebSocketTransport {
    out_tx: mpsc::UnboundedSender<tungstenite::Message>,
    format: Format,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, msg: &ProtocolMessage) -> Result<(), Error> {
        let frame = match self.format {
            Format::MsgPack => tungstenite::Message::Binary(encode_msg(msg)?.into()),
            Format::Json => tungstenite::Message::Text(encode_json(msg)?.into()),
        };
        self.out_tx.send(frame).map_err(|_| {
            Error::Connection(ErrorInfo::new(
                error_code::DISCONNECTED,
                None,
                "WebSocket transport is closed",
            ))
        })
    }

    fn disconnect(&mut self) {
        self.reader.abort();
        // The writer flushes queued frames, sends the close frame and exits.
        if self.out_tx.send(tungstenite::Message::Close(None)).is_err() {
            self.writer.abort();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
