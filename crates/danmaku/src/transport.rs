//! Transport abstraction used by the live session.
//!
//! A transport opens a message-oriented connection and hands back a
//! [`TransportHandle`]: a sender for outbound binary messages and close
//! requests, and a receiver of [`TransportEvent`]s. A successful `open` is
//! the "open" event; everything after arrives on the event receiver.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, trace, warn};

use crate::error::{DanmakuError, Result};

/// Close code for a deliberate, graceful shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the peer vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[cfg(any(test, feature = "test-util"))]
mod memory;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryPeer, MemoryTransport};

const EVENT_QUEUE: usize = 256;

/// Something that happened on an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A binary message arrived
    Message(Bytes),
    /// The connection was closed with a close code
    Closed { code: u16, reason: String },
    /// An I/O or protocol failure ended the connection
    Failure(String),
}

/// A request for the transport's write side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Send(Bytes),
    Close { code: u16, reason: String },
}

/// Write side of an open transport.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportSender {
    pub fn new(tx: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self { tx }
    }

    /// Queue a binary message. Fails only when the transport is gone;
    /// write errors are reported as [`TransportEvent::Failure`].
    pub fn send(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(TransportCommand::Send(data))
            .map_err(|_| DanmakuError::connection("transport is closed"))
    }

    /// Queue a close request. Closing an already-gone transport is a no-op.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(TransportCommand::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open transport.
#[derive(Debug)]
pub struct TransportHandle {
    pub sender: TransportSender,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens transports.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `url`, sending `headers` with the handshake.
    async fn open(&self, url: &str, headers: &[(String, String)]) -> Result<TransportHandle>;
}

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// WebSocket transport on top of tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str, headers: &[(String, String)]) -> Result<TransportHandle> {
        ensure_crypto_provider();

        let mut request = url.into_client_request()?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DanmakuError::config(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DanmakuError::config(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                DanmakuError::connection(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                ))
            })??;

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<TransportCommand>();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (mut sink, mut stream) = ws_stream.split();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(TransportCommand::Send(data)) => {
                            if let Err(e) = sink.send(Message::Binary(data)).await {
                                let _ = event_tx.send(TransportEvent::Failure(e.to_string())).await;
                                break;
                            }
                        }
                        Some(TransportCommand::Close { code, reason }) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            };
                            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                                debug!("Failed to send close frame: {}", e);
                            }
                            break;
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },

                    msg = stream.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if event_tx.send(TransportEvent::Message(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                                .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                            let _ = event_tx.send(TransportEvent::Closed { code, reason }).await;
                            break;
                        }
                        Some(Ok(other)) => {
                            trace!("Ignoring non-binary message: {:?}", other);
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            let _ = event_tx.send(TransportEvent::Failure(e.to_string())).await;
                            break;
                        }
                        None => {
                            let _ = event_tx
                                .send(TransportEvent::Closed {
                                    code: ABNORMAL_CLOSURE,
                                    reason: "stream ended".to_string(),
                                })
                                .await;
                            break;
                        }
                    },
                }
            }
            debug!("WebSocket pump stopped");
        });

        Ok(TransportHandle {
            sender: TransportSender::new(cmd_tx),
            events: event_rx,
        })
    }
}
