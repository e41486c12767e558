//! In-process transport for driving a session from tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{EVENT_QUEUE, Transport, TransportCommand, TransportEvent, TransportHandle, TransportSender};
use crate::codec::{self, Frame};
use crate::error::{DanmakuError, Result};

/// In-process transport whose far end is driven by the caller.
///
/// Each successful `open` produces a [`MemoryPeer`] retrievable with
/// [`MemoryTransport::accept`]. Opens can be scripted to fail.
#[derive(Debug)]
pub struct MemoryTransport {
    failures: Mutex<VecDeque<String>>,
    opens: Mutex<Vec<(String, Instant)>>,
    peer_tx: mpsc::UnboundedSender<MemoryPeer>,
    peer_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            failures: Mutex::new(VecDeque::new()),
            opens: Mutex::new(Vec::new()),
            peer_tx,
            peer_rx: tokio::sync::Mutex::new(peer_rx),
        }
    }

    /// Make the next `open` fail with `reason`.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.failures.lock().push_back(reason.into());
    }

    /// Wait for the next successfully opened connection.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.peer_rx.lock().await.recv().await
    }

    /// Number of `open` calls so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    /// When each `open` call happened.
    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().iter().map(|(_, at)| *at).collect()
    }

    /// URL passed to each `open` call.
    pub fn open_urls(&self) -> Vec<String> {
        self.opens.lock().iter().map(|(url, _)| url.clone()).collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str, _headers: &[(String, String)]) -> Result<TransportHandle> {
        self.opens.lock().push((url.to_string(), Instant::now()));

        if let Some(reason) = self.failures.lock().pop_front() {
            return Err(DanmakuError::connection(reason));
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let _ = self.peer_tx.send(MemoryPeer {
            commands: cmd_rx,
            events: event_tx,
        });

        Ok(TransportHandle {
            sender: TransportSender::new(cmd_tx),
            events: event_rx,
        })
    }
}

/// Far end of a [`MemoryTransport`] connection.
#[derive(Debug)]
pub struct MemoryPeer {
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
}

impl MemoryPeer {
    /// Next command written by the client. `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<TransportCommand> {
        self.commands.recv().await
    }

    /// Next frame sent by the client, skipping nothing. `None` if the client
    /// closed the connection instead.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        match self.recv().await? {
            TransportCommand::Send(data) => codec::decode(&data).ok()?.into_iter().next(),
            TransportCommand::Close { .. } => None,
        }
    }

    /// Deliver a binary message to the client.
    pub async fn send(&self, data: impl Into<Bytes>) -> bool {
        self.events
            .send(TransportEvent::Message(data.into()))
            .await
            .is_ok()
    }

    /// Close the connection from the server side.
    pub async fn close(&self, code: u16, reason: &str) -> bool {
        self.events
            .send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await
            .is_ok()
    }

    /// Report a transport failure to the client.
    pub async fn fail(&self, reason: &str) -> bool {
        self.events
            .send(TransportEvent::Failure(reason.to_string()))
            .await
            .is_ok()
    }
}
