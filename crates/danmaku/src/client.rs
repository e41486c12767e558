//! Live danmaku session: connect, authenticate, heartbeat, reconnect.
//!
//! [`DanmakuClient`] owns at most one transport at a time. Every explicit
//! `connect`/`disconnect` starts a new generation; tasks spawned for an older
//! generation (open attempts, readers, heartbeats, reconnect timers) notice
//! the mismatch and stand down instead of acting on a session that no longer
//! exists.
//!
//! Inbound buffers are decoded on the reader task. MESSAGE bodies are handed
//! to a separate dispatch task for JSON parsing so a slow parse never delays
//! the next read; the dispatch queue is bounded and drops new bodies when full.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{FanOut, Subscription};
use crate::codec::{self, Operation};
use crate::config::ClientConfig;
use crate::error::{DanmakuError, Result};
use crate::event::LiveEvent;
use crate::notification::parse_notification;
use crate::protocol::{AuthPayload, AuthReply, heartbeat_frame, parse_auth_reply, parse_popularity};
use crate::transport::{
    NORMAL_CLOSURE, Transport, TransportEvent, TransportHandle, TransportSender,
    WebSocketTransport,
};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Parameters of the room the session is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub url: String,
    pub token: String,
    pub room_id: u64,
    pub uid: u64,
}

#[derive(Default)]
struct SessionState {
    generation: u64,
    params: Option<ConnectParams>,
    sender: Option<TransportSender>,
    reader: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// Transport open in progress
    opener: Option<JoinHandle<()>>,
}

impl SessionState {
    /// Stop the tasks bound to the current transport and release it.
    fn release_transport(&mut self) -> Option<TransportSender> {
        for task in [
            self.heartbeat.take(),
            self.reader.take(),
            self.dispatcher.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.sender.take()
    }

    fn reconnect_pending(&self) -> bool {
        self.reconnect.as_ref().is_some_and(|task| !task.is_finished())
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    events: FanOut<LiveEvent>,
    session: Mutex<SessionState>,
    connected: AtomicBool,
    authenticated: AtomicBool,
    retry_count: AtomicU32,
    popularity: AtomicU32,
    state_tx: watch::Sender<ConnectionState>,
    weak_self: Weak<Inner>,
}

/// Handle to a live danmaku session. Cheap to clone.
#[derive(Clone)]
pub struct DanmakuClient {
    inner: Arc<Inner>,
}

impl DanmakuClient {
    /// Create a session that opens connections through `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let events = FanOut::with_capacity(config.channel_capacity);

        let inner = Arc::new_cyclic(|weak_self| Inner {
            transport,
            config,
            events,
            session: Mutex::new(SessionState::default()),
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            popularity: AtomicU32::new(0),
            state_tx,
            weak_self: weak_self.clone(),
        });

        Self { inner }
    }

    /// Create a session over WebSocket.
    pub fn websocket(config: ClientConfig) -> Self {
        Self::new(Arc::new(WebSocketTransport::new()), config)
    }

    /// Attach to a room.
    ///
    /// Any existing transport is closed first. The open happens in the
    /// background; watch [`DanmakuClient::watch_state`] for progress. Must be
    /// called within a tokio runtime.
    pub fn connect(
        &self,
        url: impl Into<String>,
        token: impl Into<String>,
        room_id: u64,
        uid: u64,
    ) -> Result<()> {
        let url = url.into();
        let parsed = url::Url::parse(&url)
            .map_err(|e| DanmakuError::config(format!("invalid url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(DanmakuError::config(format!(
                "unsupported scheme {} (expected ws or wss)",
                parsed.scheme()
            )));
        }

        let params = ConnectParams {
            url,
            token: token.into(),
            room_id,
            uid,
        };

        {
            let mut session = self.inner.session.lock();
            session.generation += 1;
            session.params = Some(params);
            if let Some(task) = session.reconnect.take() {
                task.abort();
            }
            if let Some(sender) = session.release_transport() {
                sender.close(NORMAL_CLOSURE, "reconnecting");
            }
            self.inner.connected.store(false, Ordering::Release);
            let generation = session.generation;
            self.inner.spawn_open(&mut session, generation);
        }
        Ok(())
    }

    /// Detach from the room. Idempotent and safe from any state.
    ///
    /// When this returns, heartbeat, reconnect and in-flight open tasks are
    /// stopped, the transport was asked to close normally, and nothing reconnects until
    /// the next [`DanmakuClient::connect`].
    pub async fn disconnect(&self) {
        let (tasks, sender) = {
            let mut session = self.inner.session.lock();
            session.generation += 1;
            session.params = None;
            self.inner.connected.store(false, Ordering::Release);
            self.inner.set_state(ConnectionState::Closing);

            let tasks: Vec<JoinHandle<()>> = [
                session.reconnect.take(),
                session.opener.take(),
                session.heartbeat.take(),
                session.reader.take(),
                session.dispatcher.take(),
            ]
            .into_iter()
            .flatten()
            .collect();
            (tasks, session.sender.take())
        };

        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        if let Some(sender) = sender {
            sender.close(NORMAL_CLOSURE, "client disconnect");
        }

        self.inner.authenticated.store(false, Ordering::Release);
        // A newer connect may have started while the tasks wound down
        let session = self.inner.session.lock();
        if session.params.is_none() {
            self.inner.set_state(ConnectionState::Disconnected);
        }
        drop(session);
        debug!("Danmaku session disconnected");
    }

    /// Whether a transport is open. May lag the real state by one event.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Whether the server acknowledged the auth frame on this transport.
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Reconnect attempts since the last successful open.
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::Acquire)
    }

    /// Last popularity value reported by a heartbeat reply.
    pub fn popularity(&self) -> u32 {
        self.inner.popularity.load(Ordering::Acquire)
    }

    /// Parameters of the current room, if attached.
    pub fn params(&self) -> Option<ConnectParams> {
        self.inner.session.lock().params.clone()
    }

    /// Subscribe to decoded live events.
    pub fn subscribe(&self) -> Subscription<LiveEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    /// Start opening a transport for `generation`, replacing any open still
    /// in flight.
    fn spawn_open(self: &Arc<Self>, session: &mut SessionState, generation: u64) {
        let task = tokio::spawn(Inner::open(self.clone(), generation));
        if let Some(previous) = session.opener.replace(task) {
            previous.abort();
        }
    }

    /// Open a transport for `generation`. Shared by `connect` and reconnects.
    async fn open(self: Arc<Self>, generation: u64) {
        let params = {
            let session = self.session.lock();
            if session.generation != generation {
                return;
            }
            let Some(params) = session.params.clone() else {
                return;
            };
            self.set_state(ConnectionState::Connecting);
            params
        };

        info!(
            url = %params.url,
            room_id = params.room_id,
            attempt = self.retry_count.load(Ordering::Acquire),
            "Opening danmaku connection"
        );

        match self
            .transport
            .open(&params.url, &self.config.header_pairs())
            .await
        {
            Ok(handle) => self.on_open(generation, &params, handle),
            Err(e) => {
                warn!("Connection failed: {}", e);
                self.on_transport_failure(generation);
            }
        }
    }

    fn on_open(&self, generation: u64, params: &ConnectParams, handle: TransportHandle) {
        let TransportHandle { sender, events } = handle;

        let mut session = self.session.lock();
        if session.generation != generation {
            debug!("Discarding transport opened for a stale session");
            sender.close(NORMAL_CLOSURE, "superseded");
            return;
        }

        // Only one transport per session
        if let Some(previous) = session.release_transport() {
            previous.close(NORMAL_CLOSURE, "replaced");
        }

        self.retry_count.store(0, Ordering::Release);
        self.authenticated.store(false, Ordering::Release);

        let auth = AuthPayload::new(params.uid, params.room_id, params.token.clone())
            .with_platform(self.config.platform.clone())
            .with_protover(self.config.protover)
            .to_frame()
            .and_then(|frame| sender.send(frame.encode()));
        if let Err(e) = auth {
            warn!("Failed to send auth frame: {}", e);
            drop(session);
            self.on_transport_failure(generation);
            return;
        }

        self.connected.store(true, Ordering::Release);
        info!(room_id = params.room_id, "Connected, auth frame sent");

        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.config.dispatch_queue.max(1));
        session.dispatcher = Some(tokio::spawn(dispatch_loop(
            self.events.clone(),
            dispatch_rx,
        )));
        session.reader = Some(tokio::spawn(read_loop(
            self.weak_self.clone(),
            generation,
            events,
            dispatch_tx,
        )));
        if let Some(previous) = session.heartbeat.replace(tokio::spawn(heartbeat_loop(
            self.weak_self.clone(),
            generation,
            sender.clone(),
        ))) {
            previous.abort();
        }
        session.sender = Some(sender);
        self.set_state(ConnectionState::Connected);
    }

    /// Decode one inbound buffer and route its frames.
    fn handle_buffer(&self, data: &[u8], dispatch_tx: &mpsc::Sender<Bytes>) {
        let frames = match codec::decode_with_limits(data, &self.config.decode_limits()) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(len = data.len(), "Dropping undecodable buffer: {}", e);
                return;
            }
        };

        for frame in frames {
            match frame.operation {
                Operation::HeartbeatReply => match parse_popularity(&frame.body) {
                    Ok(value) => {
                        trace!(value, "Heartbeat reply");
                        self.popularity.store(value, Ordering::Release);
                        self.events.publish(LiveEvent::Popularity { value });
                    }
                    Err(e) => debug!("Malformed heartbeat reply: {}", e),
                },
                Operation::AuthReply => match parse_auth_reply(&frame.body) {
                    AuthReply::Accepted => {
                        self.authenticated.store(true, Ordering::Release);
                        info!("Auth acknowledged");
                    }
                    AuthReply::Rejected(code) => {
                        warn!(code, "Auth reply reports a rejection");
                    }
                },
                Operation::Message => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = dispatch_tx.try_send(frame.body)
                    {
                        warn!("Dispatch queue full, dropping message");
                    }
                }
                other => debug!(operation = ?other, "Ignoring frame"),
            }
        }
    }

    fn on_close(&self, generation: u64, code: u16, reason: &str) {
        if code != NORMAL_CLOSURE {
            warn!(code, reason, "Connection closed abnormally");
            self.on_transport_failure(generation);
            return;
        }

        info!(reason, "Connection closed normally");
        let mut session = self.session.lock();
        if session.generation != generation {
            return;
        }
        session.release_transport();
        self.connected.store(false, Ordering::Release);
        self.authenticated.store(false, Ordering::Release);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Tear down the transport of `generation` and schedule a reconnect.
    fn on_transport_failure(&self, generation: u64) {
        let mut session = self.session.lock();
        if session.generation != generation {
            return;
        }

        session.release_transport();
        self.connected.store(false, Ordering::Release);
        self.authenticated.store(false, Ordering::Release);
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect(&mut session, generation);
    }

    /// At most one reconnect is pending at a time.
    fn schedule_reconnect(&self, session: &mut SessionState, generation: u64) {
        if session.reconnect_pending() {
            debug!("Reconnect already scheduled");
            return;
        }

        let retry_count = self.retry_count.load(Ordering::Acquire);
        let delay = self.config.reconnect.delay_for(retry_count);
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = retry_count + 1,
            "Scheduling reconnect"
        );

        let weak = self.weak_self.clone();
        session.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut session = inner.session.lock();
            if session.generation != generation {
                return;
            }
            // Clear the slot so a failed open can schedule the next attempt
            session.reconnect = None;
            inner.retry_count.fetch_add(1, Ordering::AcqRel);
            inner.spawn_open(&mut session, generation);
        }));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        for task in [session.reconnect.take(), session.opener.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if let Some(sender) = session.release_transport() {
            sender.close(NORMAL_CLOSURE, "client dropped");
        }
    }
}

async fn read_loop(
    weak: Weak<Inner>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    dispatch_tx: mpsc::Sender<Bytes>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(data) => inner.handle_buffer(&data, &dispatch_tx),
            TransportEvent::Closed { code, reason } => {
                inner.on_close(generation, code, &reason);
                return;
            }
            TransportEvent::Failure(e) => {
                warn!("Transport failure: {}", e);
                inner.on_transport_failure(generation);
                return;
            }
        }
    }

    // Event stream ended without a close event
    if let Some(inner) = weak.upgrade() {
        inner.on_transport_failure(generation);
    }
}

async fn dispatch_loop(events: FanOut<LiveEvent>, mut bodies: mpsc::Receiver<Bytes>) {
    while let Some(body) = bodies.recv().await {
        match parse_notification(&body) {
            Ok(event) => {
                events.publish(event);
            }
            Err(e) => debug!("Failed to parse notification: {}", e),
        }
    }
}

async fn heartbeat_loop(weak: Weak<Inner>, generation: u64, sender: TransportSender) {
    let Some(period) = weak.upgrade().map(|inner| inner.config.heartbeat_interval()) else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.connected.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = sender.send(heartbeat_frame().encode()) {
            warn!("Failed to send heartbeat: {}", e);
            inner.on_transport_failure(generation);
            return;
        }
        trace!("Sent heartbeat");
    }
}
