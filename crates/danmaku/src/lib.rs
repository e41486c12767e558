//! Danmaku Live: real-time live chat (danmu/弾幕) pipeline.
//!
//! This crate connects to a live room's chat WebSocket, decodes the binary
//! frame protocol, fans decoded events out to any number of consumers and
//! folds repeated chat into merged items and highlights for rendering.
//!
//! ## Protocol
//!
//! - [`Frame`] - One binary protocol unit, see [`codec`]
//! - [`AuthPayload`] - Auth frame body sent when a connection opens
//! - [`parse_notification`] - MESSAGE body JSON to [`LiveEvent`]
//!
//! ## Session
//!
//! - [`DanmakuClient`] - Connect, authenticate, heartbeat and reconnect
//! - [`Transport`] - Connection provider, [`WebSocketTransport`] by default
//! - [`FanOut`] - Bounded drop-oldest broadcast of live events
//!
//! The `test-util` feature adds `MemoryTransport`, an in-process transport
//! whose server side is scripted by the caller.
//!
//! ## Merging
//!
//! - [`DanmakuMerger`] / [`merge`] - Fold repeated text in one batch
//! - [`MergeBatcher`] - Batch windows over a live stream
//!
//! ## Example
//!
//! ```no_run
//! use danmaku_live::{ClientConfig, DanmakuClient, LiveEvent};
//!
//! # async fn run() -> danmaku_live::Result<()> {
//! let client = DanmakuClient::websocket(ClientConfig::default());
//! let mut events = client.subscribe();
//! client.connect("wss://example.com/sub", "token", 1, 0)?;
//!
//! while let Some(event) = events.recv().await {
//!     if let LiveEvent::Danmu(msg) = event {
//!         println!("{}: {}", msg.username, msg.content);
//!     }
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod merge;
pub mod message;
pub mod notification;
pub mod protocol;
pub mod transport;

pub use batcher::MergeBatcher;
pub use channel::{FanOut, Subscription};
pub use client::{ConnectParams, ConnectionState, DanmakuClient};
pub use codec::{DecodeLimits, Frame, Operation, ProtocolVersion, decode, decode_with_limits, encode};
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::{DanmakuError, DecodeError, Result};
pub use event::{DanmuControlEvent, LiveEvent};
pub use merge::{DanmakuMerger, HighlightEvent, MergeConfig, MergedBatchResult, merge, resolve_overlaps};
pub use message::{DanmuMessage, DanmuType, DisplayKind, DisplayMessage};
pub use notification::parse_notification;
pub use protocol::{AuthPayload, AuthReply};
pub use transport::{
    Transport, TransportCommand, TransportEvent, TransportHandle, TransportSender,
    WebSocketTransport,
};
#[cfg(any(test, feature = "test-util"))]
pub use transport::{MemoryPeer, MemoryTransport};
