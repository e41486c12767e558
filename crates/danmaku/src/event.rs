//! Typed events delivered to fan-out subscribers.
//!
//! A live session yields chat messages, control events that change session
//! semantics, the popularity counter from heartbeat replies, and any
//! notification the parser does not model.

use serde::{Deserialize, Serialize};

use crate::message::DanmuMessage;

/// Control events produced by the danmu stream that affect session semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DanmuControlEvent {
    /// The live stream ended / was closed by the platform.
    StreamClosed {
        /// Optional human-readable reason provided by the platform.
        message: Option<String>,
    },
    /// Room info changed (title/category).
    RoomInfoChanged {
        title: Option<String>,
        category: Option<String>,
        parent_category: Option<String>,
    },
    /// Viewer counters pushed by the room.
    Counter { kind: String, value: u64 },
}

/// A single item on the fan-out channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiveEvent {
    Danmu(DanmuMessage),
    Control(DanmuControlEvent),
    /// Popularity counter from a heartbeat reply
    Popularity { value: u32 },
    /// A notification without a typed model
    Notification {
        cmd: String,
        payload: serde_json::Value,
    },
}

impl LiveEvent {
    /// The chat message carried by this event, if any.
    pub fn as_danmu(&self) -> Option<&DanmuMessage> {
        match self {
            Self::Danmu(msg) => Some(msg),
            _ => None,
        }
    }
}
