//! Danmu message types.
//!
//! [`DanmuMessage`] is what the live session decodes off the wire.
//! [`DisplayMessage`] is the render-side view the merge engine works on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Type of danmu message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DanmuType {
    /// Regular chat message
    #[default]
    Chat,
    /// Gift/donation
    Gift,
    /// Super chat (paid highlighted message)
    SuperChat,
    /// System message
    System,
    /// Other platform-specific message type
    Other,
}

/// A single danmu message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DanmuMessage {
    /// User ID of the sender
    pub user_id: String,
    /// Display name of the sender
    pub username: String,
    /// Message content
    pub content: String,
    /// Color of the message (hex string, optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Server-assigned priority hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    /// Timestamp when the message was sent
    pub timestamp: DateTime<Utc>,
    /// Type of message
    pub message_type: DanmuType,
    /// Platform-specific metadata (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl DanmuMessage {
    /// Create a new chat message.
    pub fn chat(
        user_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            content: content.into(),
            color: None,
            weight: None,
            timestamp: Utc::now(),
            message_type: DanmuType::Chat,
            metadata: None,
        }
    }

    /// Create a new gift message. The content reads `赠送 <gift> x<count>`.
    pub fn gift(
        user_id: impl Into<String>,
        username: impl Into<String>,
        gift_name: impl Into<String>,
        gift_count: u32,
    ) -> Self {
        let gift_name = gift_name.into();
        let content = format!("赠送 {} x{}", gift_name, gift_count);

        Self {
            message_type: DanmuType::Gift,
            ..Self::chat(user_id, username, content)
        }
        .with_metadata("gift_name", serde_json::json!(gift_name))
        .with_metadata("gift_count", serde_json::json!(gift_count))
    }

    /// Create a new super chat message.
    pub fn super_chat(
        user_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
        price: u64,
    ) -> Self {
        Self {
            message_type: DanmuType::SuperChat,
            ..Self::chat(user_id, username, content)
        }
        .with_metadata("price", serde_json::json!(price))
    }

    /// Set the color of the message.
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    /// Set the priority hint.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Add metadata to the message.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Render category of a display message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayKind {
    /// Scrolling text, eligible for merging
    #[default]
    Text,
    Gift,
    SuperChat,
    System,
}

impl From<DanmuType> for DisplayKind {
    fn from(value: DanmuType) -> Self {
        match value {
            DanmuType::Chat => Self::Text,
            DanmuType::Gift => Self::Gift,
            DanmuType::SuperChat => Self::SuperChat,
            DanmuType::System | DanmuType::Other => Self::System,
        }
    }
}

fn is_one(count: &u32) -> bool {
    *count == 1
}

fn one() -> u32 {
    1
}

/// One item queued for on-screen placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub content: String,
    /// Ingest-order timestamp in milliseconds
    pub show_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default)]
    pub kind: DisplayKind,
    /// Number of source messages folded into this item
    #[serde(default = "one", skip_serializing_if = "is_one")]
    pub merge_count: u32,
}

impl DisplayMessage {
    /// Create a text item.
    pub fn text(content: impl Into<String>, show_at: i64) -> Self {
        Self {
            content: content.into(),
            show_at,
            weight: None,
            kind: DisplayKind::Text,
            merge_count: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_kind(mut self, kind: DisplayKind) -> Self {
        self.kind = kind;
        self
    }

    /// Whether the merge engine may fold this item with identical ones.
    pub fn is_mergeable(&self) -> bool {
        self.kind == DisplayKind::Text && !self.content.trim().is_empty()
    }

    /// Build a display item from a decoded message, timestamped at `show_at`.
    pub fn from_danmu(message: &DanmuMessage, show_at: i64) -> Self {
        Self {
            content: message.content.clone(),
            show_at,
            weight: message.weight,
            kind: message.message_type.into(),
            merge_count: 1,
        }
    }
}

impl From<&DanmuMessage> for DisplayMessage {
    /// Uses the message timestamp in epoch milliseconds as `show_at`.
    fn from(message: &DanmuMessage) -> Self {
        Self::from_danmu(message, message.timestamp.timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_danmu_message_chat() {
        let msg = DanmuMessage::chat("user1", "TestUser", "Hello world!");

        assert_eq!(msg.user_id, "user1");
        assert_eq!(msg.username, "TestUser");
        assert_eq!(msg.content, "Hello world!");
        assert_eq!(msg.message_type, DanmuType::Chat);
        assert!(msg.metadata.is_none());
    }

    #[test]
    fn test_danmu_message_gift() {
        let msg = DanmuMessage::gift("user2", "GiftUser", "Rocket", 5);

        assert_eq!(msg.message_type, DanmuType::Gift);
        assert_eq!(msg.content, "赠送 Rocket x5");
        let metadata = msg.metadata.as_ref().unwrap();
        assert_eq!(metadata.get("gift_name").unwrap(), "Rocket");
        assert_eq!(metadata.get("gift_count").unwrap(), 5);
    }

    #[test]
    fn test_display_from_danmu() {
        let msg = DanmuMessage::chat("1", "a", "666").with_weight(3);
        let display = DisplayMessage::from_danmu(&msg, 1500);

        assert_eq!(display.content, "666");
        assert_eq!(display.show_at, 1500);
        assert_eq!(display.weight, Some(3));
        assert!(display.is_mergeable());

        let gift = DisplayMessage::from(&DanmuMessage::gift("1", "a", "Rocket", 1));
        assert_eq!(gift.kind, DisplayKind::Gift);
        assert!(!gift.is_mergeable());
    }

    #[test]
    fn test_blank_text_is_not_mergeable() {
        assert!(!DisplayMessage::text("   ", 0).is_mergeable());
    }

    #[test]
    fn test_display_message_json_defaults() {
        let msg: DisplayMessage = serde_json::from_str(r#"{"content":"hi","show_at":10}"#).unwrap();
        assert_eq!(msg, DisplayMessage::text("hi", 10));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({"content":"hi","show_at":10,"kind":"text"})
        );
    }
}
