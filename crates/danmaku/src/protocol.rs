//! Handshake and keep-alive payloads carried inside frames.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{Frame, Operation};
use crate::error::{DanmakuError, Result};

/// Body of every heartbeat frame. The server only checks that one arrives.
pub const HEARTBEAT_BODY: &[u8] = b"[object Object]";

/// Protocol version requested in the auth payload.
///
/// Brotli (3) is downgraded to zlib (2) for compatibility.
pub const AUTH_PROTOCOL_VERSION: u8 = 2;

/// Platform tag sent in the auth payload.
pub const DEFAULT_PLATFORM: &str = "web";

/// Authentication payload sent as the first frame of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub uid: u64,
    pub roomid: u64,
    pub protover: u8,
    pub platform: String,
    #[serde(rename = "type")]
    pub auth_type: u8,
    pub key: String,
}

impl AuthPayload {
    pub fn new(uid: u64, room_id: u64, token: impl Into<String>) -> Self {
        Self {
            uid,
            roomid: room_id,
            protover: AUTH_PROTOCOL_VERSION,
            platform: DEFAULT_PLATFORM.to_string(),
            auth_type: 2,
            key: token.into(),
        }
    }

    /// Override the platform tag.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Override the requested protocol version.
    pub fn with_protover(mut self, protover: u8) -> Self {
        self.protover = protover;
        self
    }

    /// Build the AUTH frame carrying this payload as JSON.
    pub fn to_frame(&self) -> Result<Frame> {
        let body = serde_json::to_vec(self)?;
        Ok(Frame::new(Operation::Auth, body))
    }
}

/// Build a heartbeat frame.
pub fn heartbeat_frame() -> Frame {
    Frame::new(Operation::Heartbeat, Bytes::from_static(HEARTBEAT_BODY))
}

/// Read the popularity counter from a HEARTBEAT_REPLY body.
pub fn parse_popularity(body: &[u8]) -> Result<u32> {
    if body.len() < 4 {
        return Err(DanmakuError::protocol(format!(
            "heartbeat reply body too short: {} bytes",
            body.len()
        )));
    }
    Ok(BigEndian::read_u32(&body[0..4]))
}

/// Outcome carried by an AUTH_REPLY body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReply {
    /// `{"code":0}` or a body without a code.
    Accepted,
    /// A non-zero code. The server usually closes the socket shortly after.
    Rejected(i64),
}

#[derive(Deserialize)]
struct AuthReplyBody {
    #[serde(default)]
    code: i64,
}

/// Interpret an AUTH_REPLY body. Unparseable bodies count as accepted.
pub fn parse_auth_reply(body: &[u8]) -> AuthReply {
    match serde_json::from_slice::<AuthReplyBody>(body) {
        Ok(reply) if reply.code != 0 => AuthReply::Rejected(reply.code),
        _ => AuthReply::Accepted,
    }
}
