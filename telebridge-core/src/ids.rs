// ABOUTME: Identity newtypes for both networks plus the space-scoping rules
// ABOUTME: Defines Telegram chat/user/message IDs, Matrix room/event/user IDs, and packed short IDs

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Telegram chat identifier. For user peers this is the other party's user
/// ID; for groups and channels it is the chat's own ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TgChatId(pub i64);

/// Telegram user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TgUserId(pub i64);

/// Telegram message identifier. Only unique within a space, never globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TgMessageId(pub i32);

/// The ID namespace a message ID is scoped to.
///
/// Channel and supergroup message IDs share one namespace per chat, so the
/// space is the chat ID itself. Private-chat and legacy-group message IDs
/// live in each viewing account's namespace, so the space is the viewer's
/// user ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TgSpace(pub i64);

/// What kind of remote peer a portal fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    /// 1:1 private chat. Message IDs are per-viewer, chat IDs are per-viewer.
    User,
    /// Legacy basic group. Message IDs are per-viewer and not even unique
    /// within the group's history as seen across accounts.
    Chat,
    /// Supergroup or broadcast channel. Message IDs are per-chat.
    Channel,
}

impl PeerKind {
    /// Whether message IDs for this peer kind share a per-chat namespace.
    pub fn has_shared_id_space(self) -> bool {
        matches!(self, PeerKind::Channel)
    }

    /// Whether dedup must fall back to content hashing because the ID space
    /// is not reliable within the chat.
    pub fn requires_hash_dedup(self) -> bool {
        matches!(self, PeerKind::Chat)
    }

    /// The space a message in this kind of chat belongs to, given the chat
    /// and the viewing account.
    pub fn space_for(self, chat: TgChatId, receiver: TgUserId) -> TgSpace {
        match self {
            PeerKind::Channel => TgSpace(chat.0),
            PeerKind::User | PeerKind::Chat => TgSpace(receiver.0),
        }
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKind::User => write!(f, "user"),
            PeerKind::Chat => write!(f, "chat"),
            PeerKind::Channel => write!(f, "channel"),
        }
    }
}

impl std::str::FromStr for PeerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(PeerKind::User),
            "chat" => Ok(PeerKind::Chat),
            "channel" => Ok(PeerKind::Channel),
            other => anyhow::bail!("Unknown peer kind: {}", other),
        }
    }
}

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_inner!(TgChatId, TgUserId, TgMessageId, TgSpace);

/// A Matrix room ID (`!opaque:server`). Kept as an owned string so the
/// matrix-sdk stays at the transport edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixRoomId(pub String);

/// A Matrix event ID (`$opaque`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixEventId(pub String);

/// A Matrix user ID (`@local:server`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixUserId(pub String);

impl MatrixRoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl MatrixEventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Placeholder event IDs stand in for a mapping whose local event has
    /// not been published yet; see the dedup two-phase protocol.
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with("$tmp-")
    }
}

impl MatrixUserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

display_inner!(MatrixRoomId, MatrixEventId, MatrixUserId);

/// Error decoding a packed short ID.
#[derive(Debug, thiserror::Error)]
pub enum ShortIdError {
    #[error("invalid base64 in short ID: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("short ID has wrong length: expected 12 bytes, got {0}")]
    Length(usize),
}

/// A `(space, message ID)` pair packed into a compact token.
///
/// Used anywhere a message identity must survive a round trip through plain
/// chat text: poll vote commands, game play commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortMessageId {
    pub space: TgSpace,
    pub message: TgMessageId,
}

impl ShortMessageId {
    pub fn new(space: TgSpace, message: TgMessageId) -> Self {
        Self { space, message }
    }

    /// Encode as URL-safe unpadded base64 over 12 big-endian bytes.
    pub fn encode(&self) -> String {
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&self.space.0.to_be_bytes());
        buf[8..].copy_from_slice(&self.message.0.to_be_bytes());
        URL_SAFE_NO_PAD.encode(buf)
    }

    pub fn decode(token: &str) -> Result<Self, ShortIdError> {
        let bytes = URL_SAFE_NO_PAD.decode(token)?;
        if bytes.len() != 12 {
            return Err(ShortIdError::Length(bytes.len()));
        }
        let mut space = [0u8; 8];
        space.copy_from_slice(&bytes[..8]);
        let mut msg = [0u8; 4];
        msg.copy_from_slice(&bytes[8..]);
        Ok(Self {
            space: TgSpace(i64::from_be_bytes(space)),
            message: TgMessageId(i32::from_be_bytes(msg)),
        })
    }
}

impl fmt::Display for ShortMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
