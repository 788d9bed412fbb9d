// ABOUTME: Consumed interface of the remote Telegram transport (MTProto session)
// ABOUTME: Trait surface plus the typed error taxonomy handlers must match on

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use telebridge_core::ids::{PeerKind, TgChatId, TgMessageId, TgUserId};
use telebridge_core::media::{FormatEntity, ParticipantRole, TelegramMessage};

/// Errors the transport layer is required to distinguish. Handlers branch on
/// `FloodWait` and `PermissionDenied`; everything else is reported and the
/// item abandoned.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("flood wait: retry after {0} seconds")]
    FloodWait(u64),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("peer not found: {0}")]
    PeerNotFound(i64),
    #[error("file transfer failed: {0}")]
    Transfer(String),
    #[error("rpc error: {0}")]
    Rpc(String),
}

pub type TgResult<T> = Result<T, TelegramError>;

/// Remote chat metadata as returned by entity resolution.
#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub id: TgChatId,
    pub kind: PeerKind,
    pub title: Option<String>,
    pub about: Option<String>,
    pub username: Option<String>,
    pub photo_id: Option<i64>,
    pub member_count: Option<u64>,
    /// Supergroup rather than broadcast channel.
    pub megagroup: bool,
}

/// Remote user profile data.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub id: TgUserId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub photo_id: Option<i64>,
    pub is_bot: bool,
    pub is_premium: bool,
    /// Whether this profile came from a session that is a contact of the
    /// user (higher displayname trust) or from a bot lookup.
    pub from_contact: bool,
}

/// One chat participant with their role.
#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub user: TgUserId,
    pub role: ParticipantRole,
}

/// Confirmation of an outgoing send or edit.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: TgMessageId,
    pub timestamp: DateTime<Utc>,
}

/// Admin rights bundle for `edit_admin_rights`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdminRights {
    pub change_info: bool,
    pub post_messages: bool,
    pub edit_messages: bool,
    pub delete_messages: bool,
    pub ban_users: bool,
    pub invite_users: bool,
    pub pin_messages: bool,
    pub add_admins: bool,
}

impl AdminRights {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        *self == Self::default()
    }
}

/// Outgoing media payload, already fetched from Matrix media storage.
#[derive(Debug, Clone)]
pub enum OutgoingMedia {
    Photo {
        data: Vec<u8>,
    },
    File {
        name: String,
        mime: String,
        data: Vec<u8>,
    },
    Sticker {
        data: Vec<u8>,
        mime: String,
    },
    Location {
        lat: f64,
        long: f64,
    },
}

/// The remote protocol client, one per logged-in actor (a user session or
/// the relay bot). Wire-level framing, session storage, and reconnection
/// live behind this trait and are out of scope here.
#[async_trait]
pub trait TelegramClient: Send + Sync {
    /// The remote account this client acts as.
    fn actor_id(&self) -> TgUserId;

    async fn get_entity(&self, chat: TgChatId) -> TgResult<ChatInfo>;
    async fn get_user(&self, user: TgUserId) -> TgResult<UserInfo>;

    async fn send_text(
        &self,
        chat: TgChatId,
        text: &str,
        entities: &[FormatEntity],
        reply_to: Option<TgMessageId>,
    ) -> TgResult<SentMessage>;

    async fn send_media(
        &self,
        chat: TgChatId,
        media: OutgoingMedia,
        caption: &str,
        entities: &[FormatEntity],
        reply_to: Option<TgMessageId>,
    ) -> TgResult<SentMessage>;

    async fn edit_message(
        &self,
        chat: TgChatId,
        message: TgMessageId,
        text: &str,
        entities: &[FormatEntity],
    ) -> TgResult<SentMessage>;

    async fn delete_messages(&self, chat: TgChatId, messages: &[TgMessageId]) -> TgResult<()>;

    /// Native server-side forward; preserves forward semantics and skips a
    /// download/reupload round trip.
    async fn forward_message(
        &self,
        to_chat: TgChatId,
        from_chat: TgChatId,
        message: TgMessageId,
    ) -> TgResult<SentMessage>;

    /// History page, newest first, optionally before a message ID. Requires
    /// the acting account to be a member of the chat.
    async fn get_messages(
        &self,
        chat: TgChatId,
        limit: usize,
        before: Option<TgMessageId>,
    ) -> TgResult<Vec<TelegramMessage>>;

    async fn get_participants(&self, chat: TgChatId) -> TgResult<Vec<ParticipantInfo>>;

    async fn edit_admin_rights(
        &self,
        chat: TgChatId,
        user: TgUserId,
        rights: AdminRights,
    ) -> TgResult<()>;

    async fn kick_participant(&self, chat: TgChatId, user: TgUserId) -> TgResult<()>;

    async fn export_invite_link(&self, chat: TgChatId) -> TgResult<String>;

    async fn send_typing(&self, chat: TgChatId, typing: bool) -> TgResult<()>;

    async fn send_read_receipt(&self, chat: TgChatId, up_to: TgMessageId) -> TgResult<()>;

    /// Set or clear (None) this actor's reaction on a message.
    async fn send_reaction(
        &self,
        chat: TgChatId,
        message: TgMessageId,
        emoji: Option<&str>,
    ) -> TgResult<()>;

    /// Download a remote file by its file ID.
    async fn download_file(&self, file_id: i64) -> TgResult<Vec<u8>>;

    /// Download the server-generated preview thumbnail of a file, when one
    /// exists. Always PNG-renderable.
    async fn download_thumbnail(&self, file_id: i64) -> TgResult<Option<Vec<u8>>>;
}
