// ABOUTME: Consumed interface of the local Matrix side — per-ghost intents and event content model
// ABOUTME: MatrixIntent trait, IntentProvider, Formatter seam, and power-level state

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use telebridge_core::ids::{MatrixEventId, MatrixRoomId, MatrixUserId, TgUserId};
use telebridge_core::media::FormatEntity;

/// Matrix message types the pipeline emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    #[serde(rename = "m.text")]
    Text,
    #[serde(rename = "m.notice")]
    Notice,
    #[serde(rename = "m.emote")]
    Emote,
    #[serde(rename = "m.image")]
    Image,
    #[serde(rename = "m.file")]
    File,
    #[serde(rename = "m.audio")]
    Audio,
    #[serde(rename = "m.video")]
    Video,
    #[serde(rename = "m.location")]
    Location,
    #[serde(rename = "m.sticker")]
    Sticker,
}

/// Attachment metadata carried in a message's `info` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "w", skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(rename = "h", skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// Voice message amplitude envelope.
    #[serde(rename = "org.matrix.msc3246.waveform", skip_serializing_if = "Option::is_none")]
    pub waveform: Option<Vec<u8>>,
}

impl MediaInfo {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Relation to another event: reply or edit replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    #[serde(rename = "m.in_reply_to")]
    ReplyTo { event_id: MatrixEventId },
    #[serde(rename = "m.replace")]
    Replace { event_id: MatrixEventId },
}

/// One `m.room.message`-shaped payload. The portal builds these; the intent
/// adapter serializes them onto the wire unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub msgtype: MsgType,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    /// mxc URI for media messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<MediaInfo>,
    /// Set when a caption is folded into the media event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_uri: Option<String>,
    /// Packed identity of the remote message this content was forwarded
    /// from. Clients copy it when a user forwards the event, which lets the
    /// bridge turn that back into a native remote forward.
    #[serde(rename = "io.telebridge.forward", skip_serializing_if = "Option::is_none")]
    pub forward_source: Option<String>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: MsgType::Text,
            body: body.into(),
            format: None,
            formatted_body: None,
            url: None,
            info: None,
            filename: None,
            geo_uri: None,
            forward_source: None,
            relates_to: None,
        }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            msgtype: MsgType::Notice,
            ..Self::text(body)
        }
    }

    pub fn html(body: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            format: Some("org.matrix.custom.html".to_string()),
            formatted_body: Some(html.into()),
            ..Self::text(body)
        }
    }

    /// Strip the legacy reply-quote fallback from a body so nested replies
    /// do not accumulate quoted history.
    pub fn strip_reply_fallback(body: &str) -> &str {
        if !body.starts_with("> ") {
            return body;
        }
        match body.find("\n\n") {
            Some(idx) => &body[idx + 2..],
            None => body,
        }
    }

    /// Reply-to reference with a synthesized quote header, or a bare
    /// reference for non-text payloads where a rendered fallback would be
    /// noise.
    pub fn set_reply(&mut self, target: MatrixEventId, quoted: Option<(&MatrixUserId, &str)>) {
        if let Some((sender, quoted_body)) = quoted {
            if matches!(self.msgtype, MsgType::Text | MsgType::Notice | MsgType::Emote) {
                let stripped = Self::strip_reply_fallback(quoted_body);
                let quoted_lines: String = stripped
                    .lines()
                    .map(|l| format!("> {}\n", l))
                    .collect();
                self.body = format!("> <{}>\n{}\n{}", sender, quoted_lines.trim_end(), self.body);
            }
        }
        self.relates_to = Some(Relation::ReplyTo { event_id: target });
    }
}

/// Room power-level state, the subset the bridge reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerLevels {
    #[serde(default)]
    pub users: HashMap<MatrixUserId, i64>,
    #[serde(default)]
    pub users_default: i64,
    #[serde(default)]
    pub events_default: i64,
    #[serde(default = "default_state_level")]
    pub state_default: i64,
    #[serde(default = "default_state_level")]
    pub redact: i64,
    #[serde(default = "default_state_level")]
    pub kick: i64,
    #[serde(default = "default_state_level")]
    pub ban: i64,
    #[serde(default)]
    pub invite: i64,
}

fn default_state_level() -> i64 {
    50
}

impl Default for PowerLevels {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            users_default: 0,
            events_default: 0,
            state_default: 50,
            redact: 50,
            kick: 50,
            ban: 50,
            invite: 0,
        }
    }
}

impl PowerLevels {
    pub fn level_of(&self, user: &MatrixUserId) -> i64 {
        self.users.get(user).copied().unwrap_or(self.users_default)
    }
}

/// Parameters for portal room creation.
#[derive(Debug, Clone, Default)]
pub struct RoomCreateRequest {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub invite: Vec<MatrixUserId>,
    pub is_direct: bool,
    pub encrypted: bool,
    pub power_levels: Option<PowerLevels>,
}

/// Reason a local membership ends, for the removal fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalKind {
    Kick,
    Ban,
    Leave,
}

/// Client surface acting as one Matrix user: the bridge bot, a ghost
/// puppet, or a double puppet. Retries on transient HTTP failure happen
/// below this trait.
#[async_trait]
pub trait MatrixIntent: Send + Sync {
    fn user_id(&self) -> &MatrixUserId;

    async fn create_room(&self, request: RoomCreateRequest) -> Result<MatrixRoomId>;

    async fn send_message(
        &self,
        room: &MatrixRoomId,
        content: &MessageContent,
    ) -> Result<MatrixEventId>;

    /// Arbitrary state event, content as raw JSON.
    async fn send_state_event(
        &self,
        room: &MatrixRoomId,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> Result<MatrixEventId>;

    /// Non-state custom event (delivery status signals and similar).
    async fn send_custom_event(
        &self,
        room: &MatrixRoomId,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<MatrixEventId>;

    async fn redact(
        &self,
        room: &MatrixRoomId,
        event: &MatrixEventId,
        reason: Option<&str>,
    ) -> Result<MatrixEventId>;

    async fn invite_user(&self, room: &MatrixRoomId, user: &MatrixUserId) -> Result<()>;
    async fn kick_user(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
        reason: Option<&str>,
    ) -> Result<()>;
    async fn ban_user(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
        reason: Option<&str>,
    ) -> Result<()>;
    async fn leave_room(&self, room: &MatrixRoomId) -> Result<()>;
    async fn join_room(&self, room: &MatrixRoomId) -> Result<()>;

    async fn get_power_levels(&self, room: &MatrixRoomId) -> Result<PowerLevels>;
    async fn set_power_levels(&self, room: &MatrixRoomId, levels: &PowerLevels) -> Result<()>;

    async fn get_room_members(&self, room: &MatrixRoomId) -> Result<Vec<MatrixUserId>>;

    /// Upload to media storage, returns the mxc URI.
    async fn upload_media(&self, mime: &str, data: Vec<u8>) -> Result<String>;
    async fn download_media(&self, mxc: &str) -> Result<Vec<u8>>;

    async fn mark_read(&self, room: &MatrixRoomId, event: &MatrixEventId) -> Result<()>;
    async fn set_typing(&self, room: &MatrixRoomId, typing: bool) -> Result<()>;

    /// Fetch a previously sent message event's content, for reply quoting
    /// and edit-target checks.
    async fn get_message_content(
        &self,
        room: &MatrixRoomId,
        event: &MatrixEventId,
    ) -> Result<Option<MessageContent>>;

    async fn set_display_name(&self, name: &str) -> Result<()>;
    async fn set_avatar_url(&self, mxc: &str) -> Result<()>;
}

/// Hands out intents for the identities the portal acts through. Breaks the
/// portal/puppet/user import cycle: the orchestrating layer wires a concrete
/// provider, the portal only sees this capability.
pub trait IntentProvider: Send + Sync {
    /// The bridge's own service account.
    fn bot(&self) -> Arc<dyn MatrixIntent>;
    /// Ghost intent for a remote user.
    fn for_puppet(&self, user: TgUserId) -> Arc<dyn MatrixIntent>;
    /// Double-puppet intent for a real local account, if one is bound.
    fn for_double_puppet(&self, user: &MatrixUserId) -> Option<Arc<dyn MatrixIntent>>;
    /// The ghost MXID a remote user maps to, without constructing an intent.
    fn puppet_mxid(&self, user: TgUserId) -> MatrixUserId;
    /// Inverse of `puppet_mxid`: None for MXIDs outside the ghost namespace.
    fn puppet_id_of(&self, mxid: &MatrixUserId) -> Option<TgUserId>;
}

/// Bidirectional markup translation, consumed as a pure function.
pub trait Formatter: Send + Sync {
    /// Remote entities -> (plain body, optional HTML body).
    fn telegram_to_matrix(&self, body: &str, entities: &[FormatEntity]) -> (String, Option<String>);
    /// Matrix body/HTML -> (remote body, entity list).
    fn matrix_to_telegram(&self, body: &str, html: Option<&str>) -> (String, Vec<FormatEntity>);
}

/// Formatter that passes text through unformatted. The real HTML converter
/// is a separate collaborator; this keeps the pipeline total without it.
pub struct PlainFormatter;

impl Formatter for PlainFormatter {
    fn telegram_to_matrix(&self, body: &str, _entities: &[FormatEntity]) -> (String, Option<String>) {
        (body.to_string(), None)
    }

    fn matrix_to_telegram(&self, body: &str, _html: Option<&str>) -> (String, Vec<FormatEntity>) {
        (body.to_string(), Vec::new())
    }
}

/// Event type used for per-message delivery status signals back to the
/// sending client.
pub const MESSAGE_STATUS_EVENT: &str = "com.beeper.message_send_status";

/// Content of a delivery status event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatus {
    #[serde(rename = "m.relates_to")]
    pub relates_to: serde_json::Value,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageStatus {
    pub fn success(target: &MatrixEventId) -> Self {
        Self {
            relates_to: serde_json::json!({
                "rel_type": "m.reference",
                "event_id": target.as_str(),
            }),
            status: "SUCCESS".to_string(),
            error: None,
        }
    }

    pub fn failure(target: &MatrixEventId, error: impl Into<String>) -> Self {
        Self {
            relates_to: serde_json::json!({
                "rel_type": "m.reference",
                "event_id": target.as_str(),
            }),
            status: "FAIL_PERMANENT".to_string(),
            error: Some(error.into()),
        }
    }
}
