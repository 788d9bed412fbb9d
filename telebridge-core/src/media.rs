// ABOUTME: Data model for remote Telegram messages as seen by the portal
// ABOUTME: Tagged unions for media kinds, formatting entities, and service actions

use crate::ids::{TgChatId, TgMessageId, TgUserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One message received from the remote network, already lifted out of the
/// wire format by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub id: TgMessageId,
    pub sender: Option<TgUserId>,
    pub timestamp: DateTime<Utc>,
    /// Plain text body or media caption.
    pub body: String,
    /// Inline formatting over `body`, in remote entity form.
    pub entities: Vec<FormatEntity>,
    pub media: Option<TelegramMedia>,
    /// Message ID this one replies to, in the same space.
    pub reply_to: Option<TgMessageId>,
    pub forward_from: Option<ForwardOrigin>,
    /// Set when the sender is a bot account.
    pub from_bot: bool,
    /// Edit timestamp if this delivery is an edit of an earlier message.
    pub edit_date: Option<DateTime<Utc>>,
}

impl TelegramMessage {
    /// A message with neither body nor media carries nothing bridgeable.
    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty() && self.media.is_none()
    }
}

/// Where a forwarded message originally came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardOrigin {
    User(TgUserId),
    Channel { chat: TgChatId, post: Option<TgMessageId> },
    /// Sender hid their account; only a display name is available.
    HiddenUser(String),
}

/// All media kinds the conversion pipeline understands.
///
/// `Unsupported` is a real variant, not a catch-all `_` arm: every new media
/// kind the transport learns to parse must either get its own variant here
/// or be delivered as `Unsupported` so it surfaces as a labeled notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelegramMedia {
    Photo(Photo),
    Document(Document),
    Location(GeoPoint),
    LiveLocation {
        point: GeoPoint,
        period_secs: u32,
    },
    Venue {
        point: GeoPoint,
        title: String,
        address: String,
    },
    Poll(Poll),
    Dice {
        #[serde(rename = "dice_kind")]
        kind: DiceKind,
        value: i32,
    },
    Game {
        title: String,
        description: String,
    },
    Contact(Contact),
    /// Parsed but not convertible; bridged as an update-your-bridge notice.
    Unsupported {
        type_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub file_id: i64,
    /// Available resolutions; conversion picks the largest by pixel count.
    pub sizes: Vec<PhotoSize>,
    /// Self-destruct timer in seconds, if the photo disappears.
    pub ttl_secs: Option<u32>,
}

impl Photo {
    pub fn largest(&self) -> Option<&PhotoSize> {
        self.sizes
            .iter()
            .max_by_key(|s| (s.width as u64) * (s.height as u64))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSize {
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// Generic file media plus its specializations, distinguished by attribute
/// rather than separate wire types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub file_id: i64,
    pub file_name: Option<String>,
    pub mime_type: String,
    pub size_bytes: u64,
    pub kind: DocumentKind,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<u32>,
    /// Voice message amplitude envelope, 0-255 per sample.
    pub waveform: Option<Vec<u8>>,
    /// Sticker alt emoji, when the document is a sticker.
    pub sticker_alt: Option<String>,
    pub has_thumbnail: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    File,
    Video,
    Gif,
    Audio,
    Voice,
    Sticker,
    AnimatedSticker,
    VideoSticker,
}

impl DocumentKind {
    /// Sticker variants whose native codec Matrix clients cannot render;
    /// these get transcoded before upload.
    pub fn needs_sticker_conversion(self) -> bool {
        matches!(self, DocumentKind::AnimatedSticker | DocumentKind::VideoSticker)
    }

    pub fn is_sticker(self) -> bool {
        matches!(
            self,
            DocumentKind::Sticker | DocumentKind::AnimatedSticker | DocumentKind::VideoSticker
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub long: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub question: String,
    pub answers: Vec<String>,
    pub closed: bool,
    pub multiple_choice: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiceKind {
    Die,
    Dart,
    Basketball,
    Bowling,
    Football,
    SlotMachine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: Option<TgUserId>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub phone_number: String,
}

impl Contact {
    pub fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

/// One inline formatting entity over a UTF-16 offset range of the body, the
/// remote protocol's native representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatEntity {
    pub offset: u32,
    pub length: u32,
    pub kind: FormatKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormatKind {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Code,
    Pre { language: Option<String> },
    Blockquote,
    Spoiler,
    Mention { user: TgUserId },
    Link { url: String },
}

/// Non-message service updates the portal reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelegramAction {
    TitleChanged(String),
    AboutChanged(String),
    PhotoChanged { photo_id: Option<i64> },
    UserJoined(TgUserId),
    UserLeft {
        user: TgUserId,
        /// Admin who removed them, when it was a kick rather than a leave.
        actor: Option<TgUserId>,
    },
    AdminChanged { user: TgUserId, role: ParticipantRole },
    PinnedMessage(TgMessageId),
}

/// Remote participant role, as reported by participant listings and admin
/// change updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Creator,
    /// Admin; the flag records whether they may promote others.
    Admin { can_add_admins: bool },
    Regular,
}
