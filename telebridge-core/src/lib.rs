// ABOUTME: Platform-agnostic portal machinery for the telebridge bridge
// ABOUTME: Identity types, dedup cache, keyed locks, remote message model, renderers, config

pub mod config;
pub mod dedup;
pub mod ids;
pub mod locks;
pub mod media;
pub mod render;

pub use config::{BridgeConfig, Config};
pub use dedup::{DedupCache, DedupMapping};
pub use ids::{
    MatrixEventId, MatrixRoomId, MatrixUserId, PeerKind, ShortMessageId, TgChatId, TgMessageId,
    TgSpace, TgUserId,
};
pub use locks::KeyedLocks;
pub use media::{TelegramAction, TelegramMedia, TelegramMessage};
