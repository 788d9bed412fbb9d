// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates required fields and merges per-portal overrides over the global bridge section

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub homeserver: HomeserverConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeserverConfig {
    /// Base URL of the homeserver client API.
    pub address: String,
    /// Server name used in ghost user IDs and room aliases.
    pub domain: String,
    /// MXID of the bridge's own service account.
    pub bot_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub api_id: i32,
    pub api_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    /// Attempts for code/QR login waits before the flow is abandoned.
    #[serde(default = "default_login_retries")]
    pub login_retries: u32,
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
}

// Custom Debug impl to redact sensitive fields
impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_id", &self.api_id)
            .field("api_hash", &"[REDACTED]")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "[REDACTED]"))
            .field("login_retries", &self.login_retries)
            .field("login_timeout_secs", &self.login_timeout_secs)
            .finish()
    }
}

fn default_login_retries() -> u32 {
    5
}

fn default_login_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "./telebridge.db".to_string()
}

/// Whether a chat ID may be bridged at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Bridge everything except listed chats.
    #[default]
    Deny,
    /// Bridge only listed chats.
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatFilter {
    #[serde(default)]
    pub mode: FilterMode,
    #[serde(default)]
    pub list: Vec<i64>,
}

impl ChatFilter {
    pub fn permits(&self, chat_id: i64) -> bool {
        let listed = self.list.contains(&chat_id);
        match self.mode {
            FilterMode::Allow => listed,
            FilterMode::Deny => !listed,
        }
    }
}

/// The bridge section. Every field here may be overridden per portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Refuse to materialize rooms for chats above this member count.
    #[serde(default)]
    pub max_member_count: Option<u64>,
    #[serde(default)]
    pub chat_filter: ChatFilter,
    #[serde(default = "default_dedup_cache_size")]
    pub dedup_cache_size: usize,
    /// Fold media captions into the media event instead of a second event.
    #[serde(default)]
    pub caption_in_message: bool,
    /// Bridge m.notice events to Telegram.
    #[serde(default = "default_true")]
    pub bridge_notices: bool,
    /// Render bot-authored Telegram messages as m.notice.
    #[serde(default)]
    pub bot_messages_as_notices: bool,
    /// Images above this many bytes are sent as plain files.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    /// Images above this many pixels are sent as plain files.
    #[serde(default = "default_max_image_pixels")]
    pub max_image_pixels: u64,
    /// Animated stickers are downsized to at most this dimension.
    #[serde(default = "default_sticker_dimension")]
    pub animated_sticker_max_dimension: u32,
    /// Mirror the remote contact's name/avatar onto 1:1 portal rooms.
    #[serde(default = "default_true")]
    pub private_chat_portal_meta: bool,
    /// Enable end-to-end encryption on newly created portal rooms.
    #[serde(default)]
    pub encryption_default: bool,
    /// Simultaneous reactions one user may hold on one message.
    #[serde(default = "default_reaction_cap")]
    pub max_reactions_per_user: usize,
    /// Reaction cap for premium remote accounts.
    #[serde(default = "default_premium_reaction_cap")]
    pub max_reactions_premium: usize,
    /// Messages fetched per portal when backfilling history.
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,
    #[serde(default = "default_true")]
    pub backfill_enabled: bool,
    /// Post a visible room notice when delivery to Telegram fails.
    #[serde(default = "default_true")]
    pub delivery_error_notices: bool,
    /// Bot command prefix used in generated vote/play commands.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Self-destructing photo notice lead time cap, seconds.
    #[serde(default = "default_max_ttl_secs")]
    pub max_scheduled_ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_dedup_cache_size() -> usize {
    crate::dedup::DEFAULT_CACHE_LEN
}

fn default_max_image_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_image_pixels() -> u64 {
    4096 * 4096
}

fn default_sticker_dimension() -> u32 {
    256
}

fn default_reaction_cap() -> usize {
    1
}

fn default_premium_reaction_cap() -> usize {
    3
}

fn default_backfill_limit() -> usize {
    50
}

fn default_command_prefix() -> String {
    "!tg".to_string()
}

fn default_max_ttl_secs() -> u64 {
    86400
}

impl Default for BridgeConfig {
    fn default() -> Self {
        // Round-trip through an empty table so the serde defaults are the
        // single source of truth.
        toml::from_str("").expect("empty bridge config must deserialize")
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        let mut config: Config = toml::from_str(&raw).context("Failed to parse config file")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TELEBRIDGE_HOMESERVER") {
            self.homeserver.address = v;
        }
        if let Ok(v) = std::env::var("TELEBRIDGE_ACCESS_TOKEN") {
            self.homeserver.access_token = Some(v);
        }
        if let Ok(v) = std::env::var("TELEBRIDGE_TG_API_HASH") {
            self.telegram.api_hash = v;
        }
        if let Ok(v) = std::env::var("TELEBRIDGE_DB_PATH") {
            self.database.path = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.homeserver.address.is_empty() {
            anyhow::bail!("homeserver.address must not be empty");
        }
        if !self.homeserver.bot_user_id.starts_with('@') {
            anyhow::bail!(
                "homeserver.bot_user_id must be a full MXID, got '{}'",
                self.homeserver.bot_user_id
            );
        }
        if self.telegram.api_hash.is_empty() {
            anyhow::bail!("telegram.api_hash must not be empty");
        }
        if self.bridge.dedup_cache_size == 0 {
            anyhow::bail!("bridge.dedup_cache_size must be at least 1");
        }
        // Encryption implies portal meta; rejecting the combination beats
        // silently overriding it.
        if self.bridge.encryption_default && !self.bridge.private_chat_portal_meta {
            anyhow::bail!(
                "bridge.encryption_default requires bridge.private_chat_portal_meta"
            );
        }
        if let Some(0) = self.bridge.max_member_count {
            anyhow::bail!("bridge.max_member_count of 0 would block every chat");
        }
        Ok(())
    }

    /// Effective bridge settings for one portal: the portal's stored
    /// override tree merged over the global bridge section at matching key
    /// paths.
    pub fn bridge_for_portal(&self, overrides: &serde_json::Value) -> Result<BridgeConfig> {
        if overrides.is_null() {
            return Ok(self.bridge.clone());
        }
        let mut base = serde_json::to_value(&self.bridge)
            .context("Failed to serialize global bridge config")?;
        merge_json(&mut base, overrides);
        serde_json::from_value(base).context("Invalid per-portal config overrides")
    }
}

/// Recursively merge `overlay` into `base`: objects merge per key, anything
/// else in the overlay replaces the base value.
pub fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay.clone(),
    }
}
