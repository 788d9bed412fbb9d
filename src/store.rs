// ABOUTME: Persistent bridge state in SQLite — portals, puppets, message and reaction mappings
// ABOUTME: Message rows form per-space edit chains; reaction rows enforce the per-user cap

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use telebridge_core::ids::{
    MatrixEventId, MatrixRoomId, MatrixUserId, PeerKind, TgChatId, TgMessageId, TgSpace, TgUserId,
};

/// One bridged conversation, keyed by `(tgid, tg_receiver)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalRecord {
    pub tgid: TgChatId,
    /// Scoping ID: equals `tgid` for everything except private chats, where
    /// it is the viewing account's user ID.
    pub tg_receiver: TgUserId,
    pub peer_kind: PeerKind,
    pub mxid: Option<MatrixRoomId>,
    pub title: Option<String>,
    pub about: Option<String>,
    pub username: Option<String>,
    pub photo_id: Option<i64>,
    pub megagroup: bool,
    pub encrypted: bool,
    /// Per-portal config override tree, merged over the global bridge
    /// section on lookup.
    pub local_config: serde_json::Value,
}

impl PortalRecord {
    pub fn new(tgid: TgChatId, tg_receiver: TgUserId, peer_kind: PeerKind) -> Self {
        Self {
            tgid,
            tg_receiver,
            peer_kind,
            mxid: None,
            title: None,
            about: None,
            username: None,
            photo_id: None,
            megagroup: false,
            encrypted: false,
            local_config: serde_json::Value::Null,
        }
    }
}

/// One (remote message, local event) pairing. Rows with the same
/// `(tg_msg, tg_space)` and increasing `edit_index` form an edit chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub tg_msg: TgMessageId,
    pub tg_space: TgSpace,
    pub mxid: MatrixEventId,
    pub mx_room: MatrixRoomId,
    /// 0 for the original, incrementing per content-changing edit.
    pub edit_index: i32,
    pub content_hash: [u8; 32],
    pub sender: Option<TgUserId>,
    pub redacted: bool,
}

/// Sentinel edit index meaning "resolve to the newest entry in the chain".
pub const EDIT_INDEX_LATEST: i32 = -1;

/// One bridged reaction: a local reaction event standing for a remote
/// user's reaction on a target message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRecord {
    pub mxid: MatrixEventId,
    pub mx_room: MatrixRoomId,
    pub target_mxid: MatrixEventId,
    pub tg_sender: TgUserId,
    /// Emoji string or internal custom-emoji identifier.
    pub reaction: String,
    pub created_at: String,
}

/// A remote user's ghost identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuppetRecord {
    pub id: TgUserId,
    pub display_name: Option<String>,
    /// Trust score of the current display name; see Puppet::accepts_name.
    pub name_quality: i64,
    /// Which session last had authority over the display name slot.
    pub name_source: Option<String>,
    pub username: Option<String>,
    pub photo_id: Option<i64>,
    pub is_bot: bool,
    pub is_channel: bool,
    pub is_premium: bool,
    pub custom_mxid: Option<MatrixUserId>,
}

impl PuppetRecord {
    pub fn new(id: TgUserId) -> Self {
        Self {
            id,
            display_name: None,
            name_quality: 0,
            name_source: None,
            username: None,
            photo_id: None,
            is_bot: false,
            is_channel: false,
            is_premium: false,
            custom_mxid: None,
        }
    }
}

#[derive(Clone)]
pub struct BridgeStore {
    db: Arc<Mutex<Connection>>,
}

impl BridgeStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        Self::init(conn, path.as_ref().display().to_string())
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS portal (
                tgid INTEGER NOT NULL,
                tg_receiver INTEGER NOT NULL,
                peer_kind TEXT NOT NULL,
                mxid TEXT UNIQUE,
                title TEXT,
                about TEXT,
                username TEXT,
                photo_id INTEGER,
                megagroup INTEGER NOT NULL DEFAULT 0,
                encrypted INTEGER NOT NULL DEFAULT 0,
                local_config TEXT NOT NULL DEFAULT 'null',
                PRIMARY KEY (tgid, tg_receiver)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS message (
                tg_msg INTEGER NOT NULL,
                tg_space INTEGER NOT NULL,
                mxid TEXT NOT NULL,
                mx_room TEXT NOT NULL,
                edit_index INTEGER NOT NULL DEFAULT 0,
                content_hash BLOB NOT NULL,
                sender INTEGER,
                redacted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tg_msg, tg_space, edit_index)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_message_mxid ON message (mxid, mx_room)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_message_room ON message (mx_room)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS reaction (
                mxid TEXT NOT NULL,
                mx_room TEXT NOT NULL,
                target_mxid TEXT NOT NULL,
                tg_sender INTEGER NOT NULL,
                reaction TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (target_mxid, tg_sender, reaction)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_reaction_room ON reaction (mx_room)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS puppet (
                id INTEGER PRIMARY KEY,
                display_name TEXT,
                name_quality INTEGER NOT NULL DEFAULT 0,
                name_source TEXT,
                username TEXT,
                photo_id INTEGER,
                is_bot INTEGER NOT NULL DEFAULT 0,
                is_channel INTEGER NOT NULL DEFAULT 0,
                is_premium INTEGER NOT NULL DEFAULT 0,
                custom_mxid TEXT
            )",
            [],
        )?;

        // Migration: premium flag landed after the first schema
        let _ = conn.execute(
            "ALTER TABLE puppet ADD COLUMN is_premium INTEGER NOT NULL DEFAULT 0",
            [],
        );

        tracing::info!(db = %location, "Bridge store initialized");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    // ------------------------------------------------------------------
    // Portals
    // ------------------------------------------------------------------

    pub fn get_portal(&self, tgid: TgChatId, receiver: TgUserId) -> Result<Option<PortalRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT tgid, tg_receiver, peer_kind, mxid, title, about, username, photo_id,
                    megagroup, encrypted, local_config
             FROM portal WHERE tgid = ?1 AND tg_receiver = ?2",
        )?;
        stmt.query_row(params![tgid.0, receiver.0], portal_from_row)
            .optional()
            .context("Failed to query portal")
    }

    pub fn get_portal_by_mxid(&self, mxid: &MatrixRoomId) -> Result<Option<PortalRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT tgid, tg_receiver, peer_kind, mxid, title, about, username, photo_id,
                    megagroup, encrypted, local_config
             FROM portal WHERE mxid = ?1",
        )?;
        stmt.query_row(params![mxid.0], portal_from_row)
            .optional()
            .context("Failed to query portal by room")
    }

    pub fn save_portal(&self, portal: &PortalRecord) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO portal (tgid, tg_receiver, peer_kind, mxid, title, about, username,
                                 photo_id, megagroup, encrypted, local_config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (tgid, tg_receiver) DO UPDATE SET
                 peer_kind = ?3, mxid = ?4, title = ?5, about = ?6, username = ?7,
                 photo_id = ?8, megagroup = ?9, encrypted = ?10, local_config = ?11",
            params![
                portal.tgid.0,
                portal.tg_receiver.0,
                portal.peer_kind.to_string(),
                portal.mxid.as_ref().map(|m| m.0.as_str()),
                portal.title,
                portal.about,
                portal.username,
                portal.photo_id,
                portal.megagroup as i32,
                portal.encrypted as i32,
                serde_json::to_string(&portal.local_config)?,
            ],
        )
        .context("Failed to save portal")?;
        Ok(())
    }

    /// Unbridge: clear the room association, keep the chat mapping.
    pub fn clear_portal_mxid(&self, tgid: TgChatId, receiver: TgUserId) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "UPDATE portal SET mxid = NULL, encrypted = 0 WHERE tgid = ?1 AND tg_receiver = ?2",
            params![tgid.0, receiver.0],
        )?;
        Ok(())
    }

    /// Hard delete: drop the portal row and purge all message/reaction
    /// history scoped to its room.
    pub fn delete_portal(&self, portal: &PortalRecord) -> Result<()> {
        let db = self.conn()?;
        if let Some(mxid) = &portal.mxid {
            db.execute("DELETE FROM message WHERE mx_room = ?1", params![mxid.0])?;
            db.execute("DELETE FROM reaction WHERE mx_room = ?1", params![mxid.0])?;
        }
        db.execute(
            "DELETE FROM portal WHERE tgid = ?1 AND tg_receiver = ?2",
            params![portal.tgid.0, portal.tg_receiver.0],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message mappings
    // ------------------------------------------------------------------

    pub fn insert_message(&self, msg: &MessageRecord) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO message (tg_msg, tg_space, mxid, mx_room, edit_index, content_hash,
                                  sender, redacted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.tg_msg.0,
                msg.tg_space.0,
                msg.mxid.0,
                msg.mx_room.0,
                msg.edit_index,
                msg.content_hash.as_slice(),
                msg.sender.map(|s| s.0),
                msg.redacted as i32,
            ],
        )
        .context("Failed to insert message mapping")?;
        Ok(())
    }

    /// Fetch one entry of an edit chain. `EDIT_INDEX_LATEST` resolves to the
    /// chain's newest entry.
    pub fn get_message(
        &self,
        tg_msg: TgMessageId,
        space: TgSpace,
        edit_index: i32,
    ) -> Result<Option<MessageRecord>> {
        let db = self.conn()?;
        let sql = if edit_index == EDIT_INDEX_LATEST {
            "SELECT tg_msg, tg_space, mxid, mx_room, edit_index, content_hash, sender, redacted
             FROM message WHERE tg_msg = ?1 AND tg_space = ?2
             ORDER BY edit_index DESC LIMIT 1"
        } else {
            "SELECT tg_msg, tg_space, mxid, mx_room, edit_index, content_hash, sender, redacted
             FROM message WHERE tg_msg = ?1 AND tg_space = ?2 AND edit_index = ?3"
        };
        let mut stmt = db.prepare(sql)?;
        let row = if edit_index == EDIT_INDEX_LATEST {
            stmt.query_row(params![tg_msg.0, space.0], message_from_row)
                .optional()?
        } else {
            stmt.query_row(params![tg_msg.0, space.0, edit_index], message_from_row)
                .optional()?
        };
        Ok(row)
    }

    pub fn get_message_by_mxid(
        &self,
        mxid: &MatrixEventId,
        room: &MatrixRoomId,
    ) -> Result<Option<MessageRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT tg_msg, tg_space, mxid, mx_room, edit_index, content_hash, sender, redacted
             FROM message WHERE mxid = ?1 AND mx_room = ?2",
        )?;
        stmt.query_row(params![mxid.0, room.0], message_from_row)
            .optional()
            .context("Failed to query message by event")
    }

    /// Edit index the next content-changing edit of this chain should get.
    pub fn next_edit_index(&self, tg_msg: TgMessageId, space: TgSpace) -> Result<i32> {
        let db = self.conn()?;
        let max: Option<i32> = db.query_row(
            "SELECT MAX(edit_index) FROM message WHERE tg_msg = ?1 AND tg_space = ?2",
            params![tg_msg.0, space.0],
            |row| row.get(0),
        )?;
        Ok(max.map(|m| m + 1).unwrap_or(0))
    }

    /// All original (edit index 0) mappings in a room, oldest insert first.
    pub fn messages_by_room(&self, room: &MatrixRoomId) -> Result<Vec<MessageRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT tg_msg, tg_space, mxid, mx_room, edit_index, content_hash, sender, redacted
             FROM message WHERE mx_room = ?1 AND edit_index = 0 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![room.0], message_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list messages by room")
    }

    /// Most recent N originals in a space, newest first.
    pub fn recent_messages(&self, space: TgSpace, limit: usize) -> Result<Vec<MessageRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT tg_msg, tg_space, mxid, mx_room, edit_index, content_hash, sender, redacted
             FROM message WHERE tg_space = ?1 AND edit_index = 0
             ORDER BY tg_msg DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![space.0, limit as i64], message_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list recent messages")
    }

    /// Original mapping for each of the given remote IDs, where one exists.
    pub fn first_by_remote_ids(
        &self,
        space: TgSpace,
        ids: &[TgMessageId],
    ) -> Result<HashMap<TgMessageId, MessageRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT tg_msg, tg_space, mxid, mx_room, edit_index, content_hash, sender, redacted
             FROM message WHERE tg_msg = ?1 AND tg_space = ?2 AND edit_index = 0",
        )?;
        let mut out = HashMap::new();
        for id in ids {
            if let Some(record) = stmt
                .query_row(params![id.0, space.0], message_from_row)
                .optional()?
            {
                out.insert(*id, record);
            }
        }
        Ok(out)
    }

    /// Record a redaction on the chain. Kept as a flag rather than a row
    /// delete so dedup and reply resolution still see the identity.
    pub fn mark_redacted(&self, mxid: &MatrixEventId, room: &MatrixRoomId) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "UPDATE message SET redacted = 1 WHERE mxid = ?1 AND mx_room = ?2",
            params![mxid.0, room.0],
        )?;
        Ok(())
    }

    /// Drop one mapping row outright (duplicate-delivery loser cleanup).
    pub fn delete_message(&self, mxid: &MatrixEventId, room: &MatrixRoomId) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "DELETE FROM message WHERE mxid = ?1 AND mx_room = ?2",
            params![mxid.0, room.0],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    pub fn insert_reaction(&self, reaction: &ReactionRecord) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO reaction (mxid, mx_room, target_mxid, tg_sender, reaction, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (target_mxid, tg_sender, reaction) DO UPDATE SET
                 mxid = ?1, created_at = ?6",
            params![
                reaction.mxid.0,
                reaction.mx_room.0,
                reaction.target_mxid.0,
                reaction.tg_sender.0,
                reaction.reaction,
                reaction.created_at,
            ],
        )
        .context("Failed to insert reaction")?;
        Ok(())
    }

    pub fn get_reaction(
        &self,
        target: &MatrixEventId,
        sender: TgUserId,
        reaction: &str,
    ) -> Result<Option<ReactionRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT mxid, mx_room, target_mxid, tg_sender, reaction, created_at
             FROM reaction WHERE target_mxid = ?1 AND tg_sender = ?2 AND reaction = ?3",
        )?;
        stmt.query_row(params![target.0, sender.0, reaction], reaction_from_row)
            .optional()
            .context("Failed to query reaction")
    }

    pub fn get_reaction_by_mxid(&self, mxid: &MatrixEventId) -> Result<Option<ReactionRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT mxid, mx_room, target_mxid, tg_sender, reaction, created_at
             FROM reaction WHERE mxid = ?1",
        )?;
        stmt.query_row(params![mxid.0], reaction_from_row)
            .optional()
            .context("Failed to query reaction by event")
    }

    /// All of one user's live reactions on a target, oldest first.
    pub fn reactions_by_user(
        &self,
        target: &MatrixEventId,
        sender: TgUserId,
    ) -> Result<Vec<ReactionRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT mxid, mx_room, target_mxid, tg_sender, reaction, created_at
             FROM reaction WHERE target_mxid = ?1 AND tg_sender = ?2 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![target.0, sender.0], reaction_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list reactions")
    }

    /// Every reaction on a target, all users, for full-list reconciliation.
    pub fn reactions_by_target(&self, target: &MatrixEventId) -> Result<Vec<ReactionRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT mxid, mx_room, target_mxid, tg_sender, reaction, created_at
             FROM reaction WHERE target_mxid = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![target.0], reaction_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list reactions by target")
    }

    pub fn delete_reaction(&self, mxid: &MatrixEventId) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM reaction WHERE mxid = ?1", params![mxid.0])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Puppets
    // ------------------------------------------------------------------

    pub fn get_puppet(&self, id: TgUserId) -> Result<Option<PuppetRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, display_name, name_quality, name_source, username, photo_id,
                    is_bot, is_channel, is_premium, custom_mxid
             FROM puppet WHERE id = ?1",
        )?;
        stmt.query_row(params![id.0], puppet_from_row)
            .optional()
            .context("Failed to query puppet")
    }

    pub fn get_puppet_by_custom_mxid(&self, mxid: &MatrixUserId) -> Result<Option<PuppetRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, display_name, name_quality, name_source, username, photo_id,
                    is_bot, is_channel, is_premium, custom_mxid
             FROM puppet WHERE custom_mxid = ?1",
        )?;
        stmt.query_row(params![mxid.0], puppet_from_row)
            .optional()
            .context("Failed to query puppet by custom mxid")
    }

    pub fn save_puppet(&self, puppet: &PuppetRecord) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO puppet (id, display_name, name_quality, name_source, username,
                                 photo_id, is_bot, is_channel, is_premium, custom_mxid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (id) DO UPDATE SET
                 display_name = ?2, name_quality = ?3, name_source = ?4, username = ?5,
                 photo_id = ?6, is_bot = ?7, is_channel = ?8, is_premium = ?9,
                 custom_mxid = ?10",
            params![
                puppet.id.0,
                puppet.display_name,
                puppet.name_quality,
                puppet.name_source,
                puppet.username,
                puppet.photo_id,
                puppet.is_bot as i32,
                puppet.is_channel as i32,
                puppet.is_premium as i32,
                puppet.custom_mxid.as_ref().map(|m| m.0.as_str()),
            ],
        )
        .context("Failed to save puppet")?;
        Ok(())
    }
}

fn portal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PortalRecord> {
    let peer_kind: String = row.get(2)?;
    let local_config: String = row.get(10)?;
    Ok(PortalRecord {
        tgid: TgChatId(row.get(0)?),
        tg_receiver: TgUserId(row.get(1)?),
        peer_kind: peer_kind.parse().unwrap_or(PeerKind::Chat),
        mxid: row.get::<_, Option<String>>(3)?.map(MatrixRoomId),
        title: row.get(4)?,
        about: row.get(5)?,
        username: row.get(6)?,
        photo_id: row.get(7)?,
        megagroup: row.get::<_, i32>(8)? != 0,
        encrypted: row.get::<_, i32>(9)? != 0,
        local_config: serde_json::from_str(&local_config).unwrap_or(serde_json::Value::Null),
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let hash_blob: Vec<u8> = row.get(5)?;
    let mut content_hash = [0u8; 32];
    if hash_blob.len() == 32 {
        content_hash.copy_from_slice(&hash_blob);
    }
    Ok(MessageRecord {
        tg_msg: TgMessageId(row.get(0)?),
        tg_space: TgSpace(row.get(1)?),
        mxid: MatrixEventId(row.get(2)?),
        mx_room: MatrixRoomId(row.get(3)?),
        edit_index: row.get(4)?,
        content_hash,
        sender: row.get::<_, Option<i64>>(6)?.map(TgUserId),
        redacted: row.get::<_, i32>(7)? != 0,
    })
}

fn reaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReactionRecord> {
    Ok(ReactionRecord {
        mxid: MatrixEventId(row.get(0)?),
        mx_room: MatrixRoomId(row.get(1)?),
        target_mxid: MatrixEventId(row.get(2)?),
        tg_sender: TgUserId(row.get(3)?),
        reaction: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn puppet_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PuppetRecord> {
    Ok(PuppetRecord {
        id: TgUserId(row.get(0)?),
        display_name: row.get(1)?,
        name_quality: row.get(2)?,
        name_source: row.get(3)?,
        username: row.get(4)?,
        photo_id: row.get(5)?,
        is_bot: row.get::<_, i32>(6)? != 0,
        is_channel: row.get::<_, i32>(7)? != 0,
        is_premium: row.get::<_, i32>(8)? != 0,
        custom_mxid: row.get::<_, Option<String>>(9)?.map(MatrixUserId),
    })
}
