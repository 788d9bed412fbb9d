// ABOUTME: Portal state machine — maps one remote chat to one local room and owns its lifecycle
// ABOUTME: Resolution registry, room creation critical section, metadata sync, unbridge/delete

pub mod backfill;
pub mod convert;
pub mod inbound;
pub mod outbound;

use crate::intent::{IntentProvider, Formatter, PowerLevels, RemovalKind, RoomCreateRequest};
use crate::power_levels::apply_remote_role;
use crate::puppet::PuppetRegistry;
use crate::store::{BridgeStore, PortalRecord};
use crate::telegram::{ChatInfo, TelegramClient, TelegramError};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use telebridge_core::config::{BridgeConfig, Config};
use telebridge_core::dedup::DedupCache;
use telebridge_core::ids::{
    MatrixEventId, MatrixRoomId, MatrixUserId, PeerKind, TgChatId, TgSpace, TgUserId,
};
use telebridge_core::locks::KeyedLocks;
use tokio::sync::Mutex;

/// Everything a portal needs from the outside world, wired once by the
/// orchestrating layer. Portals, puppets, and users never import each other
/// directly; they meet through these capabilities.
pub struct PortalDeps {
    pub store: BridgeStore,
    pub config: Arc<Config>,
    pub intents: Arc<dyn IntentProvider>,
    pub formatter: Arc<dyn Formatter>,
    pub puppets: Arc<PuppetRegistry>,
}

/// Why a portal refuses to materialize a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgingBlock {
    TooManyMembers { count: u64, limit: u64 },
    FilteredOut,
}

impl std::fmt::Display for BridgingBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgingBlock::TooManyMembers { count, limit } => {
                write!(f, "chat has {} members, limit is {}", count, limit)
            }
            BridgingBlock::FilteredOut => write!(f, "chat is excluded by the chat filter"),
        }
    }
}

/// One bridged conversation.
pub struct Portal {
    deps: Arc<PortalDeps>,
    pub tgid: TgChatId,
    pub tg_receiver: TgUserId,
    pub peer_kind: PeerKind,
    record: Mutex<PortalRecord>,
    pub(crate) dedup: Mutex<DedupCache>,
    pub(crate) send_locks: KeyedLocks<TgSpace>,
    pub(crate) reaction_locks: KeyedLocks<MatrixEventId>,
    create_lock: Mutex<()>,
    pub(crate) backfill_lock: Mutex<()>,
    pub(crate) backfill_active: AtomicBool,
    deleted: AtomicBool,
    blocked: StdMutex<Option<BridgingBlock>>,
    placeholder_seq: AtomicU64,
}

impl Portal {
    fn new(record: PortalRecord, deps: Arc<PortalDeps>) -> Self {
        let cache_len = deps.config.bridge.dedup_cache_size;
        Self {
            tgid: record.tgid,
            tg_receiver: record.tg_receiver,
            peer_kind: record.peer_kind,
            dedup: Mutex::new(DedupCache::new(record.peer_kind, cache_len)),
            record: Mutex::new(record),
            send_locks: KeyedLocks::new(),
            reaction_locks: KeyedLocks::new(),
            create_lock: Mutex::new(()),
            backfill_lock: Mutex::new(()),
            backfill_active: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            blocked: StdMutex::new(None),
            placeholder_seq: AtomicU64::new(0),
            deps,
        }
    }

    pub fn deps(&self) -> &PortalDeps {
        &self.deps
    }

    pub async fn mxid(&self) -> Option<MatrixRoomId> {
        self.record.lock().await.mxid.clone()
    }

    pub async fn title(&self) -> Option<String> {
        self.record.lock().await.title.clone()
    }

    pub async fn encrypted(&self) -> bool {
        self.record.lock().await.encrypted
    }

    /// Effective bridge config: the portal's stored overrides merged over
    /// the global section.
    pub async fn bridge_config(&self) -> BridgeConfig {
        let record = self.record.lock().await;
        self.deps
            .config
            .bridge_for_portal(&record.local_config)
            .unwrap_or_else(|e| {
                tracing::warn!(chat = %self.tgid, error = %e, "Invalid portal config overrides, using global");
                self.deps.config.bridge.clone()
            })
    }

    /// The message-ID namespace for updates delivered through `actor`'s
    /// session: the chat itself for channels, the viewing account otherwise.
    pub fn space_for(&self, actor: TgUserId) -> TgSpace {
        self.peer_kind.space_for(self.tgid, actor)
    }

    /// Fails fast once the portal has been deleted; stale references must
    /// not reanimate a purged portal.
    pub fn ensure_alive(&self) -> Result<()> {
        if self.deleted.load(Ordering::Acquire) {
            anyhow::bail!("portal {} has been deleted", self.tgid);
        }
        Ok(())
    }

    pub fn bridging_block(&self) -> Option<BridgingBlock> {
        self.blocked.lock().expect("block flag poisoned").clone()
    }

    /// Clear a bridging block after config/admin action.
    pub fn clear_bridging_block(&self) {
        *self.blocked.lock().expect("block flag poisoned") = None;
    }

    pub(crate) fn next_placeholder(&self) -> MatrixEventId {
        let seq = self.placeholder_seq.fetch_add(1, Ordering::Relaxed);
        MatrixEventId::new(format!("$tmp-{}-{}", self.tgid, seq))
    }

    /// The ghost that speaks for a message: its sender, or the chat's own
    /// channel ghost for signed-less channel posts.
    pub(crate) fn sender_ghost(&self, sender: Option<TgUserId>) -> TgUserId {
        sender.unwrap_or(TgUserId(self.tgid.0))
    }

    // ------------------------------------------------------------------
    // Room lifecycle
    // ------------------------------------------------------------------

    /// Check runtime policy before materializing. Records the veto so later
    /// attempts refuse until it is cleared.
    async fn check_bridging_policy(&self, info: &ChatInfo) -> Result<(), BridgingBlock> {
        let config = self.bridge_config().await;
        if !config.chat_filter.permits(self.tgid.0) {
            let block = BridgingBlock::FilteredOut;
            *self.blocked.lock().expect("block flag poisoned") = Some(block.clone());
            return Err(block);
        }
        if let (Some(limit), Some(count)) = (config.max_member_count, info.member_count) {
            if count > limit {
                let block = BridgingBlock::TooManyMembers { count, limit };
                *self.blocked.lock().expect("block flag poisoned") = Some(block.clone());
                return Err(block);
            }
        }
        Ok(())
    }

    /// Create the local room for this portal, exactly once.
    ///
    /// Concurrent callers wait on the creation lock and find the room
    /// already assigned when they get in. The room ID is registered in the
    /// portal registry's room map before metadata sync runs, so inbound
    /// updates arriving mid-creation queue behind the pipeline instead of
    /// racing to create a second room.
    pub async fn create_matrix_room(
        self: &Arc<Self>,
        registry: &PortalRegistry,
        client: &dyn TelegramClient,
    ) -> Result<MatrixRoomId> {
        self.ensure_alive()?;
        if let Some(mxid) = self.mxid().await {
            return Ok(mxid);
        }
        if let Some(block) = self.bridging_block() {
            anyhow::bail!("bridging blocked: {}", block);
        }

        let _guard = self.create_lock.lock().await;
        // A concurrent caller may have finished while we waited
        if let Some(mxid) = self.mxid().await {
            return Ok(mxid);
        }

        let info = client
            .get_entity(self.tgid)
            .await
            .context("Failed to resolve chat for room creation")?;
        if let Err(block) = self.check_bridging_policy(&info).await {
            tracing::info!(chat = %self.tgid, reason = %block, "Refusing to bridge chat");
            anyhow::bail!("bridging blocked: {}", block);
        }

        let config = self.bridge_config().await;
        let use_portal_meta = self.peer_kind != PeerKind::User
            || config.private_chat_portal_meta
            || config.encryption_default;

        let bot = self.deps.intents.bot();
        let mut levels = PowerLevels::default();
        levels.users.insert(bot.user_id().clone(), 100);
        if self.peer_kind == PeerKind::Channel && !info.megagroup {
            // Broadcast channels: only admins may post
            levels.events_default = 50;
        }

        let request = RoomCreateRequest {
            name: if use_portal_meta { info.title.clone() } else { None },
            topic: info.about.clone(),
            invite: Vec::new(),
            is_direct: self.peer_kind == PeerKind::User,
            encrypted: config.encryption_default,
            power_levels: Some(levels),
        };

        let mxid = bot
            .create_room(request)
            .await
            .context("Failed to create portal room")?;

        {
            let mut record = self.record.lock().await;
            record.mxid = Some(mxid.clone());
            record.title = info.title.clone();
            record.about = info.about.clone();
            record.username = info.username.clone();
            record.photo_id = info.photo_id;
            record.megagroup = info.megagroup;
            record.encrypted = config.encryption_default;
            self.deps.store.save_portal(&record)?;
        }
        // Visible to get_by_mxid before metadata sync finishes
        registry.register_room(&mxid, Arc::clone(self));

        tracing::info!(chat = %self.tgid, room = %mxid, kind = %self.peer_kind, "Portal room created");

        if let Err(e) = self.update_matrix_room(client).await {
            tracing::warn!(chat = %self.tgid, error = %e, "Post-creation metadata sync failed");
        }

        Ok(mxid)
    }

    /// Sync metadata, membership, and power levels from the remote chat.
    pub async fn update_matrix_room(&self, client: &dyn TelegramClient) -> Result<()> {
        self.ensure_alive()?;
        let mxid = match self.mxid().await {
            Some(m) => m,
            None => return Ok(()),
        };
        let info = client.get_entity(self.tgid).await?;
        self.update_metadata(&mxid, &info).await?;
        self.sync_participants(&mxid, client).await?;
        Ok(())
    }

    async fn update_metadata(&self, mxid: &MatrixRoomId, info: &ChatInfo) -> Result<()> {
        let bot = self.deps.intents.bot();
        let mut record = self.record.lock().await;
        let mut dirty = false;

        if info.title != record.title {
            bot.send_state_event(
                mxid,
                "m.room.name",
                "",
                serde_json::json!({ "name": info.title.clone().unwrap_or_default() }),
            )
            .await?;
            record.title = info.title.clone();
            dirty = true;
        }
        if info.about != record.about {
            bot.send_state_event(
                mxid,
                "m.room.topic",
                "",
                serde_json::json!({ "topic": info.about.clone().unwrap_or_default() }),
            )
            .await?;
            record.about = info.about.clone();
            dirty = true;
        }
        if info.username != record.username || info.photo_id != record.photo_id {
            record.username = info.username.clone();
            record.photo_id = info.photo_id;
            dirty = true;
        }
        if info.megagroup != record.megagroup {
            record.megagroup = info.megagroup;
            dirty = true;
        }
        if dirty {
            self.deps.store.save_portal(&record)?;
        }
        Ok(())
    }

    /// Bring room membership and power levels in line with the remote
    /// participant list.
    pub async fn sync_participants(
        &self,
        mxid: &MatrixRoomId,
        client: &dyn TelegramClient,
    ) -> Result<()> {
        let participants = match client.get_participants(self.tgid).await {
            Ok(p) => p,
            Err(TelegramError::PermissionDenied(reason)) => {
                tracing::debug!(chat = %self.tgid, %reason, "Cannot list participants");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let bot = self.deps.intents.bot();
        let mut levels = bot.get_power_levels(mxid).await?;
        let bridge_level = levels.level_of(bot.user_id());
        let mut levels_dirty = false;

        for participant in &participants {
            let puppet = self.deps.puppets.get(participant.user).await?;
            if let Ok(info) = client.get_user(participant.user).await {
                let source = format!("tg-{}", client.actor_id());
                if let Err(e) = puppet.update_info(&source, &info, self.deps.intents.as_ref()).await {
                    tracing::debug!(user = %participant.user, error = %e, "Puppet profile sync failed");
                }
            }
            let ghost = self.deps.intents.for_puppet(participant.user);
            if let Err(e) = ghost.join_room(mxid).await {
                tracing::debug!(user = %participant.user, error = %e, "Ghost join failed, inviting");
                bot.invite_user(mxid, ghost.user_id()).await.ok();
                ghost.join_room(mxid).await.ok();
            }
            let ghost_mxid = self.deps.intents.puppet_mxid(participant.user);
            if apply_remote_role(&mut levels, &ghost_mxid, participant.role, bridge_level) {
                levels_dirty = true;
            }
        }

        if levels_dirty {
            bot.set_power_levels(mxid, &levels).await?;
        }
        Ok(())
    }

    /// Remove a user from the room on behalf of a remote removal, using the
    /// acting admin's identity when possible, the bridge bot next, and a
    /// plain ghost leave as the last resort.
    pub async fn remove_matrix_user(
        &self,
        target: &MatrixUserId,
        acting_admin: Option<TgUserId>,
        kind: RemovalKind,
    ) -> Result<()> {
        let mxid = match self.mxid().await {
            Some(m) => m,
            None => return Ok(()),
        };
        if let Some(admin) = acting_admin {
            let admin_intent = self.deps.intents.for_puppet(admin);
            let attempt = match kind {
                RemovalKind::Ban => admin_intent.ban_user(&mxid, target, None).await,
                _ => admin_intent.kick_user(&mxid, target, None).await,
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(admin = %admin, error = %e, "Admin-identity removal failed, falling back to bot");
                }
            }
        }
        let bot = self.deps.intents.bot();
        let attempt = match kind {
            RemovalKind::Ban => bot.ban_user(&mxid, target, None).await,
            _ => bot.kick_user(&mxid, target, None).await,
        };
        match attempt {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "Bot removal failed, leaving as ghost");
                // Last resort: make the target leave under its own identity.
                // Only possible when it is a ghost or double puppet of ours.
                self.deps
                    .intents
                    .for_double_puppet(target)
                    .ok_or_else(|| anyhow::anyhow!("no identity able to remove {}", target))?
                    .leave_room(&mxid)
                    .await
            }
        }
    }

    /// Soft delete: detach the room, keep the chat mapping.
    pub async fn unbridge(&self, registry: &PortalRegistry) -> Result<()> {
        self.ensure_alive()?;
        let mut record = self.record.lock().await;
        if let Some(mxid) = record.mxid.take() {
            registry.unregister_room(&mxid);
            self.deps
                .store
                .clear_portal_mxid(self.tgid, self.tg_receiver)?;
            tracing::info!(chat = %self.tgid, room = %mxid, "Portal unbridged");
        }
        record.encrypted = false;
        Ok(())
    }

    /// Hard delete: purge history, drop the mapping, and poison this
    /// instance so any further use fails fast.
    pub async fn cleanup_and_delete(&self, registry: &PortalRegistry) -> Result<()> {
        self.ensure_alive()?;
        let record = self.record.lock().await.clone();
        if let Some(mxid) = &record.mxid {
            let bot = self.deps.intents.bot();
            if let Ok(members) = bot.get_room_members(mxid).await {
                for member in members {
                    if &member == bot.user_id() {
                        continue;
                    }
                    bot.kick_user(mxid, &member, Some("Portal deleted")).await.ok();
                }
            }
            bot.leave_room(mxid).await.ok();
            registry.unregister_room(mxid);
        }
        self.deps.store.delete_portal(&record)?;
        self.deleted.store(true, Ordering::Release);
        registry.unregister(self.tgid, self.tg_receiver);
        tracing::info!(chat = %self.tgid, "Portal deleted");
        Ok(())
    }
}

/// For anything but a private chat the receiver is the chat itself.
pub fn normalize_receiver(kind: PeerKind, chat: TgChatId, requested: TgUserId) -> TgUserId {
    match kind {
        PeerKind::User => requested,
        PeerKind::Chat | PeerKind::Channel => TgUserId(chat.0),
    }
}

/// Process-wide portal cache and resolver. Resolution prefers the in-memory
/// map, then storage, then constructs a fresh unmaterialized portal; every
/// successful path registers the result before returning.
pub struct PortalRegistry {
    deps: Arc<PortalDeps>,
    by_tgid: StdMutex<HashMap<(TgChatId, TgUserId), Arc<Portal>>>,
    by_mxid: StdMutex<HashMap<MatrixRoomId, Arc<Portal>>>,
    creation_locks: KeyedLocks<(TgChatId, TgUserId)>,
}

impl PortalRegistry {
    pub fn new(deps: Arc<PortalDeps>) -> Self {
        Self {
            deps,
            by_tgid: StdMutex::new(HashMap::new()),
            by_mxid: StdMutex::new(HashMap::new()),
            creation_locks: KeyedLocks::new(),
        }
    }

    fn cached(&self, key: (TgChatId, TgUserId)) -> Option<Arc<Portal>> {
        self.by_tgid.lock().expect("portal cache poisoned").get(&key).cloned()
    }

    fn register(&self, portal: Arc<Portal>) {
        let key = (portal.tgid, portal.tg_receiver);
        self.by_tgid
            .lock()
            .expect("portal cache poisoned")
            .insert(key, Arc::clone(&portal));
    }

    pub(crate) fn register_room(&self, mxid: &MatrixRoomId, portal: Arc<Portal>) {
        self.by_mxid
            .lock()
            .expect("portal room cache poisoned")
            .insert(mxid.clone(), portal);
    }

    fn unregister_room(&self, mxid: &MatrixRoomId) {
        self.by_mxid.lock().expect("portal room cache poisoned").remove(mxid);
    }

    fn unregister(&self, tgid: TgChatId, receiver: TgUserId) {
        self.by_tgid
            .lock()
            .expect("portal cache poisoned")
            .remove(&(tgid, receiver));
    }

    /// Resolve by remote identity, creating an unmaterialized portal when
    /// nothing is stored yet.
    pub async fn get_by_tgid(
        &self,
        tgid: TgChatId,
        receiver: TgUserId,
        kind: PeerKind,
    ) -> Result<Arc<Portal>> {
        let receiver = normalize_receiver(kind, tgid, receiver);
        let key = (tgid, receiver);
        if let Some(portal) = self.cached(key) {
            return Ok(portal);
        }
        let _guard = self.creation_locks.acquire(key).await;
        if let Some(portal) = self.cached(key) {
            return Ok(portal);
        }
        let record = match self.deps.store.get_portal(tgid, receiver)? {
            Some(record) => record,
            None => PortalRecord::new(tgid, receiver, kind),
        };
        let portal = Arc::new(Portal::new(record, Arc::clone(&self.deps)));
        if let Some(mxid) = portal.record.try_lock().ok().and_then(|r| r.mxid.clone()) {
            self.register_room(&mxid, Arc::clone(&portal));
        }
        self.register(Arc::clone(&portal));
        Ok(portal)
    }

    /// Resolve by local room. Returns None for rooms the bridge does not
    /// manage.
    pub async fn get_by_mxid(&self, mxid: &MatrixRoomId) -> Result<Option<Arc<Portal>>> {
        if let Some(portal) = self
            .by_mxid
            .lock()
            .expect("portal room cache poisoned")
            .get(mxid)
            .cloned()
        {
            return Some(portal).map(Ok).transpose();
        }
        match self.deps.store.get_portal_by_mxid(mxid)? {
            Some(record) => {
                let portal = self
                    .get_by_tgid(record.tgid, record.tg_receiver, record.peer_kind)
                    .await?;
                self.register_room(mxid, Arc::clone(&portal));
                Ok(Some(portal))
            }
            None => Ok(None),
        }
    }

    /// Resolve from freshly fetched chat metadata, the entry point used by
    /// the update dispatcher.
    pub async fn get_by_entity(&self, info: &ChatInfo, receiver: TgUserId) -> Result<Arc<Portal>> {
        self.get_by_tgid(info.id, receiver, info.kind).await
    }
}
