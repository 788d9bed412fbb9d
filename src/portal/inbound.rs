// ABOUTME: Remote-to-local update handling — the dedup-guarded message pipeline
// ABOUTME: New messages, edit chains, service actions, reactions, deletions, presence

use super::convert::{self, ConvertContext};
use super::{Portal, PortalRegistry};
use crate::intent::{MessageContent, Relation, RemovalKind};
use crate::power_levels::apply_remote_role;
use crate::store::{MessageRecord, EDIT_INDEX_LATEST};
use crate::telegram::TelegramClient;
use anyhow::{Context, Result};
use std::sync::Arc;
use telebridge_core::dedup::DedupMapping;
use telebridge_core::ids::{MatrixEventId, MatrixRoomId, TgMessageId, TgUserId};
use telebridge_core::media::{TelegramAction, TelegramMessage};

impl Portal {
    /// Entry point for a message update delivered by one session. Edits are
    /// recognized by their edit timestamp and routed to the edit path.
    pub async fn handle_remote_message(
        self: &Arc<Self>,
        registry: &PortalRegistry,
        client: &dyn TelegramClient,
        msg: &TelegramMessage,
    ) -> Result<()> {
        self.ensure_alive()?;
        if msg.is_empty() {
            tracing::debug!(chat = %self.tgid, msg = %msg.id, "Ignoring empty message");
            return Ok(());
        }
        if msg.edit_date.is_some() {
            return self.handle_remote_edit(registry, client, msg).await;
        }
        self.bridge_new_message(registry, client, msg).await
    }

    async fn bridge_new_message(
        self: &Arc<Self>,
        registry: &PortalRegistry,
        client: &dyn TelegramClient,
        msg: &TelegramMessage,
    ) -> Result<()> {
        let mxid = match self.ensure_room(registry, client).await? {
            Some(mxid) => mxid,
            None => return Ok(()),
        };
        let space = self.space_for(client.actor_id());
        let _send = self.send_locks.acquire(space).await;

        let placeholder = DedupMapping::new(self.next_placeholder(), space);
        if let Some(existing) = self
            .dedup
            .lock()
            .await
            .check(msg, placeholder.clone(), false)
        {
            tracing::debug!(chat = %self.tgid, msg = %msg.id, existing = %existing.event_id, "Duplicate delivery, skipping");
            return Ok(());
        }

        // The cache is process-lifetime only; a mapping may exist on disk
        // from an earlier run, a backfill, or the echo of our own send.
        if let Some(existing) = self.deps.store.get_message(msg.id, space, 0)? {
            tracing::debug!(chat = %self.tgid, msg = %msg.id, existing = %existing.mxid, "Already bridged, refreshing cache");
            self.dedup.lock().await.update(
                msg,
                DedupMapping::new(existing.mxid, space),
                &placeholder,
                false,
            );
            return Ok(());
        }

        let config = self.bridge_config().await;
        let ghost = self.sender_ghost(msg.sender);
        let sender_intent = self.deps.intents.for_puppet(ghost);
        let ctx = ConvertContext {
            config: &config,
            formatter: self.deps.formatter.as_ref(),
            store: &self.deps.store,
            intents: self.deps.intents.as_ref(),
            puppets: &self.deps.puppets,
            sender_intent: sender_intent.as_ref(),
            client,
            space,
            room: &mxid,
        };
        let converted = match convert::convert_message(&ctx, msg).await? {
            Some(converted) => converted,
            None => return Ok(()),
        };

        let event_id = sender_intent
            .send_message(&mxid, &converted.main)
            .await
            .context("Failed to send bridged message")?;
        let caption_id = match &converted.caption {
            Some(caption) => {
                match sender_intent.send_message(&mxid, caption).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        tracing::warn!(chat = %self.tgid, msg = %msg.id, error = %e, "Caption send failed");
                        None
                    }
                }
            }
            None => None,
        };

        let final_mapping = DedupMapping::new(event_id.clone(), space);
        let conflict = self
            .dedup
            .lock()
            .await
            .update(msg, final_mapping, &placeholder, false);
        if let Some(winner) = conflict {
            // A concurrent delivery through another session committed first.
            // Our local events are duplicates; take them back.
            tracing::info!(
                chat = %self.tgid,
                msg = %msg.id,
                winner = %winner.event_id,
                loser = %event_id,
                "Lost dedup race, redacting duplicate"
            );
            sender_intent
                .redact(&mxid, &event_id, Some("duplicate message"))
                .await
                .ok();
            if let Some(caption_id) = &caption_id {
                sender_intent
                    .redact(&mxid, caption_id, Some("duplicate message"))
                    .await
                    .ok();
            }
            return Ok(());
        }

        let content_hash = self.dedup.lock().await.hash(msg);
        self.deps.store.insert_message(&MessageRecord {
            tg_msg: msg.id,
            tg_space: space,
            mxid: event_id.clone(),
            mx_room: mxid.clone(),
            edit_index: 0,
            content_hash,
            sender: msg.sender,
            redacted: false,
        })?;

        if let Some(expires_in) = converted.expires_in {
            // Replayed history must not arm a timer per photo; live traffic
            // does.
            if !self.backfill_active.load(std::sync::atomic::Ordering::Acquire) {
                self.schedule_expiry(mxid, event_id, expires_in);
            }
        }
        Ok(())
    }

    /// Bridge an edit into the chain for its original message. An edit whose
    /// content hash matches the chain head is a metadata-only touch and is
    /// suppressed.
    pub async fn handle_remote_edit(
        self: &Arc<Self>,
        registry: &PortalRegistry,
        client: &dyn TelegramClient,
        msg: &TelegramMessage,
    ) -> Result<()> {
        self.ensure_alive()?;
        let space = self.space_for(client.actor_id());

        let latest = match self.deps.store.get_message(msg.id, space, EDIT_INDEX_LATEST)? {
            Some(latest) => latest,
            None => {
                // Edit of a message we never bridged; treat as new content
                tracing::debug!(chat = %self.tgid, msg = %msg.id, "Edit without original, bridging as new");
                return self.bridge_new_message(registry, client, msg).await;
            }
        };

        let _send = self.send_locks.acquire(space).await;

        let new_hash = self.dedup.lock().await.hash(msg);
        if new_hash == latest.content_hash {
            tracing::debug!(chat = %self.tgid, msg = %msg.id, "No-op edit, suppressing");
            return Ok(());
        }

        // Edits reuse the message ID of the original, so the delivery itself
        // is deduplicated by content hash.
        let placeholder = DedupMapping::new(self.next_placeholder(), space);
        if self
            .dedup
            .lock()
            .await
            .check(msg, placeholder.clone(), true)
            .is_some()
        {
            tracing::debug!(chat = %self.tgid, msg = %msg.id, "Duplicate edit delivery, skipping");
            return Ok(());
        }

        let original = self
            .deps
            .store
            .get_message(msg.id, space, 0)?
            .unwrap_or_else(|| latest.clone());
        let mxid = original.mx_room.clone();

        let config = self.bridge_config().await;
        let ghost = self.sender_ghost(msg.sender);
        let sender_intent = self.deps.intents.for_puppet(ghost);
        let ctx = ConvertContext {
            config: &config,
            formatter: self.deps.formatter.as_ref(),
            store: &self.deps.store,
            intents: self.deps.intents.as_ref(),
            puppets: &self.deps.puppets,
            sender_intent: sender_intent.as_ref(),
            client,
            space,
            room: &mxid,
        };
        let converted = match convert::convert_message(&ctx, msg).await? {
            Some(converted) => converted,
            None => return Ok(()),
        };
        let mut content = converted.main;
        content.relates_to = Some(Relation::Replace {
            event_id: original.mxid.clone(),
        });

        let event_id = sender_intent
            .send_message(&mxid, &content)
            .await
            .context("Failed to send bridged edit")?;

        let final_mapping = DedupMapping::new(event_id.clone(), space);
        if let Some(winner) = self
            .dedup
            .lock()
            .await
            .update(msg, final_mapping, &placeholder, true)
        {
            tracing::info!(chat = %self.tgid, msg = %msg.id, winner = %winner.event_id, "Lost edit dedup race, redacting");
            sender_intent
                .redact(&mxid, &event_id, Some("duplicate edit"))
                .await
                .ok();
            return Ok(());
        }

        let edit_index = self.deps.store.next_edit_index(msg.id, space)?;
        self.deps.store.insert_message(&MessageRecord {
            tg_msg: msg.id,
            tg_space: space,
            mxid: event_id,
            mx_room: mxid,
            edit_index,
            content_hash: new_hash,
            sender: msg.sender,
            redacted: false,
        })?;
        Ok(())
    }

    /// Bridge a non-message service update.
    pub async fn handle_remote_action(
        self: &Arc<Self>,
        client: &dyn TelegramClient,
        actor: Option<TgUserId>,
        carrier: &TelegramMessage,
        action: &TelegramAction,
    ) -> Result<()> {
        self.ensure_alive()?;
        if self.dedup.lock().await.check_action(carrier) {
            tracing::debug!(chat = %self.tgid, "Duplicate action delivery, skipping");
            return Ok(());
        }
        let mxid = match self.mxid().await {
            Some(mxid) => mxid,
            // Actions never materialize a room on their own
            None => return Ok(()),
        };
        let bot = self.deps.intents.bot();

        match action {
            TelegramAction::TitleChanged(title) => {
                bot.send_state_event(
                    &mxid,
                    "m.room.name",
                    "",
                    serde_json::json!({ "name": title }),
                )
                .await?;
                self.set_title(Some(title.clone())).await?;
            }
            TelegramAction::AboutChanged(about) => {
                bot.send_state_event(
                    &mxid,
                    "m.room.topic",
                    "",
                    serde_json::json!({ "topic": about }),
                )
                .await?;
                self.set_about(Some(about.clone())).await?;
            }
            TelegramAction::PhotoChanged { photo_id } => {
                let avatar_url = match photo_id {
                    Some(file_id) => match client.download_file(*file_id).await {
                        Ok(data) => Some(bot.upload_media("image/jpeg", data).await?),
                        Err(e) => {
                            tracing::warn!(chat = %self.tgid, error = %e, "Chat photo download failed");
                            None
                        }
                    },
                    None => Some(String::new()),
                };
                if let Some(url) = avatar_url {
                    bot.send_state_event(
                        &mxid,
                        "m.room.avatar",
                        "",
                        serde_json::json!({ "url": url }),
                    )
                    .await?;
                }
                self.set_photo_id(*photo_id).await?;
            }
            TelegramAction::UserJoined(user) => {
                let ghost = self.deps.intents.for_puppet(*user);
                if ghost.join_room(&mxid).await.is_err() {
                    bot.invite_user(&mxid, ghost.user_id()).await.ok();
                    ghost.join_room(&mxid).await.ok();
                }
            }
            TelegramAction::UserLeft { user, actor: remover } => {
                let target = self.deps.intents.puppet_mxid(*user);
                let kind = match remover {
                    Some(remover) if remover != user => RemovalKind::Kick,
                    _ => RemovalKind::Leave,
                };
                self.remove_matrix_user(&target, remover.or(actor), kind)
                    .await?;
            }
            TelegramAction::AdminChanged { user, role } => {
                let mut levels = bot.get_power_levels(&mxid).await?;
                let bridge_level = levels.level_of(bot.user_id());
                let target = self.deps.intents.puppet_mxid(*user);
                if apply_remote_role(&mut levels, &target, *role, bridge_level) {
                    bot.set_power_levels(&mxid, &levels).await?;
                }
            }
            TelegramAction::PinnedMessage(msg_id) => {
                let space = self.space_for(client.actor_id());
                if let Some(record) = self.deps.store.get_message(*msg_id, space, 0)? {
                    bot.send_state_event(
                        &mxid,
                        "m.room.pinned_events",
                        "",
                        serde_json::json!({ "pinned": [record.mxid.as_str()] }),
                    )
                    .await?;
                } else {
                    tracing::debug!(chat = %self.tgid, msg = %msg_id, "Pinned message not bridged, skipping");
                }
            }
        }
        Ok(())
    }

    /// Reconcile one remote user's reactions on one message against the full
    /// list the remote side now reports.
    pub async fn handle_remote_reactions(
        &self,
        client: &dyn TelegramClient,
        target_msg: TgMessageId,
        sender: TgUserId,
        reactions: &[String],
    ) -> Result<()> {
        self.ensure_alive()?;
        let space = self.space_for(client.actor_id());
        let target = match self.deps.store.get_message(target_msg, space, 0)? {
            Some(record) => record,
            None => return Ok(()),
        };
        let _guard = self.reaction_locks.acquire(target.mxid.clone()).await;

        let existing = self.deps.store.reactions_by_user(&target.mxid, sender)?;
        let ghost = self.deps.intents.for_puppet(sender);

        for old in &existing {
            if !reactions.contains(&old.reaction) {
                ghost
                    .redact(&old.mx_room, &old.mxid, Some("reaction removed"))
                    .await
                    .ok();
                self.deps.store.delete_reaction(&old.mxid)?;
            }
        }
        for emoji in reactions {
            if existing.iter().any(|r| &r.reaction == emoji) {
                continue;
            }
            let event_id = ghost
                .send_custom_event(
                    &target.mx_room,
                    "m.reaction",
                    serde_json::json!({
                        "m.relates_to": {
                            "rel_type": "m.annotation",
                            "event_id": target.mxid.as_str(),
                            "key": emoji,
                        }
                    }),
                )
                .await?;
            self.deps.store.insert_reaction(&crate::store::ReactionRecord {
                mxid: event_id,
                mx_room: target.mx_room.clone(),
                target_mxid: target.mxid.clone(),
                tg_sender: sender,
                reaction: emoji.clone(),
                created_at: chrono::Utc::now().to_rfc3339(),
            })?;
        }
        Ok(())
    }

    /// Redact the local side of remotely deleted messages. Every entry of
    /// each edit chain is redacted; the rows stay behind as flagged
    /// tombstones.
    pub async fn handle_remote_delete(
        &self,
        client: &dyn TelegramClient,
        messages: &[TgMessageId],
    ) -> Result<()> {
        self.ensure_alive()?;
        let space = self.space_for(client.actor_id());
        let bot = self.deps.intents.bot();
        for msg_id in messages {
            let mut index = 0;
            while let Some(record) = self.deps.store.get_message(*msg_id, space, index)? {
                if !record.redacted {
                    bot.redact(&record.mx_room, &record.mxid, Some("message deleted"))
                        .await
                        .ok();
                    self.deps.store.mark_redacted(&record.mxid, &record.mx_room)?;
                }
                index += 1;
            }
        }
        Ok(())
    }

    pub async fn handle_remote_typing(
        &self,
        user: TgUserId,
        typing: bool,
    ) -> Result<()> {
        self.ensure_alive()?;
        let mxid = match self.mxid().await {
            Some(mxid) => mxid,
            None => return Ok(()),
        };
        self.deps
            .intents
            .for_puppet(user)
            .set_typing(&mxid, typing)
            .await
    }

    /// Remote read receipt: the ghost marks the mapped event as read.
    pub async fn handle_remote_read(
        &self,
        client: &dyn TelegramClient,
        user: TgUserId,
        up_to: TgMessageId,
    ) -> Result<()> {
        self.ensure_alive()?;
        let space = self.space_for(client.actor_id());
        if let Some(record) = self.deps.store.get_message(up_to, space, EDIT_INDEX_LATEST)? {
            self.deps
                .intents
                .for_puppet(user)
                .mark_read(&record.mx_room, &record.mxid)
                .await?;
        }
        Ok(())
    }

    /// Resolve the room, creating it unless bridging is blocked. Policy
    /// vetoes are terminal for the update, not errors.
    pub(crate) async fn ensure_room(
        self: &Arc<Self>,
        registry: &PortalRegistry,
        client: &dyn TelegramClient,
    ) -> Result<Option<MatrixRoomId>> {
        if let Some(mxid) = self.mxid().await {
            return Ok(Some(mxid));
        }
        if let Some(block) = self.bridging_block() {
            tracing::debug!(chat = %self.tgid, reason = %block, "Bridging blocked, dropping update");
            return Ok(None);
        }
        match self.create_matrix_room(registry, client).await {
            Ok(mxid) => Ok(Some(mxid)),
            Err(e) => {
                if self.bridging_block().is_some() {
                    tracing::info!(chat = %self.tgid, "Chat refused by bridging policy");
                    return Ok(None);
                }
                Err(e)
            }
        }
    }

    fn schedule_expiry(
        self: &Arc<Self>,
        room: MatrixRoomId,
        event: MatrixEventId,
        expires_in: std::time::Duration,
    ) {
        let portal = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(expires_in).await;
            if portal.deleted_flag() {
                return;
            }
            let bot = portal.deps.intents.bot();
            if let Err(e) = bot.redact(&room, &event, Some("photo self-destructed")).await {
                tracing::warn!(room = %room, event = %event, error = %e, "Expiry redaction failed");
                return;
            }
            portal.deps.store.mark_redacted(&event, &room).ok();
            let notice = MessageContent::notice("A self-destructing photo expired.");
            bot.send_message(&room, &notice).await.ok();
        });
    }

    fn deleted_flag(&self) -> bool {
        self.ensure_alive().is_err()
    }

    // Small record mutators used by the action handlers

    async fn set_title(&self, title: Option<String>) -> Result<()> {
        self.mutate_record(|r| r.title = title).await
    }

    async fn set_about(&self, about: Option<String>) -> Result<()> {
        self.mutate_record(|r| r.about = about).await
    }

    async fn set_photo_id(&self, photo_id: Option<i64>) -> Result<()> {
        self.mutate_record(|r| r.photo_id = photo_id).await
    }

    async fn mutate_record(&self, f: impl FnOnce(&mut crate::store::PortalRecord)) -> Result<()> {
        let mut record = self.record.lock().await;
        f(&mut record);
        self.deps.store.save_portal(&record)
    }
}
