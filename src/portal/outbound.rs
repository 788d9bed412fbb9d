// ABOUTME: Local-to-remote handling — messages, edits, reactions, redactions, power levels
// ABOUTME: Delivery failures surface as status events and optional room notices, never panics

use super::Portal;
use crate::intent::{
    MessageContent, MessageStatus, MsgType, PowerLevels, Relation, MESSAGE_STATUS_EVENT,
};
use crate::power_levels::diff_for_remote;
use crate::store::MessageRecord;
use crate::telegram::{OutgoingMedia, SentMessage, TelegramClient, TelegramError, TgResult};
use anyhow::Result;
use std::sync::Arc;
use telebridge_core::ids::{MatrixEventId, MatrixRoomId, MatrixUserId, ShortMessageId, TgMessageId};
use telebridge_core::media::TelegramMessage;
use telebridge_core::render;

impl Portal {
    /// Bridge a local room message to the remote chat, acting as `client`.
    pub async fn handle_local_message(
        self: &Arc<Self>,
        client: &dyn TelegramClient,
        event_id: &MatrixEventId,
        content: &MessageContent,
    ) -> Result<()> {
        self.ensure_alive()?;
        let room = match self.mxid().await {
            Some(room) => room,
            None => return Ok(()),
        };
        let config = self.bridge_config().await;
        if content.msgtype == MsgType::Notice && !config.bridge_notices {
            tracing::debug!(chat = %self.tgid, "Notice bridging disabled, dropping");
            return Ok(());
        }

        if let Some(Relation::Replace { event_id: target }) = &content.relates_to {
            return self.handle_local_edit(client, &room, event_id, target, content).await;
        }

        let space = self.space_for(client.actor_id());
        let _send = self.send_locks.acquire(space).await;

        // A native forward preserves attribution and skips the payload round
        // trip; fall through to a normal send when it cannot be done.
        if let Some(token) = &content.forward_source {
            if let Some(sent) = self.try_native_forward(client, token).await {
                self.record_local_send(client, event_id, &room, space, &sent, &content.body)?;
                self.report_success(&room, event_id).await;
                return Ok(());
            }
        }

        let reply_to = match &content.relates_to {
            Some(Relation::ReplyTo { event_id: target }) => self
                .deps
                .store
                .get_message_by_mxid(target, &room)?
                .map(|r| r.tg_msg),
            _ => None,
        };

        let result = self.send_content(client, content, reply_to, &config).await;
        match result {
            Ok(sent) => {
                self.record_local_send(client, event_id, &room, space, &sent, &content.body)?;
                self.report_success(&room, event_id).await;
                Ok(())
            }
            Err(e) => {
                self.report_failure(&room, event_id, &config, &e.to_string()).await;
                Ok(())
            }
        }
    }

    async fn send_content(
        &self,
        client: &dyn TelegramClient,
        content: &MessageContent,
        reply_to: Option<TgMessageId>,
        config: &telebridge_core::config::BridgeConfig,
    ) -> TgResult<SentMessage> {
        match content.msgtype {
            MsgType::Text | MsgType::Notice | MsgType::Emote => {
                let stripped = MessageContent::strip_reply_fallback(&content.body);
                let body = if content.msgtype == MsgType::Emote {
                    format!("/me {}", stripped)
                } else {
                    stripped.to_string()
                };
                let (text, entities) = self
                    .deps
                    .formatter
                    .matrix_to_telegram(&body, content.formatted_body.as_deref());
                retry_flood(|| client.send_text(self.tgid, &text, &entities, reply_to)).await
            }
            MsgType::Image => {
                let (data, _mime) = self.fetch_media(content).await?;
                let pixels = content
                    .info
                    .as_ref()
                    .and_then(|i| Some(u64::from(i.width?) * u64::from(i.height?)))
                    .unwrap_or(0);
                let caption = caption_of(content);
                // Oversized images lose quality or get rejected as photos;
                // deliver them as plain files instead.
                let media = if data.len() as u64 > config.max_image_bytes
                    || pixels > config.max_image_pixels
                {
                    OutgoingMedia::File {
                        name: file_name_of(content),
                        mime: mime_of(content),
                        data,
                    }
                } else {
                    OutgoingMedia::Photo { data }
                };
                retry_flood(|| client.send_media(self.tgid, media.clone(), &caption, &[], reply_to))
                    .await
            }
            MsgType::File | MsgType::Audio | MsgType::Video => {
                let (data, mime) = self.fetch_media(content).await?;
                let media = OutgoingMedia::File {
                    name: file_name_of(content),
                    mime,
                    data,
                };
                let caption = caption_of(content);
                retry_flood(|| client.send_media(self.tgid, media.clone(), &caption, &[], reply_to))
                    .await
            }
            MsgType::Sticker => {
                let (data, mime) = self.fetch_media(content).await?;
                let media = OutgoingMedia::Sticker { data, mime };
                retry_flood(|| client.send_media(self.tgid, media.clone(), "", &[], reply_to)).await
            }
            MsgType::Location => match content.geo_uri.as_deref().and_then(render::parse_geo_uri) {
                Some(point) => {
                    let media = OutgoingMedia::Location { lat: point.lat, long: point.long };
                    retry_flood(|| client.send_media(self.tgid, media.clone(), "", &[], reply_to))
                        .await
                }
                None => {
                    // Malformed or missing geo URI degrades to the text body
                    tracing::warn!(chat = %self.tgid, "Unparseable geo URI, sending body as text");
                    retry_flood(|| client.send_text(self.tgid, &content.body, &[], reply_to)).await
                }
            },
        }
    }

    async fn fetch_media(&self, content: &MessageContent) -> TgResult<(Vec<u8>, String)> {
        let url = content
            .url
            .as_deref()
            .ok_or_else(|| TelegramError::Transfer("media event without url".to_string()))?;
        let data = self
            .deps
            .intents
            .bot()
            .download_media(url)
            .await
            .map_err(|e| TelegramError::Transfer(e.to_string()))?;
        Ok((data, mime_of(content)))
    }

    async fn try_native_forward(
        &self,
        client: &dyn TelegramClient,
        token: &str,
    ) -> Option<SentMessage> {
        let short_id = match ShortMessageId::decode(token) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(token, error = %e, "Unparseable forward token");
                return None;
            }
        };
        let source = self
            .deps
            .store
            .get_message(short_id.message, short_id.space, 0)
            .ok()
            .flatten()?;
        let source_portal = self
            .deps
            .store
            .get_portal_by_mxid(&source.mx_room)
            .ok()
            .flatten()?;
        match client
            .forward_message(self.tgid, source_portal.tgid, short_id.message)
            .await
        {
            Ok(sent) => Some(sent),
            Err(e) => {
                tracing::debug!(chat = %self.tgid, error = %e, "Native forward failed, sending normally");
                None
            }
        }
    }

    async fn handle_local_edit(
        &self,
        client: &dyn TelegramClient,
        room: &MatrixRoomId,
        event_id: &MatrixEventId,
        target: &MatrixEventId,
        content: &MessageContent,
    ) -> Result<()> {
        let record = match self.deps.store.get_message_by_mxid(target, room)? {
            Some(record) => record,
            None => {
                tracing::debug!(chat = %self.tgid, target = %target, "Edit of unbridged event, ignoring");
                return Ok(());
            }
        };
        let space = self.space_for(client.actor_id());
        let _send = self.send_locks.acquire(space).await;

        let stripped = MessageContent::strip_reply_fallback(&content.body);
        // Clients prefix the edit fallback body with "* "
        let body = stripped.strip_prefix("* ").unwrap_or(stripped);
        let (text, entities) = self
            .deps
            .formatter
            .matrix_to_telegram(body, content.formatted_body.as_deref());

        let config = self.bridge_config().await;
        match retry_flood(|| client.edit_message(self.tgid, record.tg_msg, &text, &entities)).await {
            Ok(_) => self.report_success(room, event_id).await,
            Err(e) => self.report_failure(room, event_id, &config, &e.to_string()).await,
        }
        Ok(())
    }

    /// Bridge a local reaction. Enforces the per-user reaction cap by
    /// evicting the user's oldest reaction on the target.
    pub async fn handle_local_reaction(
        &self,
        client: &dyn TelegramClient,
        event_id: &MatrixEventId,
        target: &MatrixEventId,
        emoji: &str,
    ) -> Result<()> {
        self.ensure_alive()?;
        let room = match self.mxid().await {
            Some(room) => room,
            None => return Ok(()),
        };
        let record = match self.deps.store.get_message_by_mxid(target, &room)? {
            Some(record) => record,
            None => {
                tracing::debug!(chat = %self.tgid, target = %target, "Reaction on unbridged event, ignoring");
                return Ok(());
            }
        };
        if record.redacted {
            tracing::debug!(chat = %self.tgid, target = %target, "Reaction on redacted message, ignoring");
            return Ok(());
        }
        // Reactions always attach to the chain origin, even when the client
        // reacted to an edit event.
        let origin = self
            .deps
            .store
            .get_message(record.tg_msg, record.tg_space, 0)?
            .unwrap_or(record);

        let _guard = self.reaction_locks.acquire(origin.mxid.clone()).await;

        let actor = client.actor_id();
        let config = self.bridge_config().await;
        let cap = match self.deps.puppets.get(actor).await {
            Ok(puppet) if puppet.is_premium().await => config.max_reactions_premium,
            _ => config.max_reactions_per_user,
        };

        let existing = self.deps.store.reactions_by_user(&origin.mxid, actor)?;
        // Re-setting an emoji the user already holds replaces the row; only
        // genuinely new reactions count against the cap.
        let is_new = !existing.iter().any(|r| r.reaction == emoji);
        if is_new && existing.len() >= cap {
            let overflow = existing.len() + 1 - cap;
            for old in existing.iter().take(overflow) {
                self.deps
                    .intents
                    .bot()
                    .redact(&old.mx_room, &old.mxid, Some("reaction limit"))
                    .await
                    .ok();
                self.deps.store.delete_reaction(&old.mxid)?;
            }
        }

        match retry_flood(|| client.send_reaction(self.tgid, origin.tg_msg, Some(emoji))).await {
            Ok(()) => {
                self.deps.store.insert_reaction(&crate::store::ReactionRecord {
                    mxid: event_id.clone(),
                    mx_room: room,
                    target_mxid: origin.mxid.clone(),
                    tg_sender: actor,
                    reaction: emoji.to_string(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                })?;
            }
            Err(e) => {
                tracing::warn!(chat = %self.tgid, error = %e, "Reaction delivery failed");
            }
        }
        Ok(())
    }

    /// Bridge a local redaction: delete the remote message when the chain
    /// origin was redacted, clear the reaction when a reaction was.
    pub async fn handle_local_redaction(
        &self,
        client: &dyn TelegramClient,
        redacted: &MatrixEventId,
    ) -> Result<()> {
        self.ensure_alive()?;
        let room = match self.mxid().await {
            Some(room) => room,
            None => return Ok(()),
        };

        if let Some(record) = self.deps.store.get_message_by_mxid(redacted, &room)? {
            if record.edit_index == 0 {
                let messages = [record.tg_msg];
                retry_flood(|| client.delete_messages(self.tgid, &messages)).await?;
            } else {
                // Redacting an edit event only hides that revision locally;
                // the remote message keeps its newest content.
                tracing::debug!(chat = %self.tgid, msg = %record.tg_msg, "Redacted edit event, no remote delete");
            }
            self.deps.store.mark_redacted(redacted, &room)?;
            return Ok(());
        }

        if let Some(reaction) = self.deps.store.get_reaction_by_mxid(redacted)? {
            if let Some(target) = self
                .deps
                .store
                .get_message_by_mxid(&reaction.target_mxid, &room)?
            {
                retry_flood(|| client.send_reaction(self.tgid, target.tg_msg, None)).await?;
            }
            self.deps.store.delete_reaction(redacted)?;
        }
        Ok(())
    }

    /// Propagate a local power-level change to remote admin rights.
    pub async fn handle_local_power_levels(
        &self,
        client: &dyn TelegramClient,
        acting_user: &MatrixUserId,
        old: &PowerLevels,
        new: &PowerLevels,
    ) -> Result<()> {
        self.ensure_alive()?;
        let bot = self.deps.intents.bot();
        for (user, rights) in diff_for_remote(old, new, acting_user, bot.user_id()) {
            let Some(tg_user) = self.deps.intents.puppet_id_of(user) else {
                tracing::debug!(user = %user, "Power level change for non-ghost user, skipping");
                continue;
            };
            match retry_flood(|| client.edit_admin_rights(self.tgid, tg_user, rights)).await {
                Ok(()) => {}
                Err(TelegramError::PermissionDenied(reason)) => {
                    tracing::warn!(chat = %self.tgid, user = %tg_user, %reason, "Not allowed to change admin rights");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Remove the remote counterpart of a locally kicked or banned ghost.
    pub async fn handle_local_removal(
        &self,
        client: &dyn TelegramClient,
        target: &MatrixUserId,
    ) -> Result<()> {
        self.ensure_alive()?;
        let Some(tg_user) = self.deps.intents.puppet_id_of(target) else {
            return Ok(());
        };
        retry_flood(|| client.kick_participant(self.tgid, tg_user)).await?;
        Ok(())
    }

    pub async fn handle_local_typing(
        &self,
        client: &dyn TelegramClient,
        typing: bool,
    ) -> Result<()> {
        self.ensure_alive()?;
        client.send_typing(self.tgid, typing).await?;
        Ok(())
    }

    pub async fn handle_local_read(
        &self,
        client: &dyn TelegramClient,
        event: &MatrixEventId,
    ) -> Result<()> {
        self.ensure_alive()?;
        let room = match self.mxid().await {
            Some(room) => room,
            None => return Ok(()),
        };
        if let Some(record) = self.deps.store.get_message_by_mxid(event, &room)? {
            client.send_read_receipt(self.tgid, record.tg_msg).await?;
        }
        Ok(())
    }

    /// Export an invite link for the remote chat, for the bridge's invite
    /// command surface.
    pub async fn invite_link(&self, client: &dyn TelegramClient) -> Result<String> {
        self.ensure_alive()?;
        Ok(retry_flood(|| client.export_invite_link(self.tgid)).await?)
    }

    /// Persist the mapping for a message we just sent remotely. The hash is
    /// computed over a reconstruction of the sent content so the echoed
    /// delivery and later edits compare against it.
    fn record_local_send(
        &self,
        client: &dyn TelegramClient,
        event_id: &MatrixEventId,
        room: &MatrixRoomId,
        space: telebridge_core::ids::TgSpace,
        sent: &SentMessage,
        body: &str,
    ) -> Result<()> {
        let echo = TelegramMessage {
            id: sent.id,
            sender: Some(client.actor_id()),
            timestamp: sent.timestamp,
            body: body.to_string(),
            entities: Vec::new(),
            media: None,
            reply_to: None,
            forward_from: None,
            from_bot: false,
            edit_date: None,
        };
        let content_hash = telebridge_core::dedup::hash_message(self.peer_kind, &echo);
        self.deps.store.insert_message(&MessageRecord {
            tg_msg: sent.id,
            tg_space: space,
            mxid: event_id.clone(),
            mx_room: room.clone(),
            edit_index: 0,
            content_hash,
            sender: Some(client.actor_id()),
            redacted: false,
        })
    }

    async fn report_success(&self, room: &MatrixRoomId, event_id: &MatrixEventId) {
        let status = MessageStatus::success(event_id);
        if let Ok(content) = serde_json::to_value(&status) {
            self.deps
                .intents
                .bot()
                .send_custom_event(room, MESSAGE_STATUS_EVENT, content)
                .await
                .ok();
        }
    }

    async fn report_failure(
        &self,
        room: &MatrixRoomId,
        event_id: &MatrixEventId,
        config: &telebridge_core::config::BridgeConfig,
        error: &str,
    ) {
        tracing::error!(chat = %self.tgid, event = %event_id, error, "Delivery to Telegram failed");
        let bot = self.deps.intents.bot();
        let status = MessageStatus::failure(event_id, error);
        if let Ok(content) = serde_json::to_value(&status) {
            bot.send_custom_event(room, MESSAGE_STATUS_EVENT, content)
                .await
                .ok();
        }
        if config.delivery_error_notices {
            let notice =
                MessageContent::notice(format!("\u{26A0} Your message was not bridged: {}", error));
            bot.send_message(room, &notice).await.ok();
        }
    }
}

/// Run a transport call, honoring a single flood-wait pause before retrying
/// once. Anything else propagates.
async fn retry_flood<T, F, Fut>(mut call: F) -> TgResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = TgResult<T>>,
{
    match call().await {
        Err(TelegramError::FloodWait(seconds)) => {
            tracing::warn!(seconds, "Flood wait, pausing before retry");
            tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
            call().await
        }
        other => other,
    }
}

fn mime_of(content: &MessageContent) -> String {
    content
        .info
        .as_ref()
        .and_then(|i| i.mimetype.clone())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn file_name_of(content: &MessageContent) -> String {
    content
        .filename
        .clone()
        .unwrap_or_else(|| content.body.clone())
}

/// The caption a media message carries: the body when a separate filename
/// field holds the name, empty otherwise (body is just the name then).
fn caption_of(content: &MessageContent) -> String {
    if content.filename.is_some() {
        content.body.clone()
    } else {
        String::new()
    }
}
