// ABOUTME: History backfill — pages remote history into the portal room under the backfill lock
// ABOUTME: Store-backed dedup keeps re-runs and live deliveries from double-bridging rows

use super::{Portal, PortalRegistry};
use crate::intent::MatrixIntent;
use crate::telegram::TelegramClient;
use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use telebridge_core::media::TelegramMessage;

/// Clears the active flag when backfill exits, normally or by error.
struct BackfillFlag<'a>(&'a Portal);

impl Drop for BackfillFlag<'_> {
    fn drop(&mut self) {
        self.0.backfill_active.store(false, Ordering::Release);
    }
}

impl Portal {
    /// Fill the portal room with recent history, oldest first.
    ///
    /// Runs under the backfill lock so only one fill per portal is active,
    /// and with the active flag set so the live pipeline knows persistent
    /// mappings may appear out from under its cache. Returns the number of
    /// messages bridged.
    pub async fn backfill(
        self: &Arc<Self>,
        registry: &PortalRegistry,
        client: &dyn TelegramClient,
        double_puppet: Option<Arc<dyn MatrixIntent>>,
    ) -> Result<usize> {
        self.ensure_alive()?;
        let config = self.bridge_config().await;
        if !config.backfill_enabled || config.backfill_limit == 0 {
            return Ok(0);
        }
        let mxid = match self.ensure_room(registry, client).await? {
            Some(mxid) => mxid,
            None => return Ok(0),
        };

        let _lock = self.backfill_lock.lock().await;
        self.backfill_active.store(true, Ordering::Release);
        let _flag = BackfillFlag(self);

        // History receipts attribute correctly only when the viewer's own
        // account is in the room, so pull the double puppet in for the
        // duration if it was not already a member.
        let mut invited_for_backfill = None;
        if let Some(puppet) = &double_puppet {
            let bot = self.deps.intents.bot();
            let members = bot.get_room_members(&mxid).await.unwrap_or_default();
            if !members.contains(puppet.user_id()) {
                bot.invite_user(&mxid, puppet.user_id()).await.ok();
                if puppet.join_room(&mxid).await.is_ok() {
                    invited_for_backfill = Some(Arc::clone(puppet));
                }
            }
        }

        let messages = self.fetch_history(client, config.backfill_limit).await?;
        tracing::info!(chat = %self.tgid, count = messages.len(), "Backfilling portal history");

        let mut bridged = 0;
        for msg in &messages {
            match self.handle_remote_message(registry, client, msg).await {
                Ok(()) => bridged += 1,
                Err(e) => {
                    tracing::warn!(chat = %self.tgid, msg = %msg.id, error = %e, "Backfill message failed");
                }
            }
        }

        if let Some(puppet) = invited_for_backfill {
            puppet.leave_room(&mxid).await.ok();
        }

        Ok(bridged)
    }

    /// Page history newest-first up to `limit` messages, returned in oldest
    /// first order for replay.
    async fn fetch_history(
        &self,
        client: &dyn TelegramClient,
        limit: usize,
    ) -> Result<Vec<TelegramMessage>> {
        const PAGE: usize = 50;
        let mut collected: Vec<TelegramMessage> = Vec::new();
        let mut before = None;
        while collected.len() < limit {
            let want = PAGE.min(limit - collected.len());
            let page = client.get_messages(self.tgid, want, before).await?;
            if page.is_empty() {
                break;
            }
            before = page.last().map(|m| m.id);
            collected.extend(page);
        }
        collected.reverse();
        Ok(collected)
    }
}
