// ABOUTME: Thin routers from both networks' update streams into portal handlers
// ABOUTME: Resolves the portal for each update and converts handler errors into log lines

use crate::intent::{MessageContent, PowerLevels};
use crate::portal::PortalRegistry;
use crate::telegram::{ChatInfo, TelegramClient};
use anyhow::Result;
use std::sync::Arc;
use telebridge_core::ids::{MatrixEventId, MatrixRoomId, MatrixUserId, TgMessageId, TgUserId};
use telebridge_core::media::{TelegramAction, TelegramMessage};

/// One update lifted off a remote session's stream.
#[derive(Debug, Clone)]
pub enum RemoteUpdate {
    Message {
        chat: ChatInfo,
        msg: TelegramMessage,
    },
    MessagesDeleted {
        chat: ChatInfo,
        messages: Vec<TgMessageId>,
    },
    Action {
        chat: ChatInfo,
        actor: Option<TgUserId>,
        carrier: TelegramMessage,
        action: TelegramAction,
    },
    Reactions {
        chat: ChatInfo,
        target: TgMessageId,
        sender: TgUserId,
        reactions: Vec<String>,
    },
    Typing {
        chat: ChatInfo,
        user: TgUserId,
        typing: bool,
    },
    Read {
        chat: ChatInfo,
        user: TgUserId,
        up_to: TgMessageId,
    },
}

/// One event lifted off the local homeserver sync, already filtered to rooms
/// the bridge may manage.
#[derive(Debug, Clone)]
pub enum LocalEvent {
    Message {
        room: MatrixRoomId,
        sender: MatrixUserId,
        event_id: MatrixEventId,
        content: MessageContent,
    },
    Reaction {
        room: MatrixRoomId,
        event_id: MatrixEventId,
        target: MatrixEventId,
        emoji: String,
    },
    Redaction {
        room: MatrixRoomId,
        redacted: MatrixEventId,
    },
    PowerLevels {
        room: MatrixRoomId,
        sender: MatrixUserId,
        old: PowerLevels,
        new: PowerLevels,
    },
    MemberRemoved {
        room: MatrixRoomId,
        target: MatrixUserId,
    },
    Typing {
        room: MatrixRoomId,
        typing: bool,
    },
    ReadReceipt {
        room: MatrixRoomId,
        event_id: MatrixEventId,
    },
}

pub struct Dispatcher {
    registry: Arc<PortalRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PortalRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PortalRegistry> {
        &self.registry
    }

    /// Route one remote update to its portal. Handler errors are reported
    /// here and the update abandoned; the stream must keep flowing.
    pub async fn dispatch_remote(&self, client: &dyn TelegramClient, update: RemoteUpdate) {
        if let Err(e) = self.dispatch_remote_inner(client, update).await {
            tracing::error!(error = %e, "Remote update handling failed");
        }
    }

    async fn dispatch_remote_inner(
        &self,
        client: &dyn TelegramClient,
        update: RemoteUpdate,
    ) -> Result<()> {
        let receiver = client.actor_id();
        match update {
            RemoteUpdate::Message { chat, msg } => {
                let portal = self.registry.get_by_entity(&chat, receiver).await?;
                portal.handle_remote_message(&self.registry, client, &msg).await
            }
            RemoteUpdate::MessagesDeleted { chat, messages } => {
                let portal = self.registry.get_by_entity(&chat, receiver).await?;
                portal.handle_remote_delete(client, &messages).await
            }
            RemoteUpdate::Action { chat, actor, carrier, action } => {
                let portal = self.registry.get_by_entity(&chat, receiver).await?;
                portal
                    .handle_remote_action(client, actor, &carrier, &action)
                    .await
            }
            RemoteUpdate::Reactions { chat, target, sender, reactions } => {
                let portal = self.registry.get_by_entity(&chat, receiver).await?;
                portal
                    .handle_remote_reactions(client, target, sender, &reactions)
                    .await
            }
            RemoteUpdate::Typing { chat, user, typing } => {
                let portal = self.registry.get_by_entity(&chat, receiver).await?;
                if let Err(e) = portal.handle_remote_typing(user, typing).await {
                    tracing::debug!(error = %e, "Typing passthrough failed");
                }
                Ok(())
            }
            RemoteUpdate::Read { chat, user, up_to } => {
                let portal = self.registry.get_by_entity(&chat, receiver).await?;
                if let Err(e) = portal.handle_remote_read(client, user, up_to).await {
                    tracing::debug!(error = %e, "Read receipt passthrough failed");
                }
                Ok(())
            }
        }
    }

    /// Route one local room event to its portal, acting through the sending
    /// user's remote session. Events in rooms without a portal are ignored.
    pub async fn dispatch_local(&self, client: &dyn TelegramClient, event: LocalEvent) {
        if let Err(e) = self.dispatch_local_inner(client, event).await {
            tracing::error!(error = %e, "Local event handling failed");
        }
    }

    async fn dispatch_local_inner(
        &self,
        client: &dyn TelegramClient,
        event: LocalEvent,
    ) -> Result<()> {
        let room = match &event {
            LocalEvent::Message { room, .. }
            | LocalEvent::Reaction { room, .. }
            | LocalEvent::Redaction { room, .. }
            | LocalEvent::PowerLevels { room, .. }
            | LocalEvent::MemberRemoved { room, .. }
            | LocalEvent::Typing { room, .. }
            | LocalEvent::ReadReceipt { room, .. } => room.clone(),
        };
        let Some(portal) = self.registry.get_by_mxid(&room).await? else {
            tracing::trace!(room = %room, "Event in unbridged room, ignoring");
            return Ok(());
        };
        match event {
            LocalEvent::Message { event_id, content, .. } => {
                portal.handle_local_message(client, &event_id, &content).await
            }
            LocalEvent::Reaction { event_id, target, emoji, .. } => {
                portal
                    .handle_local_reaction(client, &event_id, &target, &emoji)
                    .await
            }
            LocalEvent::Redaction { redacted, .. } => {
                portal.handle_local_redaction(client, &redacted).await
            }
            LocalEvent::PowerLevels { sender, old, new, .. } => {
                portal
                    .handle_local_power_levels(client, &sender, &old, &new)
                    .await
            }
            LocalEvent::MemberRemoved { target, .. } => {
                portal.handle_local_removal(client, &target).await
            }
            LocalEvent::Typing { typing, .. } => {
                if let Err(e) = portal.handle_local_typing(client, typing).await {
                    tracing::debug!(error = %e, "Typing passthrough failed");
                }
                Ok(())
            }
            LocalEvent::ReadReceipt { event_id, .. } => {
                if let Err(e) = portal.handle_local_read(client, &event_id).await {
                    tracing::debug!(error = %e, "Read receipt passthrough failed");
                }
                Ok(())
            }
        }
    }
}
