// ABOUTME: Shared test harness — in-memory mocks for both network edges
// ABOUTME: MockTelegram records transport calls, MatrixState records every homeserver write

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use telebridge::config::Config;
use telebridge::intent::{
    IntentProvider, MatrixIntent, MessageContent, PlainFormatter, PowerLevels, RoomCreateRequest,
};
use telebridge::portal::{PortalDeps, PortalRegistry};
use telebridge::puppet::PuppetRegistry;
use telebridge::store::BridgeStore;
use telebridge::telegram::{
    AdminRights, ChatInfo, OutgoingMedia, ParticipantInfo, SentMessage, TelegramClient,
    TelegramError, TgResult, UserInfo,
};
use telebridge::ids::{
    MatrixEventId, MatrixRoomId, MatrixUserId, PeerKind, TgChatId, TgMessageId, TgUserId,
};
use telebridge::media::{FormatEntity, TelegramMessage};

// ---------------------------------------------------------------------------
// Matrix side
// ---------------------------------------------------------------------------

/// Every observable homeserver write, in order.
#[derive(Debug, Clone)]
pub enum MatrixEvent {
    Message {
        room: String,
        sender: String,
        event_id: String,
        content: MessageContent,
    },
    State {
        room: String,
        event_type: String,
        content: serde_json::Value,
    },
    Custom {
        room: String,
        event_type: String,
        sender: String,
        event_id: String,
        content: serde_json::Value,
    },
    Redaction {
        room: String,
        event: String,
        reason: Option<String>,
    },
    Invite { room: String, user: String },
    Kick { room: String, user: String },
    Ban { room: String, user: String },
    Join { room: String, user: String },
    Leave { room: String, user: String },
    Read { room: String, event: String, user: String },
    Typing { room: String, user: String, typing: bool },
}

#[derive(Default)]
pub struct MatrixState {
    events: StdMutex<Vec<MatrixEvent>>,
    pub creates: StdMutex<Vec<RoomCreateRequest>>,
    levels: StdMutex<HashMap<String, PowerLevels>>,
    members: StdMutex<HashMap<String, Vec<MatrixUserId>>>,
    contents: StdMutex<HashMap<(String, String), MessageContent>>,
    seq: AtomicU64,
}

impl MatrixState {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_event_id(&self) -> String {
        format!("$ev-{}:test", self.seq.fetch_add(1, Ordering::Relaxed))
    }

    fn push(&self, event: MatrixEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<MatrixEvent> {
        self.events.lock().unwrap().clone()
    }

    /// All room messages sent, as (room, sender, event_id, content).
    pub fn messages(&self) -> Vec<(String, String, String, MessageContent)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MatrixEvent::Message { room, sender, event_id, content } => {
                    Some((room, sender, event_id, content))
                }
                _ => None,
            })
            .collect()
    }

    pub fn redactions(&self) -> Vec<(String, String, Option<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MatrixEvent::Redaction { room, event, reason } => Some((room, event, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn state_events(&self, event_type: &str) -> Vec<(String, serde_json::Value)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MatrixEvent::State { room, event_type: t, content } if t == event_type => {
                    Some((room, content))
                }
                _ => None,
            })
            .collect()
    }

    pub fn custom_events(&self, event_type: &str) -> Vec<(String, String, serde_json::Value)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MatrixEvent::Custom { room, event_type: t, content, sender, .. }
                    if t == event_type =>
                {
                    Some((room, sender, content))
                }
                _ => None,
            })
            .collect()
    }

    pub fn levels_of(&self, room: &str) -> PowerLevels {
        self.levels.lock().unwrap().get(room).cloned().unwrap_or_default()
    }

    pub fn members_of(&self, room: &str) -> Vec<MatrixUserId> {
        self.members.lock().unwrap().get(room).cloned().unwrap_or_default()
    }
}

pub struct MockIntent {
    user: MatrixUserId,
    state: Arc<MatrixState>,
}

#[async_trait]
impl MatrixIntent for MockIntent {
    fn user_id(&self) -> &MatrixUserId {
        &self.user
    }

    async fn create_room(&self, request: RoomCreateRequest) -> anyhow::Result<MatrixRoomId> {
        let n = self.state.creates.lock().unwrap().len();
        let room = format!("!portal-{}:test", n);
        if let Some(levels) = &request.power_levels {
            self.state
                .levels
                .lock()
                .unwrap()
                .insert(room.clone(), levels.clone());
        }
        self.state
            .members
            .lock()
            .unwrap()
            .entry(room.clone())
            .or_default()
            .push(self.user.clone());
        self.state.creates.lock().unwrap().push(request);
        Ok(MatrixRoomId::new(room))
    }

    async fn send_message(
        &self,
        room: &MatrixRoomId,
        content: &MessageContent,
    ) -> anyhow::Result<MatrixEventId> {
        let event_id = self.state.next_event_id();
        self.state.contents.lock().unwrap().insert(
            (room.0.clone(), event_id.clone()),
            content.clone(),
        );
        self.state.push(MatrixEvent::Message {
            room: room.0.clone(),
            sender: self.user.0.clone(),
            event_id: event_id.clone(),
            content: content.clone(),
        });
        Ok(MatrixEventId::new(event_id))
    }

    async fn send_state_event(
        &self,
        room: &MatrixRoomId,
        event_type: &str,
        _state_key: &str,
        content: serde_json::Value,
    ) -> anyhow::Result<MatrixEventId> {
        let event_id = self.state.next_event_id();
        self.state.push(MatrixEvent::State {
            room: room.0.clone(),
            event_type: event_type.to_string(),
            content,
        });
        Ok(MatrixEventId::new(event_id))
    }

    async fn send_custom_event(
        &self,
        room: &MatrixRoomId,
        event_type: &str,
        content: serde_json::Value,
    ) -> anyhow::Result<MatrixEventId> {
        let event_id = self.state.next_event_id();
        self.state.push(MatrixEvent::Custom {
            room: room.0.clone(),
            event_type: event_type.to_string(),
            sender: self.user.0.clone(),
            event_id: event_id.clone(),
            content,
        });
        Ok(MatrixEventId::new(event_id))
    }

    async fn redact(
        &self,
        room: &MatrixRoomId,
        event: &MatrixEventId,
        reason: Option<&str>,
    ) -> anyhow::Result<MatrixEventId> {
        self.state.push(MatrixEvent::Redaction {
            room: room.0.clone(),
            event: event.0.clone(),
            reason: reason.map(String::from),
        });
        Ok(MatrixEventId::new(self.state.next_event_id()))
    }

    async fn invite_user(&self, room: &MatrixRoomId, user: &MatrixUserId) -> anyhow::Result<()> {
        self.state.push(MatrixEvent::Invite {
            room: room.0.clone(),
            user: user.0.clone(),
        });
        Ok(())
    }

    async fn kick_user(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
        _reason: Option<&str>,
    ) -> anyhow::Result<()> {
        self.state
            .members
            .lock()
            .unwrap()
            .entry(room.0.clone())
            .or_default()
            .retain(|m| m != user);
        self.state.push(MatrixEvent::Kick {
            room: room.0.clone(),
            user: user.0.clone(),
        });
        Ok(())
    }

    async fn ban_user(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
        _reason: Option<&str>,
    ) -> anyhow::Result<()> {
        self.state
            .members
            .lock()
            .unwrap()
            .entry(room.0.clone())
            .or_default()
            .retain(|m| m != user);
        self.state.push(MatrixEvent::Ban {
            room: room.0.clone(),
            user: user.0.clone(),
        });
        Ok(())
    }

    async fn leave_room(&self, room: &MatrixRoomId) -> anyhow::Result<()> {
        self.state
            .members
            .lock()
            .unwrap()
            .entry(room.0.clone())
            .or_default()
            .retain(|m| m != &self.user);
        self.state.push(MatrixEvent::Leave {
            room: room.0.clone(),
            user: self.user.0.clone(),
        });
        Ok(())
    }

    async fn join_room(&self, room: &MatrixRoomId) -> anyhow::Result<()> {
        let mut members = self.state.members.lock().unwrap();
        let entry = members.entry(room.0.clone()).or_default();
        if !entry.contains(&self.user) {
            entry.push(self.user.clone());
        }
        drop(members);
        self.state.push(MatrixEvent::Join {
            room: room.0.clone(),
            user: self.user.0.clone(),
        });
        Ok(())
    }

    async fn get_power_levels(&self, room: &MatrixRoomId) -> anyhow::Result<PowerLevels> {
        Ok(self.state.levels_of(&room.0))
    }

    async fn set_power_levels(
        &self,
        room: &MatrixRoomId,
        levels: &PowerLevels,
    ) -> anyhow::Result<()> {
        self.state
            .levels
            .lock()
            .unwrap()
            .insert(room.0.clone(), levels.clone());
        Ok(())
    }

    async fn get_room_members(&self, room: &MatrixRoomId) -> anyhow::Result<Vec<MatrixUserId>> {
        Ok(self.state.members_of(&room.0))
    }

    async fn upload_media(&self, _mime: &str, _data: Vec<u8>) -> anyhow::Result<String> {
        Ok(format!("mxc://test/{}", self.state.seq.fetch_add(1, Ordering::Relaxed)))
    }

    async fn download_media(&self, _mxc: &str) -> anyhow::Result<Vec<u8>> {
        Ok(vec![0xAB; 64])
    }

    async fn mark_read(&self, room: &MatrixRoomId, event: &MatrixEventId) -> anyhow::Result<()> {
        self.state.push(MatrixEvent::Read {
            room: room.0.clone(),
            event: event.0.clone(),
            user: self.user.0.clone(),
        });
        Ok(())
    }

    async fn set_typing(&self, room: &MatrixRoomId, typing: bool) -> anyhow::Result<()> {
        self.state.push(MatrixEvent::Typing {
            room: room.0.clone(),
            user: self.user.0.clone(),
            typing,
        });
        Ok(())
    }

    async fn get_message_content(
        &self,
        room: &MatrixRoomId,
        event: &MatrixEventId,
    ) -> anyhow::Result<Option<MessageContent>> {
        Ok(self
            .state
            .contents
            .lock()
            .unwrap()
            .get(&(room.0.clone(), event.0.clone()))
            .cloned())
    }

    async fn set_display_name(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_avatar_url(&self, _mxc: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct MockConnector {
    state: Arc<MatrixState>,
    doubles: StdMutex<HashMap<MatrixUserId, Arc<MockIntent>>>,
}

impl MockConnector {
    pub fn new(state: Arc<MatrixState>) -> Self {
        Self {
            state,
            doubles: StdMutex::new(HashMap::new()),
        }
    }

    pub fn register_double(&self, mxid: &str) {
        let user = MatrixUserId::new(mxid);
        let intent = Arc::new(MockIntent {
            user: user.clone(),
            state: Arc::clone(&self.state),
        });
        self.doubles.lock().unwrap().insert(user, intent);
    }
}

impl IntentProvider for MockConnector {
    fn bot(&self) -> Arc<dyn MatrixIntent> {
        Arc::new(MockIntent {
            user: MatrixUserId::new("@bot:test"),
            state: Arc::clone(&self.state),
        })
    }

    fn for_puppet(&self, user: TgUserId) -> Arc<dyn MatrixIntent> {
        Arc::new(MockIntent {
            user: self.puppet_mxid(user),
            state: Arc::clone(&self.state),
        })
    }

    fn for_double_puppet(&self, user: &MatrixUserId) -> Option<Arc<dyn MatrixIntent>> {
        self.doubles
            .lock()
            .unwrap()
            .get(user)
            .map(|i| Arc::clone(i) as Arc<dyn MatrixIntent>)
    }

    fn puppet_mxid(&self, user: TgUserId) -> MatrixUserId {
        MatrixUserId::new(format!("@tg_{}:test", user.0))
    }

    fn puppet_id_of(&self, mxid: &MatrixUserId) -> Option<TgUserId> {
        let local = mxid.0.strip_prefix("@tg_")?.strip_suffix(":test")?;
        local.parse().ok().map(TgUserId)
    }
}

// ---------------------------------------------------------------------------
// Telegram side
// ---------------------------------------------------------------------------

/// One observable transport call.
#[derive(Debug, Clone)]
pub enum TgCall {
    Text { text: String, reply_to: Option<TgMessageId> },
    Media { kind: String, caption: String },
    Edit { msg: TgMessageId, text: String },
    Delete(Vec<TgMessageId>),
    Forward { from_chat: TgChatId, msg: TgMessageId },
    Reaction { msg: TgMessageId, emoji: Option<String> },
    AdminRights { user: TgUserId, rights: AdminRights },
    Kick(TgUserId),
    Typing(bool),
    Read(TgMessageId),
    InviteLink,
}

pub struct MockTelegram {
    actor: TgUserId,
    chat: StdMutex<ChatInfo>,
    users: StdMutex<HashMap<i64, UserInfo>>,
    participants: StdMutex<Vec<ParticipantInfo>>,
    /// Full history, newest first.
    history: StdMutex<Vec<TelegramMessage>>,
    calls: StdMutex<Vec<TgCall>>,
    next_id: AtomicI32,
    /// When set, the next text/media send fails once with this flood wait.
    flood_once: StdMutex<Option<u64>>,
    /// When true, every send fails permanently.
    pub fail_sends: StdMutex<bool>,
}

impl MockTelegram {
    pub fn new(chat: ChatInfo, actor: i64) -> Self {
        Self {
            actor: TgUserId(actor),
            chat: StdMutex::new(chat),
            users: StdMutex::new(HashMap::new()),
            participants: StdMutex::new(Vec::new()),
            history: StdMutex::new(Vec::new()),
            calls: StdMutex::new(Vec::new()),
            next_id: AtomicI32::new(1000),
            flood_once: StdMutex::new(None),
            fail_sends: StdMutex::new(false),
        }
    }

    pub fn channel(chat: i64, actor: i64) -> Self {
        Self::new(
            ChatInfo {
                id: TgChatId(chat),
                kind: PeerKind::Channel,
                title: Some("Test Channel".to_string()),
                about: None,
                username: None,
                photo_id: None,
                member_count: Some(3),
                megagroup: true,
            },
            actor,
        )
    }

    pub fn broadcast(chat: i64, actor: i64) -> Self {
        let mock = Self::channel(chat, actor);
        mock.chat.lock().unwrap().megagroup = false;
        mock
    }

    pub fn private(other: i64, actor: i64) -> Self {
        Self::new(
            ChatInfo {
                id: TgChatId(other),
                kind: PeerKind::User,
                title: Some("Alice".to_string()),
                about: None,
                username: None,
                photo_id: None,
                member_count: None,
                megagroup: false,
            },
            actor,
        )
    }

    pub fn set_member_count(&self, count: u64) {
        self.chat.lock().unwrap().member_count = Some(count);
    }

    pub fn set_participants(&self, participants: Vec<ParticipantInfo>) {
        *self.participants.lock().unwrap() = participants;
    }

    pub fn set_history(&self, mut newest_first: Vec<TelegramMessage>) {
        newest_first.sort_by(|a, b| b.id.0.cmp(&a.id.0));
        *self.history.lock().unwrap() = newest_first;
    }

    pub fn flood_once(&self, seconds: u64) {
        *self.flood_once.lock().unwrap() = Some(seconds);
    }

    pub fn calls(&self) -> Vec<TgCall> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: TgCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Timestamp follows the same id-derived formula as `tg_msg` so tests can
    /// reconstruct the exact content the transport echoed.
    fn sent(&self) -> SentMessage {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        SentMessage {
            id: TgMessageId(id),
            timestamp: Utc.timestamp_opt(1_700_000_000 + i64::from(id), 0).unwrap(),
        }
    }

    fn check_send_gate(&self) -> TgResult<()> {
        if *self.fail_sends.lock().unwrap() {
            return Err(TelegramError::Rpc("send rejected".to_string()));
        }
        if let Some(seconds) = self.flood_once.lock().unwrap().take() {
            return Err(TelegramError::FloodWait(seconds));
        }
        Ok(())
    }
}

#[async_trait]
impl TelegramClient for MockTelegram {
    fn actor_id(&self) -> TgUserId {
        self.actor
    }

    async fn get_entity(&self, _chat: TgChatId) -> TgResult<ChatInfo> {
        Ok(self.chat.lock().unwrap().clone())
    }

    async fn get_user(&self, user: TgUserId) -> TgResult<UserInfo> {
        self.users
            .lock()
            .unwrap()
            .get(&user.0)
            .cloned()
            .ok_or(TelegramError::PeerNotFound(user.0))
    }

    async fn send_text(
        &self,
        _chat: TgChatId,
        text: &str,
        _entities: &[FormatEntity],
        reply_to: Option<TgMessageId>,
    ) -> TgResult<SentMessage> {
        self.check_send_gate()?;
        // Give a concurrently queued send the chance to jump in here if the
        // caller failed to serialize
        tokio::task::yield_now().await;
        self.log(TgCall::Text {
            text: text.to_string(),
            reply_to,
        });
        Ok(self.sent())
    }

    async fn send_media(
        &self,
        _chat: TgChatId,
        media: OutgoingMedia,
        caption: &str,
        _entities: &[FormatEntity],
        _reply_to: Option<TgMessageId>,
    ) -> TgResult<SentMessage> {
        self.check_send_gate()?;
        let kind = match media {
            OutgoingMedia::Photo { .. } => "photo",
            OutgoingMedia::File { .. } => "file",
            OutgoingMedia::Sticker { .. } => "sticker",
            OutgoingMedia::Location { .. } => "location",
        };
        self.log(TgCall::Media {
            kind: kind.to_string(),
            caption: caption.to_string(),
        });
        Ok(self.sent())
    }

    async fn edit_message(
        &self,
        _chat: TgChatId,
        message: TgMessageId,
        text: &str,
        _entities: &[FormatEntity],
    ) -> TgResult<SentMessage> {
        self.check_send_gate()?;
        self.log(TgCall::Edit {
            msg: message,
            text: text.to_string(),
        });
        Ok(SentMessage {
            id: message,
            timestamp: Utc::now(),
        })
    }

    async fn delete_messages(&self, _chat: TgChatId, messages: &[TgMessageId]) -> TgResult<()> {
        self.log(TgCall::Delete(messages.to_vec()));
        Ok(())
    }

    async fn forward_message(
        &self,
        _to_chat: TgChatId,
        from_chat: TgChatId,
        message: TgMessageId,
    ) -> TgResult<SentMessage> {
        self.check_send_gate()?;
        self.log(TgCall::Forward {
            from_chat,
            msg: message,
        });
        Ok(self.sent())
    }

    async fn get_messages(
        &self,
        _chat: TgChatId,
        limit: usize,
        before: Option<TgMessageId>,
    ) -> TgResult<Vec<TelegramMessage>> {
        let history = self.history.lock().unwrap();
        Ok(history
            .iter()
            .filter(|m| before.map_or(true, |b| m.id.0 < b.0))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_participants(&self, _chat: TgChatId) -> TgResult<Vec<ParticipantInfo>> {
        Ok(self.participants.lock().unwrap().clone())
    }

    async fn edit_admin_rights(
        &self,
        _chat: TgChatId,
        user: TgUserId,
        rights: AdminRights,
    ) -> TgResult<()> {
        self.log(TgCall::AdminRights { user, rights });
        Ok(())
    }

    async fn kick_participant(&self, _chat: TgChatId, user: TgUserId) -> TgResult<()> {
        self.log(TgCall::Kick(user));
        Ok(())
    }

    async fn export_invite_link(&self, _chat: TgChatId) -> TgResult<String> {
        self.log(TgCall::InviteLink);
        Ok("https://t.me/+invite".to_string())
    }

    async fn send_typing(&self, _chat: TgChatId, typing: bool) -> TgResult<()> {
        self.log(TgCall::Typing(typing));
        Ok(())
    }

    async fn send_read_receipt(&self, _chat: TgChatId, up_to: TgMessageId) -> TgResult<()> {
        self.log(TgCall::Read(up_to));
        Ok(())
    }

    async fn send_reaction(
        &self,
        _chat: TgChatId,
        message: TgMessageId,
        emoji: Option<&str>,
    ) -> TgResult<()> {
        self.log(TgCall::Reaction {
            msg: message,
            emoji: emoji.map(String::from),
        });
        Ok(())
    }

    async fn download_file(&self, _file_id: i64) -> TgResult<Vec<u8>> {
        Ok(vec![0xCD; 32])
    }

    async fn download_thumbnail(&self, _file_id: i64) -> TgResult<Option<Vec<u8>>> {
        Ok(Some(vec![0x89, b'P', b'N', b'G']))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: BridgeStore,
    pub matrix: Arc<MatrixState>,
    pub connector: Arc<MockConnector>,
    pub registry: Arc<PortalRegistry>,
}

pub fn base_config() -> Config {
    toml::from_str(
        r#"
        [homeserver]
        address = "https://matrix.test"
        domain = "test"
        bot_user_id = "@bot:test"

        [telegram]
        api_id = 12345
        api_hash = "testhash"
        "#,
    )
    .expect("test config must parse")
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let mut config = base_config();
    tweak(&mut config);
    config.validate().expect("tweaked test config must validate");

    let store = BridgeStore::in_memory().expect("in-memory store");
    let matrix = Arc::new(MatrixState::new());
    let connector = Arc::new(MockConnector::new(Arc::clone(&matrix)));
    let puppets = Arc::new(PuppetRegistry::new(store.clone()));
    let deps = Arc::new(PortalDeps {
        store: store.clone(),
        config: Arc::new(config),
        intents: Arc::clone(&connector) as Arc<dyn IntentProvider>,
        formatter: Arc::new(PlainFormatter),
        puppets,
    });
    let registry = Arc::new(PortalRegistry::new(deps));
    Harness {
        store,
        matrix,
        connector,
        registry,
    }
}

/// A plain text message; timestamp derived from the ID so distinct messages
/// hash distinctly.
pub fn tg_msg(id: i32, sender: i64, body: &str) -> TelegramMessage {
    TelegramMessage {
        id: TgMessageId(id),
        sender: Some(TgUserId(sender)),
        timestamp: Utc.timestamp_opt(1_700_000_000 + i64::from(id), 0).unwrap(),
        body: body.to_string(),
        entities: Vec::new(),
        media: None,
        reply_to: None,
        forward_from: None,
        from_bot: false,
        edit_date: None,
    }
}

/// An edit delivery of `id` carrying new content.
pub fn tg_edit(id: i32, sender: i64, body: &str) -> TelegramMessage {
    let mut msg = tg_msg(id, sender, body);
    msg.edit_date = Some(Utc.timestamp_opt(1_700_009_999, 0).unwrap());
    msg
}
