// ABOUTME: matrix-sdk adapter — the only module that touches the SDK directly
// ABOUTME: Implements MatrixIntent per identity and the IntentProvider ghost namespace

use crate::intent::{
    IntentProvider, MatrixIntent, MessageContent, PowerLevels, RoomCreateRequest,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use matrix_sdk::{
    media::{MediaFormat, MediaRequestParameters},
    room::Room,
    ruma::{
        api::client::room::create_room::v3::Request as CreateRoomRequest,
        api::client::room::Visibility,
        assign,
        events::room::encryption::RoomEncryptionEventContent,
        events::room::MediaSource,
        events::receipt::ReceiptThread,
        events::InitialStateEvent,
        events::StateEventType,
        api::client::receipt::create_receipt::v3::ReceiptType,
        OwnedEventId, OwnedMxcUri, OwnedRoomId, OwnedUserId,
    },
    Client, RoomMemberships,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use telebridge_core::ids::{MatrixEventId, MatrixRoomId, MatrixUserId, TgUserId};
use tokio::sync::OnceCell;

/// Prefix of ghost user localparts, `@tg_<id>:<domain>`.
const GHOST_PREFIX: &str = "tg_";

/// One Matrix identity backed by its own SDK client. The client is built on
/// first use so intents can be handed out from sync code.
pub struct SdkIntent {
    user_id: MatrixUserId,
    homeserver: String,
    access_token: String,
    device_id: String,
    client: OnceCell<Client>,
}

impl SdkIntent {
    fn new(user_id: MatrixUserId, homeserver: &str, access_token: &str) -> Self {
        let device_id = format!(
            "telebridge_{}",
            user_id.as_str().trim_start_matches('@').replace(':', "_")
        );
        Self {
            user_id,
            homeserver: homeserver.to_string(),
            access_token: access_token.to_string(),
            device_id,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let client = Client::builder()
                    .homeserver_url(&self.homeserver)
                    .build()
                    .await
                    .context("Failed to create Matrix client")?;
                let user_id: OwnedUserId = self
                    .user_id
                    .as_str()
                    .parse()
                    .context("Invalid Matrix user ID")?;
                let session =
                    matrix_sdk::AuthSession::Matrix(matrix_sdk::authentication::matrix::MatrixSession {
                        meta: matrix_sdk::SessionMeta {
                            user_id,
                            device_id: self.device_id.clone().into(),
                        },
                        tokens: matrix_sdk::SessionTokens {
                            access_token: self.access_token.clone(),
                            refresh_token: None,
                        },
                    });
                client
                    .restore_session(session)
                    .await
                    .context("Failed to restore Matrix session")?;
                tracing::debug!(user_id = %self.user_id, "Matrix intent client ready");
                Ok(client)
            })
            .await
    }

    async fn room(&self, room: &MatrixRoomId) -> Result<Room> {
        let room_id: OwnedRoomId = room.as_str().parse().context("Invalid room ID")?;
        self.client()
            .await?
            .get_room(&room_id)
            .with_context(|| format!("Room {} not known to {}", room, self.user_id))
    }
}

#[async_trait]
impl MatrixIntent for SdkIntent {
    fn user_id(&self) -> &MatrixUserId {
        &self.user_id
    }

    async fn create_room(&self, request: RoomCreateRequest) -> Result<MatrixRoomId> {
        let client = self.client().await?;
        let invite: Vec<OwnedUserId> = request
            .invite
            .iter()
            .filter_map(|u| u.as_str().parse().ok())
            .collect();
        let mut initial_state = Vec::new();
        if request.encrypted {
            initial_state.push(
                InitialStateEvent::with_empty_state_key(
                    RoomEncryptionEventContent::with_recommended_defaults(),
                )
                .to_raw_any(),
            );
        }
        let sdk_request = assign!(CreateRoomRequest::new(), {
            name: request.name.clone(),
            topic: request.topic.clone(),
            is_direct: request.is_direct,
            visibility: Visibility::Private,
            invite,
            initial_state,
        });
        let room = client
            .create_room(sdk_request)
            .await
            .context("Failed to create room")?;
        let room_id = MatrixRoomId::new(room.room_id().as_str());
        if let Some(levels) = &request.power_levels {
            self.set_power_levels(&room_id, levels).await?;
        }
        Ok(room_id)
    }

    async fn send_message(
        &self,
        room: &MatrixRoomId,
        content: &MessageContent,
    ) -> Result<MatrixEventId> {
        let room = self.room(room).await?;
        let raw = serde_json::value::to_raw_value(content)?;
        let response = room
            .send_raw("m.room.message", raw)
            .await
            .context("Failed to send message")?;
        Ok(MatrixEventId::new(response.event_id.as_str()))
    }

    async fn send_state_event(
        &self,
        room: &MatrixRoomId,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> Result<MatrixEventId> {
        let room = self.room(room).await?;
        let raw = serde_json::value::to_raw_value(&content)?;
        let response = room
            .send_state_event_raw(event_type, state_key, raw)
            .await
            .context("Failed to send state event")?;
        Ok(MatrixEventId::new(response.event_id.as_str()))
    }

    async fn send_custom_event(
        &self,
        room: &MatrixRoomId,
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<MatrixEventId> {
        let room = self.room(room).await?;
        let raw = serde_json::value::to_raw_value(&content)?;
        let response = room
            .send_raw(event_type, raw)
            .await
            .context("Failed to send event")?;
        Ok(MatrixEventId::new(response.event_id.as_str()))
    }

    async fn redact(
        &self,
        room: &MatrixRoomId,
        event: &MatrixEventId,
        reason: Option<&str>,
    ) -> Result<MatrixEventId> {
        let room = self.room(room).await?;
        let event_id: OwnedEventId = event.as_str().parse().context("Invalid event ID")?;
        let response = room
            .redact(&event_id, reason, None)
            .await
            .context("Failed to redact event")?;
        Ok(MatrixEventId::new(response.event_id.as_str()))
    }

    async fn invite_user(&self, room: &MatrixRoomId, user: &MatrixUserId) -> Result<()> {
        let room = self.room(room).await?;
        let user_id: OwnedUserId = user.as_str().parse().context("Invalid user ID")?;
        room.invite_user_by_id(&user_id)
            .await
            .context("Failed to invite user")
    }

    async fn kick_user(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
        reason: Option<&str>,
    ) -> Result<()> {
        let room = self.room(room).await?;
        let user_id: OwnedUserId = user.as_str().parse().context("Invalid user ID")?;
        room.kick_user(&user_id, reason)
            .await
            .context("Failed to kick user")
    }

    async fn ban_user(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
        reason: Option<&str>,
    ) -> Result<()> {
        let room = self.room(room).await?;
        let user_id: OwnedUserId = user.as_str().parse().context("Invalid user ID")?;
        room.ban_user(&user_id, reason)
            .await
            .context("Failed to ban user")
    }

    async fn leave_room(&self, room: &MatrixRoomId) -> Result<()> {
        let room = self.room(room).await?;
        room.leave().await.context("Failed to leave room")
    }

    async fn join_room(&self, room: &MatrixRoomId) -> Result<()> {
        let client = self.client().await?;
        let room_id: OwnedRoomId = room.as_str().parse().context("Invalid room ID")?;
        client
            .join_room_by_id(&room_id)
            .await
            .context("Failed to join room")?;
        Ok(())
    }

    async fn get_power_levels(&self, room: &MatrixRoomId) -> Result<PowerLevels> {
        let room = self.room(room).await?;
        let raw = room
            .get_state_event(StateEventType::RoomPowerLevels, "")
            .await
            .context("Failed to fetch power levels")?;
        let Some(raw) = raw else {
            return Ok(PowerLevels::default());
        };
        let event: serde_json::Value = match &raw {
            matrix_sdk::deserialized_responses::RawAnySyncOrStrippedState::Sync(raw) => {
                raw.deserialize_as_unchecked().unwrap_or_default()
            }
            matrix_sdk::deserialized_responses::RawAnySyncOrStrippedState::Stripped(raw) => {
                raw.deserialize_as_unchecked().unwrap_or_default()
            }
        };
        let content = event.get("content").cloned().unwrap_or(event);
        Ok(serde_json::from_value(content).unwrap_or_default())
    }

    async fn set_power_levels(&self, room: &MatrixRoomId, levels: &PowerLevels) -> Result<()> {
        let content = serde_json::to_value(levels)?;
        self.send_state_event(room, "m.room.power_levels", "", content)
            .await?;
        Ok(())
    }

    async fn get_room_members(&self, room: &MatrixRoomId) -> Result<Vec<MatrixUserId>> {
        let room = self.room(room).await?;
        let members = room
            .members(RoomMemberships::ACTIVE)
            .await
            .context("Failed to get room members")?;
        Ok(members
            .into_iter()
            .map(|m| MatrixUserId::new(m.user_id().as_str()))
            .collect())
    }

    async fn upload_media(&self, mime: &str, data: Vec<u8>) -> Result<String> {
        let client = self.client().await?;
        let content_type: mime_guess::mime::Mime = mime
            .parse()
            .unwrap_or(mime_guess::mime::APPLICATION_OCTET_STREAM);
        let response = client
            .media()
            .upload(&content_type, data, None)
            .await
            .context("Failed to upload media")?;
        Ok(response.content_uri.to_string())
    }

    async fn download_media(&self, mxc: &str) -> Result<Vec<u8>> {
        let client = self.client().await?;
        let uri: OwnedMxcUri = mxc.into();
        let request = MediaRequestParameters {
            source: MediaSource::Plain(uri),
            format: MediaFormat::File,
        };
        client
            .media()
            .get_media_content(&request, true)
            .await
            .context("Failed to download media")
    }

    async fn mark_read(&self, room: &MatrixRoomId, event: &MatrixEventId) -> Result<()> {
        let room = self.room(room).await?;
        let event_id: OwnedEventId = event.as_str().parse().context("Invalid event ID")?;
        room.send_single_receipt(ReceiptType::Read, ReceiptThread::Unthreaded, event_id)
            .await
            .context("Failed to send read receipt")
    }

    async fn set_typing(&self, room: &MatrixRoomId, typing: bool) -> Result<()> {
        let room = self.room(room).await?;
        room.typing_notice(typing)
            .await
            .context("Failed to set typing state")
    }

    async fn get_message_content(
        &self,
        room: &MatrixRoomId,
        event: &MatrixEventId,
    ) -> Result<Option<MessageContent>> {
        let room = self.room(room).await?;
        let event_id: OwnedEventId = event.as_str().parse().context("Invalid event ID")?;
        let timeline_event = match room.event(&event_id, None).await {
            Ok(ev) => ev,
            Err(e) => {
                tracing::debug!(event = %event_id, error = %e, "Event fetch failed");
                return Ok(None);
            }
        };
        let value: serde_json::Value =
            serde_json::from_str(timeline_event.raw().json().get()).unwrap_or_default();
        let Some(content) = value.get("content") else {
            return Ok(None);
        };
        Ok(serde_json::from_value(content.clone()).ok())
    }

    async fn set_display_name(&self, name: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .account()
            .set_display_name(Some(name))
            .await
            .context("Failed to set display name")
    }

    async fn set_avatar_url(&self, mxc: &str) -> Result<()> {
        let client = self.client().await?;
        let uri: OwnedMxcUri = mxc.into();
        client
            .account()
            .set_avatar_url(Some(&uri))
            .await
            .context("Failed to set avatar")
    }
}

/// Intent factory for every identity the bridge acts through: the service
/// account, ghost puppets in the `tg_` namespace, and double puppets bound
/// by logged-in users.
///
/// Ghost intents authenticate with the bridge's appservice token; the
/// homeserver's appservice registration must cover the ghost namespace.
pub struct MatrixConnector {
    homeserver: String,
    domain: String,
    as_token: String,
    bot: Arc<SdkIntent>,
    ghosts: StdMutex<HashMap<TgUserId, Arc<SdkIntent>>>,
    doubles: StdMutex<HashMap<MatrixUserId, Arc<SdkIntent>>>,
}

impl MatrixConnector {
    pub fn new(homeserver: &str, domain: &str, bot_user_id: &str, as_token: &str) -> Self {
        let bot = Arc::new(SdkIntent::new(
            MatrixUserId::new(bot_user_id),
            homeserver,
            as_token,
        ));
        Self {
            homeserver: homeserver.to_string(),
            domain: domain.to_string(),
            as_token: as_token.to_string(),
            bot,
            ghosts: StdMutex::new(HashMap::new()),
            doubles: StdMutex::new(HashMap::new()),
        }
    }

    /// Bind a user's own access token so the bridge can act as them.
    pub fn register_double_puppet(&self, mxid: &MatrixUserId, access_token: &str) {
        let intent = Arc::new(SdkIntent::new(mxid.clone(), &self.homeserver, access_token));
        self.doubles
            .lock()
            .expect("double puppet map poisoned")
            .insert(mxid.clone(), intent);
    }

    pub fn unregister_double_puppet(&self, mxid: &MatrixUserId) {
        self.doubles
            .lock()
            .expect("double puppet map poisoned")
            .remove(mxid);
    }
}

impl IntentProvider for MatrixConnector {
    fn bot(&self) -> Arc<dyn MatrixIntent> {
        Arc::clone(&self.bot) as Arc<dyn MatrixIntent>
    }

    fn for_puppet(&self, user: TgUserId) -> Arc<dyn MatrixIntent> {
        let mut ghosts = self.ghosts.lock().expect("ghost map poisoned");
        let intent = ghosts.entry(user).or_insert_with(|| {
            Arc::new(SdkIntent::new(
                self.puppet_mxid(user),
                &self.homeserver,
                &self.as_token,
            ))
        });
        Arc::clone(intent) as Arc<dyn MatrixIntent>
    }

    fn for_double_puppet(&self, user: &MatrixUserId) -> Option<Arc<dyn MatrixIntent>> {
        self.doubles
            .lock()
            .expect("double puppet map poisoned")
            .get(user)
            .map(|i| Arc::clone(i) as Arc<dyn MatrixIntent>)
    }

    fn puppet_mxid(&self, user: TgUserId) -> MatrixUserId {
        MatrixUserId::new(format!("@{}{}:{}", GHOST_PREFIX, user.0, self.domain))
    }

    fn puppet_id_of(&self, mxid: &MatrixUserId) -> Option<TgUserId> {
        let localpart = mxid
            .as_str()
            .strip_prefix('@')?
            .strip_suffix(&format!(":{}", self.domain))?;
        let id = localpart.strip_prefix(GHOST_PREFIX)?;
        id.parse::<i64>().ok().map(TgUserId)
    }
}
