// ABOUTME: Remote-to-local message conversion — media transfer, captions, replies, forwards
// ABOUTME: Every TelegramMedia variant maps to a concrete local event or a labeled notice

use crate::intent::{Formatter, IntentProvider, MatrixIntent, MediaInfo, MessageContent, MsgType};
use crate::puppet::PuppetRegistry;
use crate::store::BridgeStore;
use crate::telegram::TelegramClient;
use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use telebridge_core::config::BridgeConfig;
use telebridge_core::ids::{MatrixRoomId, ShortMessageId, TgSpace};
use telebridge_core::media::{
    Document, DocumentKind, ForwardOrigin, GeoPoint, Photo, TelegramMedia, TelegramMessage,
};
use telebridge_core::render;

/// Everything conversion needs from the portal, borrowed for one message.
pub struct ConvertContext<'a> {
    pub config: &'a BridgeConfig,
    pub formatter: &'a dyn Formatter,
    pub store: &'a BridgeStore,
    pub intents: &'a dyn IntentProvider,
    pub puppets: &'a PuppetRegistry,
    /// The ghost that will send the resulting events; uploads go through it.
    pub sender_intent: &'a dyn MatrixIntent,
    /// Session that delivered the update, used for downloads and lookups.
    pub client: &'a dyn TelegramClient,
    pub space: TgSpace,
    pub room: &'a MatrixRoomId,
}

/// Output of converting one remote message.
pub struct ConvertedMessage {
    pub main: MessageContent,
    /// Separate caption event, when captions are not folded into the media
    /// event.
    pub caption: Option<MessageContent>,
    /// Time until a disappearing photo should be marked expired.
    pub expires_in: Option<Duration>,
}

impl ConvertedMessage {
    fn plain(main: MessageContent) -> Self {
        Self { main, caption: None, expires_in: None }
    }
}

/// Convert a remote message to local event content. Returns None for
/// messages that carry nothing bridgeable.
pub async fn convert_message(
    ctx: &ConvertContext<'_>,
    msg: &TelegramMessage,
) -> Result<Option<ConvertedMessage>> {
    if msg.is_empty() {
        return Ok(None);
    }

    let mut converted = match &msg.media {
        Some(media) => convert_media(ctx, msg, media).await?,
        None => {
            let (body, html) = ctx.formatter.telegram_to_matrix(&msg.body, &msg.entities);
            let mut content = match html {
                Some(html) => MessageContent::html(body, html),
                None => MessageContent::text(body),
            };
            if msg.from_bot && ctx.config.bot_messages_as_notices {
                content.msgtype = MsgType::Notice;
            }
            ConvertedMessage::plain(content)
        }
    };

    if let Some(origin) = &msg.forward_from {
        apply_forward_header(ctx, &mut converted.main, origin).await;
    }
    if let Some(reply_to) = msg.reply_to {
        apply_reply(ctx, &mut converted.main, reply_to).await?;
    }

    Ok(Some(converted))
}

async fn convert_media(
    ctx: &ConvertContext<'_>,
    msg: &TelegramMessage,
    media: &TelegramMedia,
) -> Result<ConvertedMessage> {
    match media {
        TelegramMedia::Photo(photo) => convert_photo(ctx, msg, photo).await,
        TelegramMedia::Document(doc) => convert_document(ctx, msg, doc).await,
        TelegramMedia::Location(point) => Ok(ConvertedMessage::plain(location_content(point, None))),
        TelegramMedia::LiveLocation { point, period_secs } => {
            Ok(ConvertedMessage::plain(location_content(point, Some(*period_secs))))
        }
        TelegramMedia::Venue { point, title, address } => {
            let body = format!("{}\n{}\n{}", title, address, render::map_link(point));
            let mut content = MessageContent::text(body);
            content.msgtype = MsgType::Location;
            content.geo_uri = Some(render::geo_uri(point));
            Ok(ConvertedMessage::plain(content))
        }
        TelegramMedia::Poll(poll) => {
            let short_id = ShortMessageId::new(ctx.space, msg.id);
            let body = render::render_poll(poll, short_id, &ctx.config.command_prefix);
            Ok(ConvertedMessage::plain(MessageContent::notice(body)))
        }
        TelegramMedia::Game { title, description } => {
            let short_id = ShortMessageId::new(ctx.space, msg.id);
            let body = render::render_game(title, description, short_id, &ctx.config.command_prefix);
            Ok(ConvertedMessage::plain(MessageContent::notice(body)))
        }
        TelegramMedia::Dice { kind, value } => {
            Ok(ConvertedMessage::plain(MessageContent::text(render::render_dice(*kind, *value))))
        }
        TelegramMedia::Contact(contact) => {
            // A shared contact is the one place profile data arrives outside
            // a user update, so feed it to the puppet while we have it.
            if let Some(user_id) = contact.user_id {
                if let Ok(info) = ctx.client.get_user(user_id).await {
                    let puppet = ctx.puppets.get(user_id).await?;
                    let source = format!("tg-{}", ctx.client.actor_id());
                    if let Err(e) = puppet.update_info(&source, &info, ctx.intents).await {
                        tracing::debug!(user = %user_id, error = %e, "Contact puppet refresh failed");
                    }
                }
            }
            Ok(ConvertedMessage::plain(MessageContent::text(render::render_contact(contact))))
        }
        TelegramMedia::Unsupported { type_name } => {
            tracing::info!(chat_space = %ctx.space, media = %type_name, "Bridging unsupported media as notice");
            Ok(ConvertedMessage::plain(MessageContent::notice(render::unsupported_notice(type_name))))
        }
    }
}

async fn convert_photo(
    ctx: &ConvertContext<'_>,
    msg: &TelegramMessage,
    photo: &Photo,
) -> Result<ConvertedMessage> {
    let expires_in = match photo.ttl_secs {
        Some(ttl) => {
            let deadline = msg.timestamp + chrono::Duration::seconds(i64::from(ttl));
            let remaining = deadline - Utc::now();
            if remaining <= chrono::Duration::zero() {
                // Already gone on the remote side; the payload is not
                // retrievable anymore.
                return Ok(ConvertedMessage::plain(MessageContent::notice(
                    "This photo has self-destructed and is no longer available.",
                )));
            }
            let capped = (remaining.num_seconds() as u64).min(ctx.config.max_scheduled_ttl_secs);
            Some(Duration::from_secs(capped))
        }
        None => None,
    };

    let data = ctx
        .client
        .download_file(photo.file_id)
        .await
        .context("Failed to download photo")?;
    let size = data.len() as u64;
    let mxc = ctx.sender_intent.upload_media("image/jpeg", data).await?;

    let mut content = MessageContent::text("image".to_string());
    content.msgtype = MsgType::Image;
    content.url = Some(mxc);
    let largest = photo.largest();
    content.info = Some(MediaInfo {
        mimetype: Some("image/jpeg".to_string()),
        size: Some(size),
        width: largest.map(|s| s.width),
        height: largest.map(|s| s.height),
        ..MediaInfo::default()
    });

    let caption = attach_caption(ctx, msg, &mut content, None);
    Ok(ConvertedMessage { main: content, caption, expires_in })
}

async fn convert_document(
    ctx: &ConvertContext<'_>,
    msg: &TelegramMessage,
    doc: &Document,
) -> Result<ConvertedMessage> {
    if doc.kind.needs_sticker_conversion() {
        return convert_animated_sticker(ctx, doc).await;
    }

    let data = ctx
        .client
        .download_file(doc.file_id)
        .await
        .context("Failed to download document")?;
    let size = data.len() as u64;
    let mxc = ctx.sender_intent.upload_media(&doc.mime_type, data).await?;

    let thumbnail_url = if doc.has_thumbnail {
        match ctx.client.download_thumbnail(doc.file_id).await {
            Ok(Some(thumb)) => Some(ctx.sender_intent.upload_media("image/png", thumb).await?),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(file = doc.file_id, error = %e, "Thumbnail download failed");
                None
            }
        }
    } else {
        None
    };

    let msgtype = match doc.kind {
        DocumentKind::Video | DocumentKind::Gif => MsgType::Video,
        DocumentKind::Audio | DocumentKind::Voice => MsgType::Audio,
        DocumentKind::Sticker => MsgType::Sticker,
        _ => MsgType::File,
    };
    let body = match doc.kind {
        DocumentKind::Sticker => doc.sticker_alt.clone().unwrap_or_else(|| "sticker".to_string()),
        _ => doc.file_name.clone().unwrap_or_else(|| default_file_name(doc.kind)),
    };

    let mut content = MessageContent::text(body);
    content.msgtype = msgtype;
    content.url = Some(mxc);
    content.info = Some(MediaInfo {
        mimetype: Some(doc.mime_type.clone()),
        size: Some(size),
        width: doc.width,
        height: doc.height,
        duration: doc.duration_secs.map(|d| d * 1000),
        thumbnail_url,
        waveform: doc.waveform.clone(),
    });

    let caption = attach_caption(ctx, msg, &mut content, doc.file_name.as_deref());
    Ok(ConvertedMessage { main: content, caption, expires_in: None })
}

/// Animated and video stickers use codecs local clients cannot render. The
/// remote side keeps a static preview for every sticker; bridge that at the
/// configured dimension instead of the raw payload.
async fn convert_animated_sticker(
    ctx: &ConvertContext<'_>,
    doc: &Document,
) -> Result<ConvertedMessage> {
    let thumb = ctx
        .client
        .download_thumbnail(doc.file_id)
        .await
        .context("Failed to download sticker preview")?;
    let body = doc.sticker_alt.clone().unwrap_or_else(|| "sticker".to_string());
    let Some(thumb) = thumb else {
        tracing::info!(file = doc.file_id, "Sticker has no static preview, sending alt text");
        return Ok(ConvertedMessage::plain(MessageContent::text(body)));
    };

    let size = thumb.len() as u64;
    let mxc = ctx.sender_intent.upload_media("image/png", thumb).await?;
    let max_dim = ctx.config.animated_sticker_max_dimension;
    let (width, height) = scale_to_fit(doc.width, doc.height, max_dim);

    let mut content = MessageContent::text(body);
    content.msgtype = MsgType::Sticker;
    content.url = Some(mxc);
    content.info = Some(MediaInfo {
        mimetype: Some("image/png".to_string()),
        size: Some(size),
        width,
        height,
        ..MediaInfo::default()
    });
    Ok(ConvertedMessage::plain(content))
}

/// Scale reported dimensions down so neither exceeds `max_dim`, preserving
/// aspect ratio.
fn scale_to_fit(width: Option<u32>, height: Option<u32>, max_dim: u32) -> (Option<u32>, Option<u32>) {
    match (width, height) {
        (Some(w), Some(h)) if w.max(h) > max_dim && w > 0 && h > 0 => {
            let long = w.max(h) as u64;
            let scaled_w = (w as u64 * max_dim as u64 / long) as u32;
            let scaled_h = (h as u64 * max_dim as u64 / long) as u32;
            (Some(scaled_w.max(1)), Some(scaled_h.max(1)))
        }
        other => other,
    }
}

fn default_file_name(kind: DocumentKind) -> String {
    match kind {
        DocumentKind::Video => "video.mp4",
        DocumentKind::Gif => "animation.mp4",
        DocumentKind::Audio => "audio.mp3",
        DocumentKind::Voice => "voice_message.ogg",
        _ => "file",
    }
    .to_string()
}

/// Route the message body as a caption: folded into the media event or
/// returned as a second event, per config. A caption that merely repeats the
/// filename is dropped either way.
fn attach_caption(
    ctx: &ConvertContext<'_>,
    msg: &TelegramMessage,
    media_content: &mut MessageContent,
    file_name: Option<&str>,
) -> Option<MessageContent> {
    let caption = render::effective_caption(&msg.body, file_name)?;
    let (body, html) = ctx.formatter.telegram_to_matrix(caption, &msg.entities);
    if ctx.config.caption_in_message {
        media_content.filename = Some(media_content.body.clone());
        media_content.body = body;
        media_content.formatted_body = html;
        if media_content.formatted_body.is_some() {
            media_content.format = Some("org.matrix.custom.html".to_string());
        }
        None
    } else {
        Some(match html {
            Some(html) => MessageContent::html(body, html),
            None => MessageContent::text(body),
        })
    }
}

fn location_content(point: &GeoPoint, live_period: Option<u32>) -> MessageContent {
    let mut body = format!(
        "Location: {}\n{}",
        render::format_coordinates(point),
        render::map_link(point)
    );
    if let Some(period) = live_period {
        body.push_str(&format!("\n(live location, updating for {}s)", period));
    }
    let mut content = MessageContent::text(body);
    content.msgtype = MsgType::Location;
    content.geo_uri = Some(render::geo_uri(point));
    content
}

/// Prepend the forward attribution line, resolving the origin to a human
/// name where the session can see it.
async fn apply_forward_header(
    ctx: &ConvertContext<'_>,
    content: &mut MessageContent,
    origin: &ForwardOrigin,
) {
    let name = match origin {
        ForwardOrigin::User(user) => {
            match ctx.puppets.get(*user).await.ok() {
                Some(puppet) => match puppet.display_name().await {
                    Some(name) => name,
                    None => match ctx.client.get_user(*user).await {
                        Ok(info) => crate::puppet::display_name_of(&info)
                            .unwrap_or_else(|| user.to_string()),
                        Err(_) => user.to_string(),
                    },
                },
                None => user.to_string(),
            }
        }
        ForwardOrigin::Channel { chat, post } => {
            if let Some(post) = post {
                // Channel spaces are the chat itself, so the packed identity
                // is resolvable by any viewer.
                content.forward_source =
                    Some(ShortMessageId::new(TgSpace(chat.0), *post).encode());
            }
            match ctx.client.get_entity(*chat).await {
                Ok(info) => info.title.unwrap_or_else(|| chat.to_string()),
                Err(_) => chat.to_string(),
            }
        }
        ForwardOrigin::HiddenUser(name) => name.clone(),
    };
    let header = format!("Forwarded from {}", name);
    if matches!(content.msgtype, MsgType::Text | MsgType::Notice | MsgType::Emote) {
        content.body = format!("{}:\n{}", header, content.body);
        if let Some(html) = &content.formatted_body {
            content.formatted_body = Some(format!("<b>{}:</b><br/>{}", header, html));
        }
    } else if content.filename.is_some() {
        // Media with folded caption: keep the header in the visible body
        content.body = format!("{}:\n{}", header, content.body);
    }
}

/// Resolve the remote reply target to its local original event. A missing or
/// still-placeholder mapping degrades to no relation rather than an error.
async fn apply_reply(
    ctx: &ConvertContext<'_>,
    content: &mut MessageContent,
    reply_to: telebridge_core::ids::TgMessageId,
) -> Result<()> {
    let record = match ctx.store.get_message(reply_to, ctx.space, 0)? {
        Some(record) if !record.mxid.is_placeholder() => record,
        _ => {
            tracing::debug!(reply_to = %reply_to, space = %ctx.space, "Reply target not bridged, dropping relation");
            return Ok(());
        }
    };
    let quoted = match ctx
        .sender_intent
        .get_message_content(ctx.room, &record.mxid)
        .await
    {
        Ok(Some(target_content)) => {
            let sender_mxid = record
                .sender
                .map(|s| ctx.intents.puppet_mxid(s));
            sender_mxid.map(|mxid| (mxid, target_content.body))
        }
        _ => None,
    };
    match &quoted {
        Some((sender, body)) => content.set_reply(record.mxid.clone(), Some((sender, body.as_str()))),
        None => content.set_reply(record.mxid.clone(), None),
    }
    Ok(())
}
