// ABOUTME: Integration tests for the local-to-remote delivery path
// ABOUTME: Sends, replies, forwards, edits, reaction caps, redactions, admin rights

mod common;

use common::*;
use telebridge::ids::{
    MatrixEventId, MatrixRoomId, MatrixUserId, PeerKind, ShortMessageId, TgChatId, TgMessageId,
    TgSpace, TgUserId,
};
use telebridge::intent::{
    IntentProvider, MessageContent, MsgType, PowerLevels, Relation, MESSAGE_STATUS_EVENT,
};
use telebridge::portal::Portal;
use telebridge::puppet::PuppetRegistry;
use telebridge::store::{MessageRecord, PortalRecord, EDIT_INDEX_LATEST};
use telebridge::telegram::UserInfo;
use std::sync::Arc;

const CHAT: i64 = -1004321;
const ACTOR: i64 = 42;
const ROOM: &str = "!bridged:test";

/// A portal whose room already exists, as after a completed inbound bridge.
async fn seeded_portal(h: &Harness) -> Arc<Portal> {
    let mut record = PortalRecord::new(TgChatId(CHAT), TgUserId(CHAT), PeerKind::Channel);
    record.mxid = Some(MatrixRoomId::new(ROOM));
    record.title = Some("Test Channel".to_string());
    h.store.save_portal(&record).unwrap();
    h.registry
        .get_by_tgid(TgChatId(CHAT), TgUserId(ACTOR), PeerKind::Channel)
        .await
        .unwrap()
}

/// A previously bridged remote message the local side can reply to, edit,
/// react to, or redact.
fn seeded_message(h: &Harness, tg_msg: i32, mxid: &str, edit_index: i32) {
    h.store
        .insert_message(&MessageRecord {
            tg_msg: TgMessageId(tg_msg),
            tg_space: TgSpace(CHAT),
            mxid: MatrixEventId::new(mxid),
            mx_room: MatrixRoomId::new(ROOM),
            edit_index,
            content_hash: [0; 32],
            sender: Some(TgUserId(5)),
            redacted: false,
        })
        .unwrap();
}

fn statuses(h: &Harness) -> Vec<serde_json::Value> {
    h.matrix
        .custom_events(MESSAGE_STATUS_EVENT)
        .into_iter()
        .map(|(_, _, content)| content)
        .collect()
}

// =============================================================================
// SCENARIO: Plain text delivery persists the echo mapping and reports success
// =============================================================================
#[tokio::test]
async fn scenario_text_delivery_records_mapping_and_status() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;

    let event = MatrixEventId::new("$local-1:test");
    portal
        .handle_local_message(&client, &event, &MessageContent::text("off to telegram"))
        .await
        .unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        &calls[0],
        TgCall::Text { text, reply_to: None } if text == "off to telegram"
    ));

    // The echo mapping lets the update stream recognize our own send
    let mapping = h
        .store
        .get_message_by_mxid(&event, &MatrixRoomId::new(ROOM))
        .unwrap()
        .expect("sent message must be mapped");
    assert_eq!(mapping.tg_msg, TgMessageId(1000));
    assert_eq!(mapping.sender, Some(TgUserId(ACTOR)));

    let statuses = statuses(&h);
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["status"], "SUCCESS");
    assert_eq!(statuses[0]["m.relates_to"]["event_id"], "$local-1:test");
}

// =============================================================================
// SCENARIO: Concurrent sends hold the space lock across send and record
// =============================================================================
#[tokio::test]
async fn scenario_concurrent_sends_keep_order() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;

    let first = MatrixEventId::new("$local-a:test");
    let second = MatrixEventId::new("$local-b:test");
    let alpha = MessageContent::text("alpha");
    let beta = MessageContent::text("beta");
    let (a, b) = tokio::join!(
        portal.handle_local_message(&client, &first, &alpha),
        portal.handle_local_message(&client, &second, &beta),
    );
    a.unwrap();
    b.unwrap();

    let texts: Vec<String> = client
        .calls()
        .into_iter()
        .map(|c| match c {
            TgCall::Text { text, .. } => text,
            other => panic!("expected text send, got {:?}", other),
        })
        .collect();
    assert_eq!(texts.len(), 2);

    // Whichever send went first got remote ID 1000; each event's mapping must
    // carry the ID its own transport call produced, never its neighbor's.
    let room = MatrixRoomId::new(ROOM);
    let map_a = h
        .store
        .get_message_by_mxid(&first, &room)
        .unwrap()
        .expect("first send must be mapped");
    let map_b = h
        .store
        .get_message_by_mxid(&second, &room)
        .unwrap()
        .expect("second send must be mapped");
    let (winner, loser) = if texts[0] == "alpha" {
        (map_a.tg_msg, map_b.tg_msg)
    } else {
        (map_b.tg_msg, map_a.tg_msg)
    };
    assert_eq!(winner, TgMessageId(1000));
    assert_eq!(loser, TgMessageId(1001));

    assert!(h.matrix.redactions().is_empty(), "serialized sends race nothing");
    let statuses = statuses(&h);
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s["status"] == "SUCCESS"));
}

// =============================================================================
// SCENARIO: The echoed copy of our own send suppresses a content-free edit
// =============================================================================
#[tokio::test]
async fn scenario_echo_edit_of_local_send_is_suppressed() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;

    let event = MatrixEventId::new("$local-1:test");
    portal
        .handle_local_message(&client, &event, &MessageContent::text("pinned later"))
        .await
        .unwrap();
    let mapping = h
        .store
        .get_message_by_mxid(&event, &MatrixRoomId::new(ROOM))
        .unwrap()
        .expect("sent message must be mapped");
    assert_eq!(mapping.tg_msg, TgMessageId(1000));

    // A remote pin redelivers the message as an edit with identical content;
    // the stored echo hash must recognize it as a no-op.
    portal
        .handle_remote_message(&h.registry, &client, &tg_edit(1000, ACTOR, "pinned later"))
        .await
        .unwrap();

    assert!(
        h.matrix.messages().is_empty(),
        "an unchanged echo must not bridge an edit event"
    );
    let latest = h
        .store
        .get_message(TgMessageId(1000), TgSpace(CHAT), EDIT_INDEX_LATEST)
        .unwrap()
        .expect("chain head survives");
    assert_eq!(latest.edit_index, 0, "the chain must not have grown");
}

// =============================================================================
// SCENARIO: A flood wait pauses and retries once
// =============================================================================
#[tokio::test]
async fn scenario_flood_wait_retried_once() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    client.flood_once(0);
    let portal = seeded_portal(&h).await;

    portal
        .handle_local_message(
            &client,
            &MatrixEventId::new("$local-1:test"),
            &MessageContent::text("eventually delivered"),
        )
        .await
        .unwrap();

    // The first attempt died at the gate; the retry is the one logged call
    assert_eq!(client.calls().len(), 1);
    assert_eq!(statuses(&h)[0]["status"], "SUCCESS");
}

// =============================================================================
// SCENARIO: Permanent failure surfaces a status event and a room notice
// =============================================================================
#[tokio::test]
async fn scenario_permanent_failure_reports_status_and_notice() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    *client.fail_sends.lock().unwrap() = true;
    let portal = seeded_portal(&h).await;

    let event = MatrixEventId::new("$local-1:test");
    portal
        .handle_local_message(&client, &event, &MessageContent::text("doomed"))
        .await
        .unwrap();

    assert!(client.calls().is_empty());
    let statuses = statuses(&h);
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["status"], "FAIL_PERMANENT");

    let messages = h.matrix.messages();
    assert_eq!(messages.len(), 1, "failure notice expected");
    let notice = &messages[0].3;
    assert_eq!(notice.msgtype, MsgType::Notice);
    assert!(notice.body.contains("was not bridged"));

    assert!(
        h.store
            .get_message_by_mxid(&event, &MatrixRoomId::new(ROOM))
            .unwrap()
            .is_none(),
        "failed send must not leave a mapping"
    );
}

#[tokio::test]
async fn scenario_failure_notice_can_be_disabled() {
    let h = harness_with(|c| c.bridge.delivery_error_notices = false);
    let client = MockTelegram::channel(CHAT, ACTOR);
    *client.fail_sends.lock().unwrap() = true;
    let portal = seeded_portal(&h).await;

    portal
        .handle_local_message(
            &client,
            &MatrixEventId::new("$local-1:test"),
            &MessageContent::text("quietly doomed"),
        )
        .await
        .unwrap();

    assert_eq!(statuses(&h)[0]["status"], "FAIL_PERMANENT");
    assert!(h.matrix.messages().is_empty(), "no notice when disabled");
}

// =============================================================================
// SCENARIO: Notice bridging honors its toggle
// =============================================================================
#[tokio::test]
async fn scenario_notices_dropped_when_disabled() {
    let h = harness_with(|c| c.bridge.bridge_notices = false);
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;

    portal
        .handle_local_message(
            &client,
            &MatrixEventId::new("$local-1:test"),
            &MessageContent::notice("bot chatter"),
        )
        .await
        .unwrap();

    assert!(client.calls().is_empty());
    assert!(statuses(&h).is_empty());
}

// =============================================================================
// SCENARIO: Replies resolve their remote counterpart
// =============================================================================
#[tokio::test]
async fn scenario_reply_targets_remote_message() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;
    seeded_message(&h, 7, "$orig:test", 0);

    let content = MessageContent {
        relates_to: Some(Relation::ReplyTo {
            event_id: MatrixEventId::new("$orig:test"),
        }),
        ..MessageContent::text("> <@tg_5:test> original\n\nmy answer")
    };
    portal
        .handle_local_message(&client, &MatrixEventId::new("$local-1:test"), &content)
        .await
        .unwrap();

    let calls = client.calls();
    assert!(matches!(
        &calls[0],
        TgCall::Text { text, reply_to: Some(TgMessageId(7)) } if text == "my answer"
    ));
}

// =============================================================================
// SCENARIO: A forward token turns into a native remote forward
// =============================================================================
#[tokio::test]
async fn scenario_forward_token_uses_native_forward() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;

    // The source message lives in another bridged chat
    let src_chat = -1009999_i64;
    let mut src = PortalRecord::new(TgChatId(src_chat), TgUserId(src_chat), PeerKind::Channel);
    src.mxid = Some(MatrixRoomId::new("!src:test"));
    h.store.save_portal(&src).unwrap();
    h.store
        .insert_message(&MessageRecord {
            tg_msg: TgMessageId(55),
            tg_space: TgSpace(src_chat),
            mxid: MatrixEventId::new("$src-msg:test"),
            mx_room: MatrixRoomId::new("!src:test"),
            edit_index: 0,
            content_hash: [0; 32],
            sender: Some(TgUserId(5)),
            redacted: false,
        })
        .unwrap();

    let token = ShortMessageId::new(TgSpace(src_chat), TgMessageId(55)).encode();
    let content = MessageContent {
        forward_source: Some(token),
        ..MessageContent::text("forwarded thing")
    };
    portal
        .handle_local_message(&client, &MatrixEventId::new("$local-1:test"), &content)
        .await
        .unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        &calls[0],
        TgCall::Forward { from_chat, msg } if *from_chat == TgChatId(src_chat) && *msg == TgMessageId(55)
    ));
    assert_eq!(statuses(&h)[0]["status"], "SUCCESS");
}

#[tokio::test]
async fn scenario_stale_forward_token_falls_back_to_text() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;

    // Token is well-formed but its source was never bridged here
    let token = ShortMessageId::new(TgSpace(12345), TgMessageId(1)).encode();
    let content = MessageContent {
        forward_source: Some(token),
        ..MessageContent::text("forwarded thing")
    };
    portal
        .handle_local_message(&client, &MatrixEventId::new("$local-1:test"), &content)
        .await
        .unwrap();

    assert!(matches!(&client.calls()[0], TgCall::Text { .. }));
}

// =============================================================================
// SCENARIO: Local edits rewrite the remote message in place
// =============================================================================
#[tokio::test]
async fn scenario_local_edit_rewrites_remote() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;
    seeded_message(&h, 7, "$orig:test", 0);

    let content = MessageContent {
        relates_to: Some(Relation::Replace {
            event_id: MatrixEventId::new("$orig:test"),
        }),
        ..MessageContent::text("* fixed wording")
    };
    portal
        .handle_local_message(&client, &MatrixEventId::new("$edit-1:test"), &content)
        .await
        .unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        &calls[0],
        TgCall::Edit { msg: TgMessageId(7), text } if text == "fixed wording"
    ));
    assert_eq!(statuses(&h)[0]["status"], "SUCCESS");
}

// =============================================================================
// SCENARIO: The reaction cap evicts the oldest reaction
// =============================================================================
#[tokio::test]
async fn scenario_reaction_cap_evicts_oldest() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;
    seeded_message(&h, 7, "$orig:test", 0);
    let origin = MatrixEventId::new("$orig:test");

    portal
        .handle_local_reaction(&client, &MatrixEventId::new("$r1:test"), &origin, "👍")
        .await
        .unwrap();
    // Second distinct emoji exceeds the default cap of one
    portal
        .handle_local_reaction(&client, &MatrixEventId::new("$r2:test"), &origin, "🔥")
        .await
        .unwrap();

    let redactions = h.matrix.redactions();
    assert_eq!(redactions.len(), 1);
    assert_eq!(redactions[0].1, "$r1:test");
    assert_eq!(redactions[0].2.as_deref(), Some("reaction limit"));

    let held = h.store.reactions_by_user(&origin, TgUserId(ACTOR)).unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].reaction, "🔥");

    // Re-setting the emoji the user already holds evicts nothing
    portal
        .handle_local_reaction(&client, &MatrixEventId::new("$r3:test"), &origin, "🔥")
        .await
        .unwrap();
    assert_eq!(h.matrix.redactions().len(), 1);
    assert_eq!(
        h.store.reactions_by_user(&origin, TgUserId(ACTOR)).unwrap().len(),
        1
    );
}

#[tokio::test]
async fn scenario_premium_account_gets_larger_cap() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);

    // Mark the acting account premium before the portal first looks it up
    let puppets = PuppetRegistry::new(h.store.clone());
    let puppet = puppets.get(TgUserId(ACTOR)).await.unwrap();
    let info = UserInfo {
        id: TgUserId(ACTOR),
        first_name: Some("Premium".to_string()),
        last_name: None,
        username: None,
        phone: None,
        photo_id: None,
        is_bot: false,
        is_premium: true,
        from_contact: true,
    };
    puppet
        .update_info("contact", &info, h.connector.as_ref() as &dyn IntentProvider)
        .await
        .unwrap();

    let portal = seeded_portal(&h).await;
    seeded_message(&h, 7, "$orig:test", 0);
    let origin = MatrixEventId::new("$orig:test");

    for (n, emoji) in ["👍", "🔥", "🎉"].into_iter().enumerate() {
        portal
            .handle_local_reaction(
                &client,
                &MatrixEventId::new(format!("$r{}:test", n)),
                &origin,
                emoji,
            )
            .await
            .unwrap();
    }
    assert!(h.matrix.redactions().is_empty(), "three reactions fit the premium cap");
    assert_eq!(
        h.store.reactions_by_user(&origin, TgUserId(ACTOR)).unwrap().len(),
        3
    );

    portal
        .handle_local_reaction(&client, &MatrixEventId::new("$r4:test"), &origin, "💯")
        .await
        .unwrap();
    let redactions = h.matrix.redactions();
    assert_eq!(redactions.len(), 1, "fourth reaction evicts the oldest");
    assert_eq!(redactions[0].1, "$r0:test");
}

// =============================================================================
// SCENARIO: Redactions delete the remote message only for the chain origin
// =============================================================================
#[tokio::test]
async fn scenario_redaction_semantics_per_chain_position() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;
    seeded_message(&h, 7, "$orig:test", 0);
    seeded_message(&h, 7, "$edit:test", 1);

    // Redacting an edit event hides the revision locally only
    portal
        .handle_local_redaction(&client, &MatrixEventId::new("$edit:test"))
        .await
        .unwrap();
    assert!(client.calls().is_empty());

    // Redacting the origin deletes the remote message
    portal
        .handle_local_redaction(&client, &MatrixEventId::new("$orig:test"))
        .await
        .unwrap();
    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(&calls[0], TgCall::Delete(ids) if ids == &[TgMessageId(7)]));
}

#[tokio::test]
async fn scenario_reaction_redaction_retracts_remote_reaction() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;
    seeded_message(&h, 7, "$orig:test", 0);
    let origin = MatrixEventId::new("$orig:test");

    portal
        .handle_local_reaction(&client, &MatrixEventId::new("$r1:test"), &origin, "👍")
        .await
        .unwrap();
    portal
        .handle_local_redaction(&client, &MatrixEventId::new("$r1:test"))
        .await
        .unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(
        &calls[1],
        TgCall::Reaction { msg: TgMessageId(7), emoji: None }
    ));
    assert!(h.store.reactions_by_user(&origin, TgUserId(ACTOR)).unwrap().is_empty());
}

// =============================================================================
// SCENARIO: Power-level changes become admin-rights edits for ghosts only
// =============================================================================
#[tokio::test]
async fn scenario_power_levels_promote_ghost_only() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;

    let acting = MatrixUserId::new("@admin:test");
    let old = PowerLevels::default();
    let mut new = PowerLevels::default();
    new.users.insert(acting.clone(), 75);
    new.users.insert(MatrixUserId::new("@tg_9:test"), 50);
    new.users.insert(MatrixUserId::new("@human:test"), 50);

    portal
        .handle_local_power_levels(&client, &acting, &old, &new)
        .await
        .unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 1, "only the ghost user maps to a remote account");
    match &calls[0] {
        TgCall::AdminRights { user, rights } => {
            assert_eq!(*user, TgUserId(9));
            assert!(rights.ban_users);
            assert!(!rights.add_admins);
        }
        other => panic!("expected admin rights call, got {:?}", other),
    }
}

// =============================================================================
// SCENARIO: Membership, typing, and read receipts pass through
// =============================================================================
#[tokio::test]
async fn scenario_ghost_removal_kicks_remote_participant() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;

    portal
        .handle_local_removal(&client, &MatrixUserId::new("@tg_9:test"))
        .await
        .unwrap();
    portal
        .handle_local_removal(&client, &MatrixUserId::new("@human:test"))
        .await
        .unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 1, "non-ghost removals stay local");
    assert!(matches!(&calls[0], TgCall::Kick(TgUserId(9))));
}

#[tokio::test]
async fn scenario_typing_and_read_passthrough() {
    let h = harness();
    let client = MockTelegram::channel(CHAT, ACTOR);
    let portal = seeded_portal(&h).await;
    seeded_message(&h, 7, "$orig:test", 0);

    portal.handle_local_typing(&client, true).await.unwrap();
    portal
        .handle_local_read(&client, &MatrixEventId::new("$orig:test"))
        .await
        .unwrap();

    let calls = client.calls();
    assert!(matches!(&calls[0], TgCall::Typing(true)));
    assert!(matches!(&calls[1], TgCall::Read(TgMessageId(7))));
}
