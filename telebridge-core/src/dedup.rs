// ABOUTME: Per-portal bounded deduplication cache with the two-phase check/update protocol
// ABOUTME: Maps message ID or content-hash fingerprints to the local event they produced

use crate::ids::{MatrixEventId, PeerKind, TgSpace};
use crate::media::{ForwardOrigin, TelegramMedia, TelegramMessage};
use std::collections::{HashMap, VecDeque};

/// What a cache entry resolves to: the local event a remote message became,
/// and the space it was observed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupMapping {
    pub event_id: MatrixEventId,
    pub space: TgSpace,
}

impl DedupMapping {
    pub fn new(event_id: MatrixEventId, space: TgSpace) -> Self {
        Self { event_id, space }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DedupKey {
    Id(i32),
    Hash([u8; 32]),
}

/// Bounded FIFO dedup cache, one per portal, process-lifetime only.
///
/// Lookups are keyed by raw message ID when the portal's peer kind gives
/// message IDs a shared per-chat namespace, and by content hash otherwise.
/// Every entry also gets a hash-keyed side row so ID-based and hash-based
/// lookups of the same message agree.
///
/// The check/update split exists because the portal must publish a local
/// event before it knows the final identity the mapping should carry:
/// `check` reserves the slot under a placeholder, `update` commits the real
/// mapping and reports whether a concurrent delivery won the race instead.
pub struct DedupCache {
    peer_kind: PeerKind,
    max_len: usize,
    entries: HashMap<DedupKey, DedupMapping>,
    /// Insertion order of logical entries; each holds every key that must be
    /// dropped together on eviction.
    order: VecDeque<Vec<DedupKey>>,
    actions: HashMap<[u8; 32], ()>,
    action_order: VecDeque<[u8; 32]>,
}

pub const DEFAULT_CACHE_LEN: usize = 256;

impl DedupCache {
    pub fn new(peer_kind: PeerKind, max_len: usize) -> Self {
        Self {
            peer_kind,
            max_len: max_len.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            actions: HashMap::new(),
            action_order: VecDeque::new(),
        }
    }

    /// Content fingerprint under this cache's peer kind; see [`hash_message`].
    pub fn hash(&self, msg: &TelegramMessage) -> [u8; 32] {
        hash_message(self.peer_kind, msg)
    }

    fn primary_key(&self, msg: &TelegramMessage, force_hash: bool) -> DedupKey {
        if force_hash || self.peer_kind.requires_hash_dedup() {
            DedupKey::Hash(self.hash(msg))
        } else {
            DedupKey::Id(msg.id.0)
        }
    }

    /// Look up a message; reserve `proposed` on a miss.
    ///
    /// Returns the previously stored mapping on a hit (pure read, nothing is
    /// inserted), or `None` after reserving the slot on a miss. The reserve
    /// also writes a hash side row so a later hash-forced lookup of the same
    /// message hits.
    pub fn check(
        &mut self,
        msg: &TelegramMessage,
        proposed: DedupMapping,
        force_hash: bool,
    ) -> Option<DedupMapping> {
        let key = self.primary_key(msg, force_hash);
        if let Some(existing) = self.entries.get(&key) {
            return Some(existing.clone());
        }
        // Also try the hash row in case the message was first seen through a
        // hash-forced path.
        let hash_key = DedupKey::Hash(self.hash(msg));
        if hash_key != key {
            if let Some(existing) = self.entries.get(&hash_key) {
                return Some(existing.clone());
            }
        }
        self.insert(msg, key, proposed);
        None
    }

    /// Commit the final mapping for a message whose slot `check` reserved.
    ///
    /// If the stored mapping no longer equals `expected_prior`, a concurrent
    /// delivery already resolved this message differently; the conflicting
    /// mapping is returned so the caller can redact its own duplicate local
    /// event. Otherwise `confirmed` is committed and `None` returned.
    pub fn update(
        &mut self,
        msg: &TelegramMessage,
        confirmed: DedupMapping,
        expected_prior: &DedupMapping,
        force_hash: bool,
    ) -> Option<DedupMapping> {
        let key = self.primary_key(msg, force_hash);
        match self.entries.get(&key) {
            Some(current) if current != expected_prior => return Some(current.clone()),
            Some(_) => {
                let hash_key = DedupKey::Hash(self.hash(msg));
                self.entries.insert(key, confirmed.clone());
                if hash_key != key {
                    self.entries.insert(hash_key, confirmed);
                }
            }
            // Aged out between check and update; re-insert rather than lose
            // the mapping.
            None => self.insert(msg, key, confirmed),
        }
        None
    }

    /// Coarser duplicate check for service actions (title changes, photo
    /// edits). Returns true when the action was already seen.
    pub fn check_action(&mut self, msg: &TelegramMessage) -> bool {
        let key = self.hash(msg);
        if self.actions.contains_key(&key) {
            return true;
        }
        if self.action_order.len() >= self.max_len {
            if let Some(oldest) = self.action_order.pop_front() {
                self.actions.remove(&oldest);
            }
        }
        self.actions.insert(key, ());
        self.action_order.push_back(key);
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn insert(&mut self, msg: &TelegramMessage, key: DedupKey, mapping: DedupMapping) {
        if self.order.len() >= self.max_len {
            if let Some(keys) = self.order.pop_front() {
                for k in keys {
                    self.entries.remove(&k);
                }
            }
        }
        let hash_key = DedupKey::Hash(self.hash(msg));
        let mut keys = vec![key];
        self.entries.insert(key, mapping.clone());
        if hash_key != key {
            self.entries.insert(hash_key, mapping);
            keys.push(hash_key);
        }
        self.order.push_back(keys);
    }
}

/// Content fingerprint of a message: truncated-to-second timestamp, trimmed
/// body, and media-identifying fields. The message ID itself is included only
/// when the peer kind guarantees it means something within the chat; legacy
/// groups redeliver the same logical message under different IDs, so there it
/// must not contribute.
///
/// Free-standing so callers that only need a fingerprint, such as the echo
/// record of an outgoing send, do not have to hold the cache.
pub fn hash_message(peer_kind: PeerKind, msg: &TelegramMessage) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&msg.timestamp.timestamp().to_be_bytes());
    hasher.update(msg.body.trim().as_bytes());
    if !peer_kind.requires_hash_dedup() {
        hasher.update(&msg.id.0.to_be_bytes());
    }
    if let Some(media) = &msg.media {
        hash_media(&mut hasher, media);
    }
    if let Some(fwd) = &msg.forward_from {
        match fwd {
            ForwardOrigin::User(u) => hasher.update(&u.0.to_be_bytes()),
            ForwardOrigin::Channel { chat, post } => {
                hasher.update(&chat.0.to_be_bytes());
                hasher.update(&post.map(|p| p.0).unwrap_or(0).to_be_bytes())
            }
            ForwardOrigin::HiddenUser(name) => hasher.update(name.as_bytes()),
        };
    }
    *hasher.finalize().as_bytes()
}

fn hash_media(hasher: &mut blake3::Hasher, media: &TelegramMedia) {
    match media {
        TelegramMedia::Photo(p) => {
            hasher.update(b"photo");
            hasher.update(&p.file_id.to_be_bytes());
        }
        TelegramMedia::Document(d) => {
            hasher.update(b"document");
            hasher.update(&d.file_id.to_be_bytes());
        }
        TelegramMedia::Location(point)
        | TelegramMedia::LiveLocation { point, .. }
        | TelegramMedia::Venue { point, .. } => {
            hasher.update(b"geo");
            // Rounded so insignificant precision jitter still matches.
            hasher.update(&((point.lat * 1e5) as i64).to_be_bytes());
            hasher.update(&((point.long * 1e5) as i64).to_be_bytes());
        }
        TelegramMedia::Poll(p) => {
            hasher.update(b"poll");
            hasher.update(p.question.as_bytes());
        }
        TelegramMedia::Dice { kind, value } => {
            hasher.update(b"dice");
            hasher.update(format!("{:?}:{}", kind, value).as_bytes());
        }
        TelegramMedia::Game { title, .. } => {
            hasher.update(b"game");
            hasher.update(title.as_bytes());
        }
        TelegramMedia::Contact(c) => {
            hasher.update(b"contact");
            hasher.update(c.phone_number.as_bytes());
        }
        TelegramMedia::Unsupported { type_name } => {
            hasher.update(b"unsupported");
            hasher.update(type_name.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{TgMessageId, TgUserId};
    use chrono::{TimeZone, Utc};

    fn msg(id: i32, body: &str) -> TelegramMessage {
        TelegramMessage {
            id: TgMessageId(id),
            sender: Some(TgUserId(1)),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            body: body.into(),
            entities: vec![],
            media: None,
            reply_to: None,
            forward_from: None,
            from_bot: false,
            edit_date: None,
        }
    }

    fn mapping(ev: &str) -> DedupMapping {
        DedupMapping::new(MatrixEventId::new(ev), TgSpace(555))
    }

    #[test]
    fn miss_reserves_then_hit_returns_reserved() {
        let mut cache = DedupCache::new(PeerKind::Channel, 16);
        let m = msg(100, "hello");
        assert_eq!(cache.check(&m, mapping("$tmp-1"), false), None);
        assert_eq!(cache.check(&m, mapping("$other"), false), Some(mapping("$tmp-1")));
    }

    #[test]
    fn hit_is_a_pure_read() {
        let mut cache = DedupCache::new(PeerKind::Channel, 16);
        let m = msg(100, "hello");
        cache.check(&m, mapping("$a"), false);
        cache.check(&m, mapping("$b"), false);
        // Still the first mapping, the second check inserted nothing
        assert_eq!(cache.check(&m, mapping("$c"), false), Some(mapping("$a")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn update_commits_when_prior_matches() {
        let mut cache = DedupCache::new(PeerKind::Channel, 16);
        let m = msg(100, "hello");
        let placeholder = mapping("$tmp-1");
        cache.check(&m, placeholder.clone(), false);
        assert_eq!(cache.update(&m, mapping("$final"), &placeholder, false), None);
        assert_eq!(cache.check(&m, mapping("$x"), false), Some(mapping("$final")));
    }

    #[test]
    fn update_reports_lost_race() {
        let mut cache = DedupCache::new(PeerKind::Channel, 16);
        let m = msg(100, "hello");
        let ours = mapping("$tmp-ours");
        cache.check(&m, ours.clone(), false);
        // A concurrent handler committed its own mapping first
        cache.update(&m, mapping("$theirs"), &ours, false);
        // Simulate our own handler discovering it lost
        let conflict = cache.update(&m, mapping("$ours-final"), &ours, false);
        assert_eq!(conflict, Some(mapping("$theirs")));
    }

    #[test]
    fn legacy_group_dedups_by_content_despite_different_ids() {
        let mut cache = DedupCache::new(PeerKind::Chat, 16);
        let first = msg(100, "same text");
        let redelivery = msg(101, "same text");
        cache.check(&first, mapping("$a"), false);
        // Different message ID, identical content and timestamp: still a hit
        assert_eq!(cache.check(&redelivery, mapping("$b"), false), Some(mapping("$a")));
    }

    #[test]
    fn channel_messages_with_same_body_stay_distinct() {
        let mut cache = DedupCache::new(PeerKind::Channel, 16);
        cache.check(&msg(100, "same"), mapping("$a"), false);
        assert_eq!(cache.check(&msg(101, "same"), mapping("$b"), false), None);
    }

    #[test]
    fn hash_forced_lookup_agrees_with_id_lookup() {
        let mut cache = DedupCache::new(PeerKind::Channel, 16);
        let m = msg(100, "hello");
        cache.check(&m, mapping("$a"), false);
        // Edit detection forces the hash path; the side row must hit
        assert_eq!(cache.check(&m, mapping("$b"), true), Some(mapping("$a")));
    }

    #[test]
    fn fifo_eviction_drops_both_rows() {
        let mut cache = DedupCache::new(PeerKind::Channel, 2);
        let m0 = msg(100, "zero");
        cache.check(&m0, mapping("$0"), false);
        cache.check(&msg(101, "one"), mapping("$1"), false);
        cache.check(&msg(102, "two"), mapping("$2"), false);
        // m0 was evicted, ID and hash rows both gone
        assert_eq!(cache.check(&m0, mapping("$again"), false), None);
        assert_eq!(cache.check(&m0, mapping("$x"), true), Some(mapping("$again")));
    }

    #[test]
    fn standalone_hash_agrees_with_cache_hash() {
        let cache = DedupCache::new(PeerKind::Channel, 16);
        let mut m = msg(100, "hello");
        assert_eq!(hash_message(PeerKind::Channel, &m), cache.hash(&m));

        // The fingerprint covers more than the body: a media change alone
        // must move it.
        let plain = hash_message(PeerKind::Channel, &m);
        m.media = Some(TelegramMedia::Dice { kind: crate::media::DiceKind::Die, value: 4 });
        assert_ne!(hash_message(PeerKind::Channel, &m), plain);
        assert_eq!(hash_message(PeerKind::Channel, &m), cache.hash(&m));
    }

    #[test]
    fn action_cache_suppresses_repeats() {
        let mut cache = DedupCache::new(PeerKind::Channel, 16);
        let m = msg(200, "title changed");
        assert!(!cache.check_action(&m));
        assert!(cache.check_action(&m));
    }
}
