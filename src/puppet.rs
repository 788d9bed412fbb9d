// ABOUTME: Ghost identities for remote users, with displayname trust scoring
// ABOUTME: Registry does keyed get-or-create so concurrent resolutions share one instance

use crate::intent::IntentProvider;
use crate::store::{BridgeStore, PuppetRecord};
use crate::telegram::UserInfo;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use telebridge_core::ids::{MatrixUserId, TgUserId};
use telebridge_core::locks::KeyedLocks;
use tokio::sync::Mutex;

/// Trust score of a proposed display name. Contact-sourced full names score
/// highest; bot-API lookups with only a first name score lowest.
pub fn name_quality(info: &UserInfo) -> i64 {
    let mut quality = 0;
    if info.first_name.as_deref().is_some_and(|n| !n.is_empty()) {
        quality += 40;
    }
    if info.last_name.as_deref().is_some_and(|n| !n.is_empty()) {
        quality += 20;
    }
    if info.from_contact {
        quality += 40;
    }
    quality
}

pub fn display_name_of(info: &UserInfo) -> Option<String> {
    match (&info.first_name, &info.last_name) {
        (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
        (Some(first), None) => Some(first.clone()),
        (None, Some(last)) => Some(last.clone()),
        (None, None) => info.username.clone(),
    }
}

/// One remote user's ghost, shared across portals.
pub struct Puppet {
    pub id: TgUserId,
    record: Mutex<PuppetRecord>,
    store: BridgeStore,
}

impl Puppet {
    fn new(record: PuppetRecord, store: BridgeStore) -> Self {
        Self {
            id: record.id,
            record: Mutex::new(record),
            store,
        }
    }

    pub async fn record(&self) -> PuppetRecord {
        self.record.lock().await.clone()
    }

    pub async fn display_name(&self) -> Option<String> {
        self.record.lock().await.display_name.clone()
    }

    pub async fn custom_mxid(&self) -> Option<MatrixUserId> {
        self.record.lock().await.custom_mxid.clone()
    }

    pub async fn is_premium(&self) -> bool {
        self.record.lock().await.is_premium
    }

    /// Whether a display name proposed by `source` with the given quality
    /// may overwrite the stored one. The slot's current owner may always
    /// update it; anyone else must match or beat the stored quality, so a
    /// bot-sourced heuristic never clobbers a verified contact name.
    fn accepts_name(record: &PuppetRecord, source: &str, quality: i64) -> bool {
        match &record.name_source {
            Some(owner) if owner == source => true,
            _ => quality >= record.name_quality,
        }
    }

    /// Apply fresh profile data from a session, updating the ghost's Matrix
    /// profile where it changed.
    pub async fn update_info(
        &self,
        source: &str,
        info: &UserInfo,
        intents: &dyn IntentProvider,
    ) -> Result<()> {
        let mut record = self.record.lock().await;
        let mut dirty = false;

        let proposed_quality = name_quality(info);
        let proposed_name = display_name_of(info);
        if proposed_name != record.display_name
            && Self::accepts_name(&record, source, proposed_quality)
        {
            if let Some(name) = &proposed_name {
                intents.for_puppet(self.id).set_display_name(name).await?;
            }
            tracing::debug!(
                user = %self.id,
                quality = proposed_quality,
                source = source,
                "Updating puppet display name"
            );
            record.display_name = proposed_name;
            record.name_quality = proposed_quality;
            record.name_source = Some(source.to_string());
            dirty = true;
        }

        if info.username != record.username {
            record.username = info.username.clone();
            dirty = true;
        }
        if info.photo_id != record.photo_id {
            record.photo_id = info.photo_id;
            dirty = true;
        }
        if info.is_bot != record.is_bot || info.is_premium != record.is_premium {
            record.is_bot = info.is_bot;
            record.is_premium = info.is_premium;
            dirty = true;
        }

        if dirty {
            self.store.save_puppet(&record)?;
        }
        Ok(())
    }

    pub async fn set_custom_mxid(&self, mxid: Option<MatrixUserId>) -> Result<()> {
        let mut record = self.record.lock().await;
        record.custom_mxid = mxid;
        self.store.save_puppet(&record)
    }
}

/// Process-wide puppet cache. Get-or-create is serialized per user ID so two
/// concurrent first-time resolutions cannot create divergent instances.
pub struct PuppetRegistry {
    store: BridgeStore,
    cache: StdMutex<HashMap<TgUserId, Arc<Puppet>>>,
    creation_locks: KeyedLocks<TgUserId>,
}

impl PuppetRegistry {
    pub fn new(store: BridgeStore) -> Self {
        Self {
            store,
            cache: StdMutex::new(HashMap::new()),
            creation_locks: KeyedLocks::new(),
        }
    }

    fn cached(&self, id: TgUserId) -> Option<Arc<Puppet>> {
        self.cache.lock().expect("puppet cache poisoned").get(&id).cloned()
    }

    pub async fn get(&self, id: TgUserId) -> Result<Arc<Puppet>> {
        if let Some(puppet) = self.cached(id) {
            return Ok(puppet);
        }
        let _guard = self.creation_locks.acquire(id).await;
        // Re-check under the key lock: the previous holder may have created it
        if let Some(puppet) = self.cached(id) {
            return Ok(puppet);
        }
        let record = match self.store.get_puppet(id)? {
            Some(record) => record,
            None => {
                let record = PuppetRecord::new(id);
                self.store.save_puppet(&record)?;
                record
            }
        };
        let puppet = Arc::new(Puppet::new(record, self.store.clone()));
        self.cache
            .lock()
            .expect("puppet cache poisoned")
            .insert(id, Arc::clone(&puppet));
        Ok(puppet)
    }

    /// Resolve the puppet bound to a real local account, if any.
    pub async fn get_by_custom_mxid(&self, mxid: &MatrixUserId) -> Result<Option<Arc<Puppet>>> {
        {
            let cache = self.cache.lock().expect("puppet cache poisoned");
            for puppet in cache.values() {
                if let Ok(record) = puppet.record.try_lock() {
                    if record.custom_mxid.as_ref() == Some(mxid) {
                        return Ok(Some(Arc::clone(puppet)));
                    }
                }
            }
        }
        match self.store.get_puppet_by_custom_mxid(mxid)? {
            Some(record) => Ok(Some(self.get(record.id).await?)),
            None => Ok(None),
        }
    }
}
