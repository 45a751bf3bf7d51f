//! Cache of established matches.
//!
//! Some remote types (tags) cannot carry a reference back to the local
//! database, so finding their counterpart means a remote search. The cache
//! remembers matches for the life of the object and, when a settings store is
//! attached, across processes. Entries never expire; call
//! [`MatchCache::refresh`] after maintenance that clears the shared copy.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use mirrorsync_common::{Error, ObjectId, ProfileId, Result, Side};
use mirrorsync_storage::{LocalStore, ObjectStore, RemoteStore};

use crate::entity::{Counterpart, Entity};
use crate::lock::SettingsStore;
use crate::matcher::{MatchResult, Matcher};
use crate::pair::Pair;
use crate::result::MatchStatus;

/// Local id to remote id map for one entity type and profile.
pub struct MatchCache {
    entity_type: String,
    profile: ProfileId,
    settings: Option<Arc<dyn SettingsStore>>,
    entries: Mutex<BTreeMap<ObjectId, ObjectId>>,
}

impl MatchCache {
    /// Process-local cache.
    pub fn new(entity_type: impl Into<String>, profile: ProfileId) -> Self {
        Self {
            entity_type: entity_type.into(),
            profile,
            settings: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Share the cache through `settings`.
    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Settings key holding the shared copy.
    pub fn settings_key(entity_type: &str, profile: ProfileId) -> String {
        format!("match_cache.{}.{}", entity_type, profile)
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<ObjectId, ObjectId>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("match cache poisoned".to_string()))
    }

    /// Counterpart id of `id` on the other side.
    pub fn lookup(&self, side: Side, id: &ObjectId) -> Option<ObjectId> {
        let entries = self.entries().ok()?;
        match side {
            Side::Local => entries.get(id).cloned(),
            Side::Remote => entries
                .iter()
                .find(|(_, remote)| *remote == id)
                .map(|(local, _)| local.clone()),
        }
    }

    pub fn insert(&self, local: ObjectId, remote: ObjectId) {
        if let Ok(mut entries) = self.entries() {
            // One entry per remote id as well.
            entries.retain(|_, existing| *existing != remote);
            entries.insert(local, remote);
        }
    }

    /// Drop the entry containing `id` on `side`.
    pub fn remove(&self, side: Side, id: &ObjectId) {
        if let Ok(mut entries) = self.entries() {
            match side {
                Side::Local => {
                    entries.remove(id);
                }
                Side::Remote => entries.retain(|_, remote| remote != id),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the in-memory entries with the shared copy.
    ///
    /// # Returns
    /// Number of entries loaded.
    pub async fn refresh(&self) -> Result<usize> {
        let Some(settings) = &self.settings else {
            return Ok(self.len());
        };
        let key = Self::settings_key(&self.entity_type, self.profile);
        let loaded: Vec<(String, String)> = match settings.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        let decoded = loaded
            .iter()
            .map(|(local, remote)| Ok((ObjectId::decode(local)?, ObjectId::decode(remote)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let count = decoded.len();
        *self.entries()? = decoded;
        debug!("Loaded {} cached {} matches", count, self.entity_type);
        Ok(count)
    }

    /// Write the in-memory entries to the shared copy.
    pub async fn persist(&self) -> Result<()> {
        let Some(settings) = &self.settings else {
            return Ok(());
        };
        let encoded: Vec<(String, String)> = self
            .entries()?
            .iter()
            .map(|(local, remote)| (local.encode(), remote.encode()))
            .collect();
        settings
            .set(
                &Self::settings_key(&self.entity_type, self.profile),
                &serde_json::to_string(&encoded)?,
            )
            .await
    }

    /// Empty both the in-memory and the shared copy.
    pub async fn clear(&self) -> Result<()> {
        self.entries()?.clear();
        if let Some(settings) = &self.settings {
            settings
                .remove(&Self::settings_key(&self.entity_type, self.profile))
                .await?;
        }
        info!("Cleared {} match cache", self.entity_type);
        Ok(())
    }
}

/// Matcher consulting a [`MatchCache`] before delegating.
pub struct CachedMatcher<E: Entity, M: Matcher<E>> {
    inner: M,
    cache: Arc<MatchCache>,
    local: Arc<dyn LocalStore<E::Local>>,
    remote: Arc<dyn RemoteStore<E::Remote>>,
}

impl<E: Entity, M: Matcher<E>> CachedMatcher<E, M> {
    pub fn new(
        inner: M,
        cache: Arc<MatchCache>,
        local: Arc<dyn LocalStore<E::Local>>,
        remote: Arc<dyn RemoteStore<E::Remote>>,
    ) -> Self {
        Self {
            inner,
            cache,
            local,
            remote,
        }
    }

    pub fn cache(&self) -> &Arc<MatchCache> {
        &self.cache
    }

    /// Load the cached counterpart, `None` if it vanished.
    async fn load_cached(&self, target: Side, id: &ObjectId) -> Result<Option<Counterpart<E>>> {
        Ok(match target {
            Side::Local => self
                .local
                .load(id)
                .await?
                .map(Counterpart::local_snapshot),
            Side::Remote => self
                .remote
                .load(id)
                .await?
                .map(Counterpart::remote_snapshot),
        })
    }
}

#[async_trait]
impl<E: Entity, M: Matcher<E>> Matcher<E> for CachedMatcher<E, M> {
    async fn try_to_find_match_for(&self, pair: &Pair<E>) -> MatchResult<E> {
        let origin = pair.origin();
        let origin_id = pair.id_of(origin).cloned();

        if let Some(id) = &origin_id {
            if let Some(cached) = self.cache.lookup(origin, id) {
                match self.load_cached(origin.opposite(), &cached).await {
                    Ok(Some(counterpart)) => {
                        debug!("{} {} matched from cache", E::TYPE, id);
                        return MatchResult::found(counterpart);
                    }
                    Ok(None) => {
                        warn!("Cached {} match {} vanished, dropping entry", E::TYPE, cached);
                        self.cache.remove(origin, id);
                    }
                    Err(e) => return MatchResult::error(format!("cache lookup failed: {}", e)),
                }
            }
        }

        let result = self.inner.try_to_find_match_for(pair).await;
        if result.status == MatchStatus::FoundMatch {
            let counterpart_id = result.counterpart.as_ref().and_then(|c| c.id()).cloned();
            if let (Some(origin_id), Some(counterpart_id)) = (origin_id, counterpart_id) {
                match origin {
                    Side::Local => self.cache.insert(origin_id, counterpart_id),
                    Side::Remote => self.cache.insert(counterpart_id, origin_id),
                }
            }
        }
        result
    }

    fn matched(&self, local_id: &ObjectId, remote_id: &ObjectId) {
        self.cache.insert(local_id.clone(), remote_id.clone());
        self.inner.matched(local_id, remote_id);
    }
}
