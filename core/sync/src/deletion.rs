//! Ledger of remote objects this system deleted on purpose.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use mirrorsync_common::{Error, ObjectId, ProfileId, Result};

/// One tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionEntry {
    pub entity_type: String,
    pub profile_id: ProfileId,
    pub remote_id: ObjectId,
    pub deleted_at: DateTime<Utc>,
}

/// Tombstones consulted before treating an inbound remote object as new.
#[async_trait]
pub trait DeletionLedger: Send + Sync {
    /// Record a deliberate deletion. Recording twice keeps one entry.
    async fn record(&self, entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> Result<()>;

    async fn contains(&self, entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> Result<bool>;

    /// Remove a tombstone.
    ///
    /// # Returns
    /// `false` if there was none.
    async fn forget(&self, entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> Result<bool>;

    async fn list(&self, profile: ProfileId) -> Result<Vec<DeletionEntry>>;
}

type LedgerKey = (String, ProfileId, ObjectId);

/// In-memory deletion ledger.
#[derive(Default)]
pub struct MemoryDeletionLedger {
    entries: Mutex<BTreeMap<LedgerKey, DateTime<Utc>>>,
}

impl MemoryDeletionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<LedgerKey, DateTime<Utc>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("deletion ledger poisoned".to_string()))
    }

    fn key(entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> LedgerKey {
        (entity_type.to_string(), profile, remote_id.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeletionLedger for MemoryDeletionLedger {
    async fn record(&self, entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> Result<()> {
        self.entries()?
            .entry(Self::key(entity_type, profile, remote_id))
            .or_insert_with(Utc::now);
        Ok(())
    }

    async fn contains(&self, entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> Result<bool> {
        Ok(self
            .entries()?
            .contains_key(&Self::key(entity_type, profile, remote_id)))
    }

    async fn forget(&self, entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> Result<bool> {
        Ok(self
            .entries()?
            .remove(&Self::key(entity_type, profile, remote_id))
            .is_some())
    }

    async fn list(&self, profile: ProfileId) -> Result<Vec<DeletionEntry>> {
        Ok(self
            .entries()?
            .iter()
            .filter(|((_, p, _), _)| *p == profile)
            .map(|((entity_type, profile_id, remote_id), deleted_at)| DeletionEntry {
                entity_type: entity_type.clone(),
                profile_id: *profile_id,
                remote_id: remote_id.clone(),
                deleted_at: *deleted_at,
            })
            .collect())
    }
}
