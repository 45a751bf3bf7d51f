//! Persisted links between local and remote objects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

use mirrorsync_common::{Error, ObjectId, ProfileId, Result, Side};

use crate::result::Outcome;

/// Record of the last sync of one local/remote pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Row id, `None` until first saved.
    pub id: Option<i64>,
    pub entity_type: String,
    pub profile_id: ProfileId,
    pub local_id: Option<ObjectId>,
    pub remote_id: Option<ObjectId>,
    /// Side that triggered the last sync.
    pub origin: Side,
    pub sync_time: DateTime<Utc>,
    pub local_pre_sync_modified: Option<DateTime<Utc>>,
    pub local_post_sync_modified: Option<DateTime<Utc>>,
    pub remote_pre_sync_modified: Option<DateTime<Utc>>,
    pub remote_post_sync_modified: Option<DateTime<Utc>>,
    /// Terminal outcome of the last attempt.
    pub status: Outcome,
}

impl SyncState {
    /// New, unsaved state.
    pub fn new(entity_type: impl Into<String>, profile_id: ProfileId, origin: Side, status: Outcome) -> Self {
        Self {
            id: None,
            entity_type: entity_type.into(),
            profile_id,
            local_id: None,
            remote_id: None,
            origin,
            sync_time: Utc::now(),
            local_pre_sync_modified: None,
            local_post_sync_modified: None,
            remote_pre_sync_modified: None,
            remote_post_sync_modified: None,
            status,
        }
    }

    pub fn id_on(&self, side: Side) -> Option<&ObjectId> {
        match side {
            Side::Local => self.local_id.as_ref(),
            Side::Remote => self.remote_id.as_ref(),
        }
    }

    /// Whether both sides are known.
    pub fn is_linked(&self) -> bool {
        self.local_id.is_some() && self.remote_id.is_some()
    }

    pub fn pre_sync_modified(&self, side: Side) -> Option<DateTime<Utc>> {
        match side {
            Side::Local => self.local_pre_sync_modified,
            Side::Remote => self.remote_pre_sync_modified,
        }
    }

    /// Modification time of `side` right after the last settled sync.
    pub fn post_sync_modified(&self, side: Side) -> Option<DateTime<Utc>> {
        match side {
            Side::Local => self.local_post_sync_modified,
            Side::Remote => self.remote_post_sync_modified,
        }
    }
}

/// Persistence for sync states.
///
/// At most one state exists per (entity type, profile, local id) and per
/// (entity type, profile, remote id).
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn find_by_local_id(
        &self,
        entity_type: &str,
        profile: ProfileId,
        id: &ObjectId,
    ) -> Result<Option<SyncState>>;

    async fn find_by_remote_id(
        &self,
        entity_type: &str,
        profile: ProfileId,
        id: &ObjectId,
    ) -> Result<Option<SyncState>>;

    /// Insert or update.
    ///
    /// A state without row id updates the row linking exactly its local and
    /// remote ids, if any.
    ///
    /// # Errors
    /// - `AlreadyExists` if its ids belong to two different rows, or one of
    ///   them is already linked to a different counterpart
    async fn save(&self, state: &SyncState) -> Result<SyncState>;

    /// All states of an entity type.
    async fn list(&self, entity_type: &str, profile: ProfileId) -> Result<Vec<SyncState>>;

    /// Look up by the id of either side.
    async fn find_by_id_on(
        &self,
        side: Side,
        entity_type: &str,
        profile: ProfileId,
        id: &ObjectId,
    ) -> Result<Option<SyncState>> {
        match side {
            Side::Local => self.find_by_local_id(entity_type, profile, id).await,
            Side::Remote => self.find_by_remote_id(entity_type, profile, id).await,
        }
    }
}

/// Row that `state` must update, if any.
///
/// Shared by the store implementations to keep the uniqueness rule in one
/// place.
pub(crate) fn resolve_row(
    state: &SyncState,
    by_local: Option<i64>,
    by_remote: Option<i64>,
) -> Result<Option<i64>> {
    if let Some(id) = state.id {
        let clash = [by_local, by_remote].into_iter().flatten().find(|row| *row != id);
        return match clash {
            Some(other) => Err(Error::AlreadyExists(format!(
                "sync state {} conflicts with row {}",
                id, other
            ))),
            None => Ok(Some(id)),
        };
    }
    match (by_local, by_remote) {
        (Some(a), Some(b)) if a != b => Err(Error::AlreadyExists(format!(
            "local and remote ids are linked by different sync states ({} and {})",
            a, b
        ))),
        (Some(a), Some(_)) => Ok(Some(a)),
        // A new link whose one id already belongs to another link.
        (Some(row), None) if state.remote_id.is_some() => Err(Error::AlreadyExists(format!(
            "local {} is already linked by sync state {}",
            display_id(state.local_id.as_ref()),
            row
        ))),
        (None, Some(row)) if state.local_id.is_some() => Err(Error::AlreadyExists(format!(
            "remote {} is already linked by sync state {}",
            display_id(state.remote_id.as_ref()),
            row
        ))),
        (Some(a), None) => Ok(Some(a)),
        (None, b) => Ok(b),
    }
}

fn display_id(id: Option<&ObjectId>) -> String {
    id.map(ToString::to_string).unwrap_or_default()
}

/// In-memory sync state store.
#[derive(Default)]
pub struct MemorySyncStateStore {
    rows: Mutex<Vec<SyncState>>,
}

impl MemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<MutexGuard<'_, Vec<SyncState>>> {
        self.rows
            .lock()
            .map_err(|_| Error::Storage("sync state store poisoned".to_string()))
    }

    fn find_row(
        rows: &[SyncState],
        side: Side,
        entity_type: &str,
        profile: ProfileId,
        id: &ObjectId,
    ) -> Option<SyncState> {
        rows.iter()
            .find(|s| s.entity_type == entity_type && s.profile_id == profile && s.id_on(side) == Some(id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SyncStateStore for MemorySyncStateStore {
    async fn find_by_local_id(
        &self,
        entity_type: &str,
        profile: ProfileId,
        id: &ObjectId,
    ) -> Result<Option<SyncState>> {
        Ok(Self::find_row(&self.rows()?, Side::Local, entity_type, profile, id))
    }

    async fn find_by_remote_id(
        &self,
        entity_type: &str,
        profile: ProfileId,
        id: &ObjectId,
    ) -> Result<Option<SyncState>> {
        Ok(Self::find_row(&self.rows()?, Side::Remote, entity_type, profile, id))
    }

    async fn save(&self, state: &SyncState) -> Result<SyncState> {
        let mut rows = self.rows()?;
        let row_of = |side: Side| {
            state.id_on(side).and_then(|id| {
                Self::find_row(&rows, side, &state.entity_type, state.profile_id, id)
                    .and_then(|found| found.id)
            })
        };
        let (by_local, by_remote) = (row_of(Side::Local), row_of(Side::Remote));

        let mut saved = state.clone();
        match resolve_row(state, by_local, by_remote)? {
            Some(id) => {
                saved.id = Some(id);
                match rows.iter_mut().find(|row| row.id == Some(id)) {
                    Some(row) => *row = saved.clone(),
                    None => return Err(Error::NotFound(format!("sync state {}", id))),
                }
            }
            None => {
                let next = rows.iter().filter_map(|row| row.id).max().unwrap_or(0) + 1;
                saved.id = Some(next);
                rows.push(saved.clone());
            }
        }
        Ok(saved)
    }

    async fn list(&self, entity_type: &str, profile: ProfileId) -> Result<Vec<SyncState>> {
        Ok(self
            .rows()?
            .iter()
            .filter(|s| s.entity_type == entity_type && s.profile_id == profile)
            .cloned()
            .collect())
    }
}
