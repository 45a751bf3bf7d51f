//! The unit of work of one sync call.

use chrono::{DateTime, Utc};

use mirrorsync_common::{ObjectId, Side};

use crate::entity::{Counterpart, Entity, Origin};
use crate::object::SyncableObject;
use crate::result::ResultStack;
use crate::state::SyncState;

/// Intermediate state gathered while processing a pair.
#[derive(Debug, Clone, Default)]
pub struct PairVars {
    /// Sync state found or persisted for this pair.
    pub sync_state: Option<SyncState>,
    /// Modification times as seen before anything was written.
    pub local_pre_sync_modified: Option<DateTime<Utc>>,
    pub remote_pre_sync_modified: Option<DateTime<Utc>>,
}

/// An origin designation, up to one object per side, and the result trail.
///
/// Only the sync state derived from a pair is persisted.
pub struct Pair<E: Entity> {
    origin: Side,
    pub local: Option<SyncableObject<E::Local>>,
    pub remote: Option<SyncableObject<E::Remote>>,
    pub vars: PairVars,
    pub results: ResultStack,
}

impl<E: Entity> Pair<E> {
    /// Wrap the origin object. The origin side is fixed from here on.
    pub fn new(origin: Origin<E>) -> Self {
        let side = origin.side();
        let (local, remote) = match origin {
            Origin::Local(object) => (Some(object), None),
            Origin::Remote(object) => (None, Some(object)),
        };
        Self {
            origin: side,
            local,
            remote,
            vars: PairVars::default(),
            results: ResultStack::new(),
        }
    }

    pub fn origin(&self) -> Side {
        self.origin
    }

    pub fn target(&self) -> Side {
        self.origin.opposite()
    }

    pub fn has(&self, side: Side) -> bool {
        match side {
            Side::Local => self.local.is_some(),
            Side::Remote => self.remote.is_some(),
        }
    }

    pub fn id_of(&self, side: Side) -> Option<&ObjectId> {
        match side {
            Side::Local => self.local.as_ref().and_then(SyncableObject::id),
            Side::Remote => self.remote.as_ref().and_then(SyncableObject::id),
        }
    }

    pub fn modified_of(&self, side: Side) -> Option<DateTime<Utc>> {
        match side {
            Side::Local => self.local.as_ref().and_then(SyncableObject::modified),
            Side::Remote => self.remote.as_ref().and_then(SyncableObject::modified),
        }
    }

    pub fn error_flag_of(&self, side: Side) -> bool {
        match side {
            Side::Local => self.local.as_ref().is_some_and(SyncableObject::error_flag),
            Side::Remote => self.remote.as_ref().is_some_and(SyncableObject::error_flag),
        }
    }

    pub fn is_altered_of(&self, side: Side) -> bool {
        match side {
            Side::Local => self.local.as_ref().is_some_and(SyncableObject::is_altered),
            Side::Remote => self.remote.as_ref().is_some_and(SyncableObject::is_altered),
        }
    }

    pub fn ensure_local(&mut self) -> &mut SyncableObject<E::Local> {
        self.local
            .get_or_insert_with(|| SyncableObject::new(Side::Local))
    }

    pub fn ensure_remote(&mut self) -> &mut SyncableObject<E::Remote> {
        self.remote
            .get_or_insert_with(|| SyncableObject::new(Side::Remote))
    }

    /// Create a blank target if there is none.
    pub fn ensure_target(&mut self) {
        match self.target() {
            Side::Local => {
                self.ensure_local();
            }
            Side::Remote => {
                self.ensure_remote();
            }
        }
    }

    /// Put a matched object in its slot.
    pub fn set_counterpart(&mut self, counterpart: Counterpart<E>) {
        match counterpart {
            Counterpart::Local(object) => self.local = Some(object),
            Counterpart::Remote(object) => self.remote = Some(object),
        }
    }

    /// Remember the current modification times as pre-sync times.
    pub fn capture_pre_sync_times(&mut self) {
        self.vars.local_pre_sync_modified = self.modified_of(Side::Local);
        self.vars.remote_pre_sync_modified = self.modified_of(Side::Remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Contact, LocalContact};
    use mirrorsync_storage::Snapshot;

    #[test]
    fn test_pair_from_local_origin() {
        let snapshot = Snapshot::new(ObjectId::Int(4)).with(LocalContact::Email, "bop@yum.com");
        let mut pair = Pair::<Contact>::new(Origin::local_snapshot(snapshot));

        assert_eq!(pair.origin(), Side::Local);
        assert_eq!(pair.target(), Side::Remote);
        assert_eq!(pair.id_of(Side::Local), Some(&ObjectId::Int(4)));
        assert!(!pair.has(Side::Remote));

        pair.ensure_target();
        assert!(pair.has(Side::Remote));
        assert!(pair.id_of(Side::Remote).is_none());
        assert!(pair.results.is_empty());
    }

    #[test]
    fn test_set_counterpart() {
        let mut pair = Pair::<Contact>::new(Origin::remote_id(ObjectId::text("p1").unwrap()));
        pair.set_counterpart(Origin::local_id(9i64));
        assert_eq!(pair.id_of(Side::Local), Some(&ObjectId::Int(9)));
        assert_eq!(pair.id_of(Side::Remote), Some(&ObjectId::text("p1").unwrap()));
    }
}
