//! Entity types: the pairing of a local and a remote field set.

use mirrorsync_common::{FieldKey, ObjectId, Side};
use mirrorsync_storage::Snapshot;

use crate::object::SyncableObject;

/// A domain object type kept in sync (contact, tag, donation...).
///
/// Implemented by a marker type naming the field enumerations of both
/// sides.
pub trait Entity: Send + Sync + 'static {
    /// Entity type name, scoping sync states and ledger entries.
    const TYPE: &'static str;

    /// Fields of the local representation.
    type Local: FieldKey;

    /// Fields of the remote representation.
    type Remote: FieldKey;
}

/// An object on either side of an entity type.
///
/// Used for the origin of a sync call and for matcher results.
#[derive(Debug, Clone)]
pub enum Origin<E: Entity> {
    Local(SyncableObject<E::Local>),
    Remote(SyncableObject<E::Remote>),
}

impl<E: Entity> Origin<E> {
    /// Local object referring to an existing row.
    pub fn local_id(id: impl Into<ObjectId>) -> Self {
        Origin::Local(SyncableObject::with_id(Side::Local, id.into()))
    }

    /// Remote object referring to an existing resource.
    pub fn remote_id(id: ObjectId) -> Self {
        Origin::Remote(SyncableObject::with_id(Side::Remote, id))
    }

    pub fn local_snapshot(snapshot: Snapshot<E::Local>) -> Self {
        Origin::Local(SyncableObject::from_snapshot(Side::Local, snapshot))
    }

    pub fn remote_snapshot(snapshot: Snapshot<E::Remote>) -> Self {
        Origin::Remote(SyncableObject::from_snapshot(Side::Remote, snapshot))
    }

    pub fn side(&self) -> Side {
        match self {
            Origin::Local(_) => Side::Local,
            Origin::Remote(_) => Side::Remote,
        }
    }

    pub fn id(&self) -> Option<&ObjectId> {
        match self {
            Origin::Local(object) => object.id(),
            Origin::Remote(object) => object.id(),
        }
    }
}

/// Matcher result on the side opposite the origin.
pub type Counterpart<E> = Origin<E>;
