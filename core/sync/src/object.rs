//! A bundle of tracked fields representing one object on one side.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use mirrorsync_common::{FieldKey, FieldValue, ObjectId, Side};
use mirrorsync_storage::Snapshot;

use crate::field::{FieldError, TrackedField};
use crate::result::FieldDiff;

/// One domain object on one side, with dirty tracking.
///
/// Fields are keyed by the side's [`FieldKey`] enumeration; every key has a
/// cell from construction on. Store I/O is done by the syncer, which feeds
/// results back through [`SyncableObject::apply_snapshot`]: loading and the
/// reload before mapping live in `Syncer::reload`, saving with the re-load
/// and partial-write check in `write_and_verify` (both in `syncer.rs`).
#[derive(Debug, Clone)]
pub struct SyncableObject<F: FieldKey> {
    side: Side,
    id: Option<ObjectId>,
    fields: BTreeMap<F, TrackedField>,
    modified: Option<DateTime<Utc>>,
    error_flag: bool,
    url: Option<String>,
    loaded: bool,
}

impl<F: FieldKey> SyncableObject<F> {
    /// Blank object with no identifier.
    pub fn new(side: Side) -> Self {
        Self {
            side,
            id: None,
            fields: F::all()
                .iter()
                .map(|key| (*key, TrackedField::for_key(*key)))
                .collect(),
            modified: None,
            error_flag: false,
            url: None,
            loaded: false,
        }
    }

    /// Object referring to an existing record, not loaded yet.
    pub fn with_id(side: Side, id: ObjectId) -> Self {
        let mut object = Self::new(side);
        object.id = Some(id);
        object
    }

    /// Loaded object built from a store snapshot.
    pub fn from_snapshot(side: Side, snapshot: Snapshot<F>) -> Self {
        let mut object = Self::new(side);
        object.apply_snapshot(snapshot);
        object
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn id(&self) -> Option<&ObjectId> {
        self.id.as_ref()
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    /// Record the identifier handed out by a create.
    pub fn set_id(&mut self, id: ObjectId) {
        self.id = Some(id);
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    pub fn error_flag(&self) -> bool {
        self.error_flag
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Take the store's current values and reset touch state.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot<F>) {
        for (key, field) in self.fields.iter_mut() {
            field.load(snapshot.values.get(key).cloned().unwrap_or_default());
        }
        self.id = Some(snapshot.id);
        self.modified = snapshot.modified;
        self.error_flag = snapshot.error_flag;
        self.url = snapshot.url;
        self.loaded = true;
    }

    pub fn get(&self, key: F) -> &FieldValue {
        self.fields
            .get(&key)
            .map(TrackedField::get)
            .unwrap_or(FieldValue::null_ref())
    }

    /// Set a field, enforcing its access policy.
    pub fn set(&mut self, key: F, value: impl Into<FieldValue>) -> Result<(), FieldError> {
        let has_id = self.id.is_some();
        self.fields
            .entry(key)
            .or_insert_with(|| TrackedField::for_key(key))
            .set(value.into(), has_id)
    }

    pub fn field(&self, key: F) -> Option<&TrackedField> {
        self.fields.get(&key)
    }

    /// Whether any field was touched.
    pub fn is_touched(&self) -> bool {
        self.fields.values().any(TrackedField::is_touched)
    }

    /// Whether any field differs from its loaded value.
    pub fn is_altered(&self) -> bool {
        self.fields.values().any(TrackedField::is_altered)
    }

    pub fn altered_fields(&self) -> Vec<F> {
        self.fields
            .iter()
            .filter(|(_, field)| field.is_altered())
            .map(|(key, _)| *key)
            .collect()
    }

    /// Values to send to the store.
    ///
    /// A create sends every touched field, an update only altered ones.
    pub fn values_for_write(&self) -> BTreeMap<F, FieldValue> {
        let creating = self.id.is_none();
        self.fields
            .iter()
            .filter(|(_, field)| {
                if creating {
                    field.is_touched()
                } else {
                    field.is_altered()
                }
            })
            .map(|(key, field)| (*key, field.for_write()))
            .collect()
    }

    /// Current values of `keys`, as the caller sees them.
    pub fn values_of(&self, keys: impl IntoIterator<Item = F>) -> BTreeMap<F, FieldValue> {
        keys.into_iter()
            .map(|key| (key, self.get(key).clone()))
            .collect()
    }

    /// All current values by field name.
    pub fn named_values(&self) -> BTreeMap<&'static str, FieldValue> {
        self.fields
            .values()
            .map(|field| (field.name(), field.get().clone()))
            .collect()
    }

    /// Diff of altered fields.
    pub fn diff(&self) -> Vec<FieldDiff> {
        self.fields
            .values()
            .filter(|field| field.is_altered())
            .map(|field| FieldDiff {
                field: field.name(),
                before: field.original().clone(),
                after: field.get().clone(),
            })
            .collect()
    }

    /// Fields whose persisted value does not cover what was intended.
    ///
    /// Call after re-loading a written object. Server-generated fields are
    /// ignored.
    pub fn missing_after_write(&self, intended: &BTreeMap<F, FieldValue>) -> Vec<F> {
        intended
            .iter()
            .filter(|(key, _)| !key.server_generated())
            .filter(|(key, want)| !self.get(**key).covers(want))
            .map(|(key, _)| *key)
            .collect()
    }
}
