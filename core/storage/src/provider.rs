//! Store capability traits consumed by the sync engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use mirrorsync_common::{FieldKey, FieldValue, ObjectId, Result, Side};

/// Current state of one object as read from its store.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<F: FieldKey> {
    /// Identifier in the store.
    pub id: ObjectId,
    /// Field values. Fields the store did not return are absent.
    pub values: BTreeMap<F, FieldValue>,
    /// Last modification time reported by the store.
    pub modified: Option<DateTime<Utc>>,
    /// A previous sync attempt flagged this object as problematic.
    pub error_flag: bool,
    /// Canonical resource URL (remote objects only).
    pub url: Option<String>,
}

impl<F: FieldKey> Snapshot<F> {
    /// Create a snapshot with no values.
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            values: BTreeMap::new(),
            modified: None,
            error_flag: false,
            url: None,
        }
    }

    /// Builder-style value setter.
    pub fn with(mut self, key: F, value: impl Into<FieldValue>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    /// Value of a field, `Null` when absent.
    pub fn get(&self, key: F) -> &FieldValue {
        self.values.get(&key).unwrap_or(FieldValue::null_ref())
    }
}

/// Result of a write the store completed without a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// The write was accepted; `id` identifies the persisted object.
    Saved { id: ObjectId },
    /// The store refused the write for a business reason
    /// (validation, uniqueness, immutable object type).
    Rejected { reason: String },
}

impl WriteOutcome {
    /// Whether the store accepted the write.
    pub fn is_saved(&self) -> bool {
        matches!(self, WriteOutcome::Saved { .. })
    }
}

/// Equality filter used for duplicate detection searches.
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria<F: FieldKey> {
    conditions: Vec<(F, FieldValue)>,
}

impl<F: FieldKey> Criteria<F> {
    /// Criteria that match everything.
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Add an equality condition.
    pub fn eq(mut self, key: F, value: impl Into<FieldValue>) -> Self {
        self.conditions.push((key, value.into()));
        self
    }

    /// All conditions.
    pub fn conditions(&self) -> &[(F, FieldValue)] {
        &self.conditions
    }

    /// Whether a snapshot satisfies every condition.
    pub fn matches(&self, snapshot: &Snapshot<F>) -> bool {
        self.conditions
            .iter()
            .all(|(key, value)| snapshot.get(*key).equivalent(value))
    }
}

impl<F: FieldKey> Default for Criteria<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// One page of a remote listing.
#[derive(Debug, Clone)]
pub struct Page<F: FieldKey> {
    pub items: Vec<Snapshot<F>>,
    /// Opaque cursor (usually the next-page URL). `None` on the last page.
    pub next: Option<String>,
}

/// Operations every store supports.
///
/// Implementations report business failures through [`WriteOutcome`] and
/// `Ok(None)`; `Err` is reserved for faults (I/O, transport, corruption).
#[async_trait]
pub trait ObjectStore<F: FieldKey>: Send + Sync {
    /// Which side of the sync this store is.
    fn side(&self) -> Side;

    /// Store name for logs (e.g. "sqlite:contact", "hal:people").
    fn name(&self) -> &str;

    /// Load the current values of an object.
    ///
    /// # Returns
    /// `None` if no object has this id.
    async fn load(&self, id: &ObjectId) -> Result<Option<Snapshot<F>>>;

    /// Persist values.
    ///
    /// # Preconditions
    /// - `id` is `None` for a create, `Some` for an update
    /// - `values` holds only the fields to write
    ///
    /// # Postconditions
    /// - On `Saved`, a subsequent `load` reflects what the store kept
    async fn save(
        &self,
        id: Option<&ObjectId>,
        values: &BTreeMap<F, FieldValue>,
    ) -> Result<WriteOutcome>;

    /// Delete an object. Stores that cannot delete may blank the object
    /// instead.
    ///
    /// # Returns
    /// `false` if there was nothing to delete.
    async fn delete(&self, id: &ObjectId) -> Result<bool>;
}

/// The local relational store.
#[async_trait]
pub trait LocalStore<F: FieldKey>: ObjectStore<F> {
    /// Find rows matching all conditions.
    async fn find(&self, criteria: &Criteria<F>) -> Result<Vec<Snapshot<F>>>;
}

/// The remote hypermedia API.
#[async_trait]
pub trait RemoteStore<F: FieldKey>: ObjectStore<F> {
    /// Fetch a resource by its URL.
    async fn fetch_url(&self, url: &str) -> Result<Option<Snapshot<F>>>;

    /// Fetch one page of resources matching `criteria`.
    ///
    /// `cursor` is `None` for the first page and otherwise a value returned
    /// in [`Page::next`].
    async fn find_page(&self, criteria: &Criteria<F>, cursor: Option<&str>) -> Result<Page<F>>;
}

/// Business filter applied on top of a remote query.
pub type SnapshotFilter<F> = Box<dyn Fn(&Snapshot<F>) -> bool + Send + Sync>;

/// Lazy, forward-only iterator over a remote query.
///
/// Pages are fetched on demand. To restart, create a new iterator.
/// Tracks how many results the store returned (`raw_count`) separately from
/// how many survived the business filter (`filtered_count`).
pub struct FindIter<'a, F: FieldKey, S: RemoteStore<F> + ?Sized> {
    store: &'a S,
    criteria: Criteria<F>,
    filter: Option<SnapshotFilter<F>>,
    buffer: VecDeque<Snapshot<F>>,
    cursor: Option<String>,
    started: bool,
    raw_count: usize,
    filtered_count: usize,
}

impl<'a, F: FieldKey, S: RemoteStore<F> + ?Sized> FindIter<'a, F, S> {
    /// Create an iterator. Nothing is fetched until [`FindIter::next`].
    pub fn new(store: &'a S, criteria: Criteria<F>) -> Self {
        Self {
            store,
            criteria,
            filter: None,
            buffer: VecDeque::new(),
            cursor: None,
            started: false,
            raw_count: 0,
            filtered_count: 0,
        }
    }

    /// Only yield snapshots for which `filter` returns true.
    pub fn with_filter(mut self, filter: SnapshotFilter<F>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Next matching snapshot, fetching pages as needed.
    pub async fn next(&mut self) -> Result<Option<Snapshot<F>>> {
        loop {
            while let Some(snapshot) = self.buffer.pop_front() {
                self.raw_count += 1;
                let keep = self.filter.as_ref().map_or(true, |f| f(&snapshot));
                if keep {
                    self.filtered_count += 1;
                    return Ok(Some(snapshot));
                }
            }

            if self.started && self.cursor.is_none() {
                return Ok(None);
            }

            let page = self
                .store
                .find_page(&self.criteria, self.cursor.as_deref())
                .await?;
            self.started = true;
            self.cursor = page.next;
            self.buffer.extend(page.items);
        }
    }

    /// Drain up to `limit` matching snapshots.
    pub async fn collect_up_to(&mut self, limit: usize) -> Result<Vec<Snapshot<F>>> {
        let mut out = Vec::new();
        while out.len() < limit {
            match self.next().await? {
                Some(snapshot) => out.push(snapshot),
                None => break,
            }
        }
        Ok(out)
    }

    /// Results returned by the store so far.
    pub fn raw_count(&self) -> usize {
        self.raw_count
    }

    /// Results that passed the business filter so far.
    pub fn filtered_count(&self) -> usize {
        self.filtered_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Field {
        Email,
        Status,
    }

    impl FieldKey for Field {
        fn all() -> &'static [Self] {
            &[Field::Email, Field::Status]
        }

        fn name(&self) -> &'static str {
            match self {
                Field::Email => "email",
                Field::Status => "status",
            }
        }
    }

    #[test]
    fn test_snapshot_get_defaults_to_null() {
        let snap = Snapshot::<Field>::new(ObjectId::Int(1)).with(Field::Email, "a@b.c");
        assert_eq!(snap.get(Field::Email), &FieldValue::text("a@b.c"));
        assert_eq!(snap.get(Field::Status), &FieldValue::Null);
    }

    #[test]
    fn test_criteria_matching() {
        let snap = Snapshot::<Field>::new(ObjectId::Int(1))
            .with(Field::Email, "a@b.c")
            .with(Field::Status, "subscribed");
        assert!(Criteria::new().matches(&snap));
        assert!(Criteria::new().eq(Field::Email, "a@b.c").matches(&snap));
        assert!(!Criteria::new()
            .eq(Field::Email, "a@b.c")
            .eq(Field::Status, "unsubscribed")
            .matches(&snap));
    }

    #[test]
    fn test_write_outcome() {
        assert!(WriteOutcome::Saved { id: ObjectId::Int(3) }.is_saved());
        assert!(!WriteOutcome::Rejected {
            reason: "duplicate".to_string()
        }
        .is_saved());
    }
}
