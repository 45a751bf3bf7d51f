//! In-memory store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use mirrorsync_common::{Error, FieldKey, FieldValue, ObjectId, Result, Side};

use crate::provider::{Criteria, LocalStore, ObjectStore, Page, RemoteStore, Snapshot, WriteOutcome};

const DEFAULT_PAGE_SIZE: usize = 25;
const URL_SCHEME: &str = "memory://";

/// In-memory row.
#[derive(Debug, Clone)]
struct Row<F: FieldKey> {
    values: BTreeMap<F, FieldValue>,
    modified: DateTime<Utc>,
    error_flag: bool,
}

/// In-memory store usable as either side.
///
/// Useful for testing and development. Local stores hand out integer ids,
/// remote stores hand out UUID strings. The clock is strictly increasing so
/// that every write produces a newer modification time, however fast the
/// test runs.
///
/// Misbehaviour of real backends can be simulated: unique fields, fields the
/// store silently drops, pseudo-delete, and injected transport failures.
pub struct MemoryStore<F: FieldKey> {
    side: Side,
    name: String,
    rows: RwLock<BTreeMap<ObjectId, Row<F>>>,
    clock: Mutex<DateTime<Utc>>,
    next_id: AtomicI64,
    unique: Vec<F>,
    dropped: Vec<F>,
    pseudo_delete: Option<Vec<F>>,
    page_size: usize,
    fail_saves: AtomicBool,
    failing_loads: AtomicU32,
    creates: AtomicUsize,
    updates: AtomicUsize,
    page_fetches: AtomicUsize,
}

impl<F: FieldKey> MemoryStore<F> {
    fn with_side(side: Side, name: impl Into<String>) -> Self {
        Self {
            side,
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            clock: Mutex::new(Utc::now()),
            next_id: AtomicI64::new(1),
            unique: Vec::new(),
            dropped: Vec::new(),
            pseudo_delete: None,
            page_size: DEFAULT_PAGE_SIZE,
            fail_saves: AtomicBool::new(false),
            failing_loads: AtomicU32::new(0),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            page_fetches: AtomicUsize::new(0),
        }
    }

    /// Create an empty local store.
    pub fn local(name: impl Into<String>) -> Self {
        Self::with_side(Side::Local, name)
    }

    /// Create an empty remote store.
    pub fn remote(name: impl Into<String>) -> Self {
        Self::with_side(Side::Remote, name)
    }

    /// Reject writes that would duplicate a non-empty value of `key`.
    pub fn with_unique(mut self, key: F) -> Self {
        self.unique.push(key);
        self
    }

    /// Accept writes to `key` but never persist them.
    pub fn with_dropped(mut self, key: F) -> Self {
        self.dropped.push(key);
        self
    }

    /// Blank `fields` on delete instead of removing the object.
    pub fn with_pseudo_delete(mut self, fields: Vec<F>) -> Self {
        self.pseudo_delete = Some(fields);
        self
    }

    /// Page size for `find_page`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Make every save fail with a network error.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` loads fail with a network error.
    pub fn fail_next_loads(&self, count: u32) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Insert an object directly, bypassing constraints.
    pub fn insert(&self, values: BTreeMap<F, FieldValue>) -> Result<ObjectId> {
        let id = self.allocate_id();
        let modified = self.tick()?;
        self.write_rows()?.insert(
            id.clone(),
            Row {
                values,
                modified,
                error_flag: false,
            },
        );
        Ok(id)
    }

    /// Change one field directly, as an edit made outside the sync engine.
    pub fn edit(&self, id: &ObjectId, key: F, value: impl Into<FieldValue>) -> Result<()> {
        let modified = self.tick()?;
        let mut rows = self.write_rows()?;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("{} {}", self.name, id)))?;
        row.values.insert(key, value.into());
        row.modified = modified;
        Ok(())
    }

    /// Set or clear the error flag of an object.
    pub fn set_error_flag(&self, id: &ObjectId, flag: bool) -> Result<()> {
        let mut rows = self.write_rows()?;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("{} {}", self.name, id)))?;
        row.error_flag = flag;
        Ok(())
    }

    /// Current snapshot of an object.
    pub fn get(&self, id: &ObjectId) -> Result<Option<Snapshot<F>>> {
        Ok(self.read_rows()?.get(id).map(|row| self.snapshot(id, row)))
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accepted creates so far.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Accepted updates so far.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Pages served by `find_page` so far.
    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> ObjectId {
        match self.side {
            Side::Local => ObjectId::Int(self.next_id.fetch_add(1, Ordering::SeqCst)),
            Side::Remote => ObjectId::Text(Uuid::new_v4().to_string()),
        }
    }

    fn tick(&self) -> Result<DateTime<Utc>> {
        let mut last = self
            .clock
            .lock()
            .map_err(|_| Error::Storage("memory clock poisoned".to_string()))?;
        let now = Utc::now();
        let next = if now > *last {
            now
        } else {
            *last + Duration::milliseconds(1)
        };
        *last = next;
        Ok(next)
    }

    fn read_rows(&self) -> Result<RwLockReadGuard<'_, BTreeMap<ObjectId, Row<F>>>> {
        self.rows
            .read()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))
    }

    fn write_rows(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<ObjectId, Row<F>>>> {
        self.rows
            .write()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))
    }

    fn url_for(&self, id: &ObjectId) -> Option<String> {
        match self.side {
            Side::Remote => Some(format!("{}{}", URL_SCHEME, id)),
            Side::Local => None,
        }
    }

    fn snapshot(&self, id: &ObjectId, row: &Row<F>) -> Snapshot<F> {
        Snapshot {
            id: id.clone(),
            values: row.values.clone(),
            modified: Some(row.modified),
            error_flag: row.error_flag,
            url: self.url_for(id),
        }
    }

    fn check_unique(
        &self,
        rows: &BTreeMap<ObjectId, Row<F>>,
        id: Option<&ObjectId>,
        values: &BTreeMap<F, FieldValue>,
    ) -> Option<String> {
        for key in &self.unique {
            let Some(value) = values.get(key) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            let clash = rows.iter().find(|(other_id, row)| {
                Some(*other_id) != id
                    && row
                        .values
                        .get(key)
                        .is_some_and(|existing| existing.equivalent(value))
            });
            if let Some((other_id, _)) = clash {
                return Some(format!(
                    "{} {} is already used by {}",
                    key.name(),
                    value,
                    other_id
                ));
            }
        }
        None
    }

    fn check_load_failure(&self) -> Result<()> {
        let remaining = self.failing_loads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_loads.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Network(format!("{}: connection reset", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl<F: FieldKey> ObjectStore<F> for MemoryStore<F> {
    fn side(&self) -> Side {
        self.side
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, id: &ObjectId) -> Result<Option<Snapshot<F>>> {
        self.check_load_failure()?;
        self.get(id)
    }

    async fn save(
        &self,
        id: Option<&ObjectId>,
        values: &BTreeMap<F, FieldValue>,
    ) -> Result<WriteOutcome> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{}: write timed out", self.name)));
        }

        let modified = self.tick()?;
        let mut rows = self.write_rows()?;

        if let Some(reason) = self.check_unique(&rows, id, values) {
            return Ok(WriteOutcome::Rejected { reason });
        }

        let (id, mut row) = match id {
            Some(id) => match rows.get(id) {
                Some(row) => (id.clone(), row.clone()),
                None => {
                    return Ok(WriteOutcome::Rejected {
                        reason: format!("{} {} does not exist", self.name, id),
                    })
                }
            },
            None => (
                self.allocate_id(),
                Row {
                    values: BTreeMap::new(),
                    modified,
                    error_flag: false,
                },
            ),
        };
        let is_create = !rows.contains_key(&id);

        for (key, value) in values {
            if self.dropped.contains(key) {
                continue;
            }
            match key.clear_sentinel() {
                Some(sentinel) if value == &sentinel => {
                    row.values.insert(*key, FieldValue::Null);
                }
                // APIs that need a sentinel ignore plain empty values.
                Some(_) if value.is_empty() => {}
                _ => {
                    row.values.insert(*key, value.clone());
                }
            }
        }
        row.modified = modified;
        rows.insert(id.clone(), row);

        if is_create {
            self.creates.fetch_add(1, Ordering::SeqCst);
        } else {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        Ok(WriteOutcome::Saved { id })
    }

    async fn delete(&self, id: &ObjectId) -> Result<bool> {
        let modified = self.tick()?;
        let mut rows = self.write_rows()?;
        match &self.pseudo_delete {
            Some(fields) => match rows.get_mut(id) {
                Some(row) => {
                    for key in fields {
                        row.values.insert(*key, FieldValue::Null);
                    }
                    row.modified = modified;
                    Ok(true)
                }
                None => Ok(false),
            },
            None => Ok(rows.remove(id).is_some()),
        }
    }
}

#[async_trait]
impl<F: FieldKey> LocalStore<F> for MemoryStore<F> {
    async fn find(&self, criteria: &Criteria<F>) -> Result<Vec<Snapshot<F>>> {
        let rows = self.read_rows()?;
        Ok(rows
            .iter()
            .map(|(id, row)| self.snapshot(id, row))
            .filter(|snapshot| criteria.matches(snapshot))
            .collect())
    }
}

#[async_trait]
impl<F: FieldKey> RemoteStore<F> for MemoryStore<F> {
    async fn fetch_url(&self, url: &str) -> Result<Option<Snapshot<F>>> {
        let raw = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| Error::InvalidInput(format!("Not a memory URL: {}", url)))?;
        let id = match self.side {
            Side::Local => ObjectId::decode(raw)?,
            Side::Remote => ObjectId::text(raw)?,
        };
        self.load(&id).await
    }

    async fn find_page(&self, criteria: &Criteria<F>, cursor: Option<&str>) -> Result<Page<F>> {
        let page: usize = match cursor {
            None => 0,
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Bad page cursor: {}", raw)))?,
        };
        self.page_fetches.fetch_add(1, Ordering::SeqCst);

        let matching = self.find(criteria).await?;
        let start = page * self.page_size;
        let items: Vec<Snapshot<F>> = matching
            .iter()
            .skip(start)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = (start + self.page_size < matching.len()).then(|| (page + 1).to_string());

        Ok(Page { items, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FindIter;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum Person {
        Email,
        Phone,
        Note,
    }

    impl FieldKey for Person {
        fn all() -> &'static [Self] {
            &[Person::Email, Person::Phone, Person::Note]
        }

        fn name(&self) -> &'static str {
            match self {
                Person::Email => "email",
                Person::Phone => "phone",
                Person::Note => "note",
            }
        }

        fn clear_sentinel(&self) -> Option<FieldValue> {
            matches!(self, Person::Phone).then(|| FieldValue::text("-"))
        }
    }

    fn values(pairs: &[(Person, &str)]) -> BTreeMap<Person, FieldValue> {
        pairs
            .iter()
            .map(|(k, v)| (*k, FieldValue::text(*v)))
            .collect()
    }

    #[tokio::test]
    async fn test_local_ids_are_integers_and_remote_ids_uuids() {
        let local = MemoryStore::<Person>::local("people");
        let remote = MemoryStore::<Person>::remote("people");

        let WriteOutcome::Saved { id } = local.save(None, &values(&[(Person::Email, "a@x")])).await.unwrap() else {
            panic!("expected save");
        };
        assert_eq!(id, ObjectId::Int(1));

        let WriteOutcome::Saved { id } = remote.save(None, &values(&[(Person::Email, "a@x")])).await.unwrap() else {
            panic!("expected save");
        };
        assert!(matches!(id, ObjectId::Text(_)));
        let snap = remote.load(&id).await.unwrap().unwrap();
        assert_eq!(snap.url, Some(format!("memory://{}", id)));
        assert_eq!(remote.fetch_url(snap.url.as_deref().unwrap()).await.unwrap(), Some(snap));
    }

    #[tokio::test]
    async fn test_writes_advance_modified_strictly() {
        let store = MemoryStore::<Person>::local("people");
        let id = store.insert(values(&[(Person::Email, "a@x")])).unwrap();
        let first = store.get(&id).unwrap().unwrap().modified.unwrap();
        store.save(Some(&id), &values(&[(Person::Note, "hi")])).await.unwrap();
        let second = store.get(&id).unwrap().unwrap().modified.unwrap();
        assert!(second > first);
        assert_eq!(store.updates(), 1);
    }

    #[tokio::test]
    async fn test_unique_constraint_rejects() {
        let store = MemoryStore::<Person>::remote("people").with_unique(Person::Email);
        store.insert(values(&[(Person::Email, "taken@x")])).unwrap();
        let outcome = store
            .save(None, &values(&[(Person::Email, "taken@x")]))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Rejected { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_fields_and_sentinel() {
        let store = MemoryStore::<Person>::remote("people").with_dropped(Person::Note);
        let id = store
            .insert(values(&[(Person::Email, "a@x"), (Person::Phone, "555")]))
            .unwrap();

        // Empty values are ignored for sentinel fields.
        store.save(Some(&id), &values(&[(Person::Phone, ""), (Person::Note, "x")])).await.unwrap();
        let snap = store.get(&id).unwrap().unwrap();
        assert_eq!(snap.get(Person::Phone), &FieldValue::text("555"));
        assert_eq!(snap.get(Person::Note), &FieldValue::Null);

        store.save(Some(&id), &values(&[(Person::Phone, "-")])).await.unwrap();
        let snap = store.get(&id).unwrap().unwrap();
        assert_eq!(snap.get(Person::Phone), &FieldValue::Null);
    }

    #[tokio::test]
    async fn test_pseudo_delete_blanks_fields() {
        let store = MemoryStore::<Person>::remote("people").with_pseudo_delete(vec![Person::Email]);
        let id = store.insert(values(&[(Person::Email, "a@x"), (Person::Note, "keep")])).unwrap();
        assert!(store.delete(&id).await.unwrap());
        let snap = store.get(&id).unwrap().unwrap();
        assert_eq!(snap.get(Person::Email), &FieldValue::Null);
        assert_eq!(snap.get(Person::Note), &FieldValue::text("keep"));
        assert!(!store.delete(&ObjectId::text("missing").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_iter_pages_and_counts() {
        let store = MemoryStore::<Person>::remote("people").with_page_size(2);
        for i in 0..5 {
            let note = if i % 2 == 0 { "subscribed" } else { "unsubscribed" };
            store
                .insert(values(&[(Person::Email, "same@x"), (Person::Note, note)]))
                .unwrap();
        }
        store.insert(values(&[(Person::Email, "other@x")])).unwrap();

        let mut iter = FindIter::new(&store, Criteria::new().eq(Person::Email, "same@x"))
            .with_filter(Box::new(|s| s.get(Person::Note) == &FieldValue::text("subscribed")));
        let found = iter.collect_up_to(10).await.unwrap();

        assert_eq!(found.len(), 3);
        assert_eq!(iter.raw_count(), 5);
        assert_eq!(iter.filtered_count(), 3);
        assert_eq!(store.page_fetches(), 3);
        assert!(iter.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::<Person>::remote("people");
        let id = store.insert(values(&[(Person::Email, "a@x")])).unwrap();

        store.fail_next_loads(1);
        assert!(store.load(&id).await.unwrap_err().is_retryable());
        assert!(store.load(&id).await.unwrap().is_some());

        store.set_fail_saves(true);
        assert!(store.save(Some(&id), &values(&[(Person::Note, "n")])).await.is_err());
    }
}
