//! Sample entities and in-memory wiring shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mirrorsync_common::{Access, FieldKey, FieldValue};
use mirrorsync_storage::MemoryStore;

use crate::deletion::MemoryDeletionLedger;
use crate::entity::Entity;
use crate::mapper::{Direction, TableMapper};
use crate::matcher::UniqueFieldMatcher;
use crate::retry::RetryConfig;
use crate::state::MemorySyncStateStore;
use crate::syncer::Syncer;

/// A person known to both systems.
#[derive(Debug, Clone)]
pub struct Contact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocalContact {
    FirstName,
    LastName,
    Email,
    Phone,
    Source,
    DonationTotal,
}

impl FieldKey for LocalContact {
    fn all() -> &'static [Self] {
        &[
            LocalContact::FirstName,
            LocalContact::LastName,
            LocalContact::Email,
            LocalContact::Phone,
            LocalContact::Source,
            LocalContact::DonationTotal,
        ]
    }

    fn name(&self) -> &'static str {
        match self {
            LocalContact::FirstName => "first_name",
            LocalContact::LastName => "last_name",
            LocalContact::Email => "email",
            LocalContact::Phone => "phone",
            LocalContact::Source => "source",
            LocalContact::DonationTotal => "donation_total",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemotePerson {
    GivenName,
    FamilyName,
    Email,
    Phone,
    CreatedVia,
    Total,
    Status,
}

impl FieldKey for RemotePerson {
    fn all() -> &'static [Self] {
        &[
            RemotePerson::GivenName,
            RemotePerson::FamilyName,
            RemotePerson::Email,
            RemotePerson::Phone,
            RemotePerson::CreatedVia,
            RemotePerson::Total,
            RemotePerson::Status,
        ]
    }

    fn name(&self) -> &'static str {
        match self {
            RemotePerson::GivenName => "given_name",
            RemotePerson::FamilyName => "family_name",
            RemotePerson::Email => "email_address",
            RemotePerson::Phone => "phone_number",
            RemotePerson::CreatedVia => "created_via",
            RemotePerson::Total => "total_donations",
            RemotePerson::Status => "status",
        }
    }

    fn access(&self) -> Access {
        match self {
            RemotePerson::CreatedVia => Access::CreateOnly,
            RemotePerson::Total => Access::ReadOnly,
            _ => Access::Free,
        }
    }

    fn clear_sentinel(&self) -> Option<FieldValue> {
        matches!(self, RemotePerson::Phone).then(|| FieldValue::text("-"))
    }

    fn server_generated(&self) -> bool {
        matches!(self, RemotePerson::Total)
    }
}

impl Entity for Contact {
    const TYPE: &'static str = "contact";
    type Local = LocalContact;
    type Remote = RemotePerson;
}

pub fn contact_mapper() -> TableMapper<Contact> {
    TableMapper::new()
        .column(LocalContact::FirstName, RemotePerson::GivenName)
        .column(LocalContact::LastName, RemotePerson::FamilyName)
        .required(LocalContact::Email, RemotePerson::Email)
        .column(LocalContact::Phone, RemotePerson::Phone)
        .one_way(LocalContact::Source, RemotePerson::CreatedVia, Direction::ToRemote)
        .one_way(LocalContact::DonationTotal, RemotePerson::Total, Direction::ToLocal)
}

/// A label that cannot point back at the local database.
#[derive(Debug, Clone)]
pub struct Tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocalTag {
    Name,
}

impl FieldKey for LocalTag {
    fn all() -> &'static [Self] {
        &[LocalTag::Name]
    }

    fn name(&self) -> &'static str {
        "name"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemoteTag {
    Name,
}

impl FieldKey for RemoteTag {
    fn all() -> &'static [Self] {
        &[RemoteTag::Name]
    }

    fn name(&self) -> &'static str {
        "name"
    }
}

impl Entity for Tag {
    const TYPE: &'static str = "tag";
    type Local = LocalTag;
    type Remote = RemoteTag;
}

/// Retries without noticeable delay.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new(3)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false)
}

/// Stores and bookkeeping behind a test syncer.
pub struct Fixture<E: Entity> {
    pub local: Arc<MemoryStore<E::Local>>,
    pub remote: Arc<MemoryStore<E::Remote>>,
    pub states: Arc<MemorySyncStateStore>,
    pub ledger: Arc<MemoryDeletionLedger>,
    pub syncer: Syncer<E>,
}

/// Contact syncer matching on email.
pub fn contact_fixture(remote: MemoryStore<RemotePerson>) -> Fixture<Contact> {
    let local = Arc::new(MemoryStore::local("contacts"));
    let remote = Arc::new(remote);
    let matcher = UniqueFieldMatcher::<Contact>::new(local.clone(), remote.clone())
        .key(LocalContact::Email, RemotePerson::Email);
    fixture(local, remote, Arc::new(matcher), Arc::new(contact_mapper()))
}

/// Tag syncer matching on name.
pub fn tag_fixture(remote: MemoryStore<RemoteTag>, mapper: TableMapper<Tag>) -> Fixture<Tag> {
    let local = Arc::new(MemoryStore::local("tags"));
    let remote = Arc::new(remote);
    let matcher = UniqueFieldMatcher::<Tag>::new(local.clone(), remote.clone())
        .key(LocalTag::Name, RemoteTag::Name);
    fixture(local, remote, Arc::new(matcher), Arc::new(mapper))
}

fn fixture<E: Entity>(
    local: Arc<MemoryStore<E::Local>>,
    remote: Arc<MemoryStore<E::Remote>>,
    matcher: Arc<dyn crate::matcher::Matcher<E>>,
    mapper: Arc<dyn crate::mapper::Mapper<E>>,
) -> Fixture<E> {
    let states = Arc::new(MemorySyncStateStore::new());
    let ledger = Arc::new(MemoryDeletionLedger::new());
    let syncer = Syncer::new(
        local.clone(),
        remote.clone(),
        matcher,
        mapper,
        states.clone(),
        ledger.clone(),
    )
    .with_retry(fast_retry());
    Fixture {
        local,
        remote,
        states,
        ledger,
        syncer,
    }
}

/// Values map from `(key, text)` pairs.
pub fn values<F: FieldKey>(pairs: &[(F, &str)]) -> BTreeMap<F, FieldValue> {
    pairs
        .iter()
        .map(|(key, value)| (*key, FieldValue::text(*value)))
        .collect()
}
