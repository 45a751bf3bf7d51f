//! Counterpart discovery when no persisted link exists.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use mirrorsync_common::{FieldKey, FieldValue, ObjectId, Side};
use mirrorsync_storage::{Criteria, FindIter, LocalStore, RemoteStore, Snapshot};

use crate::entity::{Counterpart, Entity};
use crate::pair::Pair;
use crate::result::MatchStatus;

/// Outcome of a match attempt.
pub struct MatchResult<E: Entity> {
    pub status: MatchStatus,
    /// The counterpart, on `FoundMatch`.
    pub counterpart: Option<Counterpart<E>>,
    pub message: Option<String>,
}

impl<E: Entity> MatchResult<E> {
    pub fn found(counterpart: Counterpart<E>) -> Self {
        Self {
            status: MatchStatus::FoundMatch,
            counterpart: Some(counterpart),
            message: None,
        }
    }

    pub fn no_match(message: impl Into<String>) -> Self {
        Self {
            status: MatchStatus::NoMatch,
            counterpart: None,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: MatchStatus::Error,
            counterpart: None,
            message: Some(message.into()),
        }
    }
}

/// Finds the counterpart of a pair's origin object.
///
/// Implementations only read. When candidates cannot be told apart they
/// must report `NoMatch`: a missed match costs a duplicate, a wrong match
/// overwrites someone else's record.
#[async_trait]
pub trait Matcher<E: Entity>: Send + Sync {
    async fn try_to_find_match_for(&self, pair: &Pair<E>) -> MatchResult<E>;

    /// Told about every link the syncer persists.
    fn matched(&self, _local_id: &ObjectId, _remote_id: &ObjectId) {}
}

/// Filter applied to remote candidates, e.g. to skip unsubscribed records.
pub type RemoteCandidateFilter<F> = Arc<dyn Fn(&Snapshot<F>) -> bool + Send + Sync>;

/// Matches on fields that are unique on both sides (email, tag name).
///
/// All configured key pairs must be equal. Zero candidates is no match,
/// exactly one is a match, more is an ambiguous no match.
pub struct UniqueFieldMatcher<E: Entity> {
    local: Arc<dyn LocalStore<E::Local>>,
    remote: Arc<dyn RemoteStore<E::Remote>>,
    keys: Vec<(E::Local, E::Remote)>,
    remote_filter: Option<RemoteCandidateFilter<E::Remote>>,
}

impl<E: Entity> UniqueFieldMatcher<E> {
    pub fn new(
        local: Arc<dyn LocalStore<E::Local>>,
        remote: Arc<dyn RemoteStore<E::Remote>>,
    ) -> Self {
        Self {
            local,
            remote,
            keys: Vec::new(),
            remote_filter: None,
        }
    }

    /// Require `local` and `remote` to be equal.
    pub fn key(mut self, local: E::Local, remote: E::Remote) -> Self {
        self.keys.push((local, remote));
        self
    }

    /// Ignore remote candidates for which `filter` returns false.
    pub fn with_remote_filter(mut self, filter: RemoteCandidateFilter<E::Remote>) -> Self {
        self.remote_filter = Some(filter);
        self
    }

    /// Origin key values, or the name of the first empty key.
    fn key_values<F: FieldKey>(
        keys: impl Iterator<Item = F>,
        value_of: impl Fn(F) -> FieldValue,
    ) -> Result<Vec<FieldValue>, &'static str> {
        keys.map(|key| {
            let value = value_of(key);
            if value.is_empty() {
                Err(key.name())
            } else {
                Ok(value)
            }
        })
        .collect()
    }

    fn decide(candidates: usize, what: &str) -> Option<String> {
        match candidates {
            0 => Some(format!("no {} with matching {}", E::TYPE, what)),
            1 => None,
            n => Some(format!(
                "ambiguous: {} or more {} candidates with matching {}",
                n,
                E::TYPE,
                what
            )),
        }
    }

    fn key_names(&self) -> String {
        self.keys
            .iter()
            .map(|(local, _)| local.name())
            .collect::<Vec<_>>()
            .join("+")
    }

    async fn match_remote_for_local(&self, pair: &Pair<E>) -> MatchResult<E> {
        let Some(origin) = pair.local.as_ref() else {
            return MatchResult::error("pair has no local object");
        };
        let values = match Self::key_values(self.keys.iter().map(|(l, _)| *l), |key| {
            origin.get(key).clone()
        }) {
            Ok(values) => values,
            Err(name) => return MatchResult::error(format!("cannot match without {}", name)),
        };

        let criteria = self
            .keys
            .iter()
            .zip(values)
            .fold(Criteria::new(), |c, ((_, remote), value)| c.eq(*remote, value));

        let mut iter = FindIter::new(&*self.remote, criteria);
        if let Some(filter) = &self.remote_filter {
            let filter = Arc::clone(filter);
            iter = iter.with_filter(Box::new(move |snapshot| filter(snapshot)));
        }
        let candidates = match iter.collect_up_to(2).await {
            Ok(candidates) => candidates,
            Err(e) => return MatchResult::error(format!("remote search failed: {}", e)),
        };
        debug!(
            "{} candidates: {} returned, {} after filter",
            E::TYPE,
            iter.raw_count(),
            iter.filtered_count()
        );

        match Self::decide(candidates.len(), &self.key_names()) {
            Some(message) => MatchResult::no_match(message),
            None => match candidates.into_iter().next() {
                Some(snapshot) => MatchResult::found(Counterpart::remote_snapshot(snapshot)),
                None => MatchResult::no_match("no candidates"),
            },
        }
    }

    async fn match_local_for_remote(&self, pair: &Pair<E>) -> MatchResult<E> {
        let Some(origin) = pair.remote.as_ref() else {
            return MatchResult::error("pair has no remote object");
        };
        let values = match Self::key_values(self.keys.iter().map(|(_, r)| *r), |key| {
            origin.get(key).clone()
        }) {
            Ok(values) => values,
            Err(name) => return MatchResult::error(format!("cannot match without {}", name)),
        };

        let criteria = self
            .keys
            .iter()
            .zip(values)
            .fold(Criteria::new(), |c, ((local, _), value)| c.eq(*local, value));

        let candidates = match self.local.find(&criteria).await {
            Ok(candidates) => candidates,
            Err(e) => return MatchResult::error(format!("local search failed: {}", e)),
        };

        match Self::decide(candidates.len(), &self.key_names()) {
            Some(message) => MatchResult::no_match(message),
            None => match candidates.into_iter().next() {
                Some(snapshot) => MatchResult::found(Counterpart::local_snapshot(snapshot)),
                None => MatchResult::no_match("no candidates"),
            },
        }
    }
}

#[async_trait]
impl<E: Entity> Matcher<E> for UniqueFieldMatcher<E> {
    async fn try_to_find_match_for(&self, pair: &Pair<E>) -> MatchResult<E> {
        if self.keys.is_empty() {
            return MatchResult::error("no match keys configured");
        }
        match pair.origin() {
            Side::Local => self.match_remote_for_local(pair).await,
            Side::Remote => self.match_local_for_remote(pair).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Origin;
    use crate::testkit::{Contact, LocalContact, RemotePerson};
    use mirrorsync_storage::MemoryStore;
    use std::collections::BTreeMap;

    fn stores() -> (Arc<MemoryStore<LocalContact>>, Arc<MemoryStore<RemotePerson>>) {
        (
            Arc::new(MemoryStore::local("contacts")),
            Arc::new(MemoryStore::remote("people").with_page_size(1)),
        )
    }

    fn matcher(
        local: &Arc<MemoryStore<LocalContact>>,
        remote: &Arc<MemoryStore<RemotePerson>>,
    ) -> UniqueFieldMatcher<Contact> {
        UniqueFieldMatcher::new(local.clone(), remote.clone())
            .key(LocalContact::Email, RemotePerson::Email)
    }

    fn local_origin(email: &str) -> Pair<Contact> {
        Pair::new(Origin::local_snapshot(
            Snapshot::new(ObjectId::Int(1)).with(LocalContact::Email, email),
        ))
    }

    fn person(email: &str) -> BTreeMap<RemotePerson, FieldValue> {
        BTreeMap::from([(RemotePerson::Email, FieldValue::text(email))])
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let (local, remote) = stores();
        let result = matcher(&local, &remote)
            .try_to_find_match_for(&local_origin("bop@yum.com"))
            .await;
        assert_eq!(result.status, MatchStatus::NoMatch);
    }

    #[tokio::test]
    async fn test_single_candidate_matches() {
        let (local, remote) = stores();
        let id = remote.insert(person("bop@yum.com")).unwrap();
        remote.insert(person("other@yum.com")).unwrap();

        let result = matcher(&local, &remote)
            .try_to_find_match_for(&local_origin("bop@yum.com"))
            .await;
        assert_eq!(result.status, MatchStatus::FoundMatch);
        assert_eq!(result.counterpart.unwrap().id(), Some(&id));
    }

    #[tokio::test]
    async fn test_ambiguous_candidates_do_not_match() {
        let (local, remote) = stores();
        remote.insert(person("bop@yum.com")).unwrap();
        remote.insert(person("bop@yum.com")).unwrap();

        let result = matcher(&local, &remote)
            .try_to_find_match_for(&local_origin("bop@yum.com"))
            .await;
        assert_eq!(result.status, MatchStatus::NoMatch);
        assert!(result.message.unwrap().starts_with("ambiguous"));
    }

    #[tokio::test]
    async fn test_remote_filter_removes_candidates() {
        let (local, remote) = stores();
        let mut unsubscribed = person("bop@yum.com");
        unsubscribed.insert(RemotePerson::Status, FieldValue::text("unsubscribed"));
        remote.insert(unsubscribed).unwrap();
        let kept = remote.insert(person("bop@yum.com")).unwrap();

        let result = matcher(&local, &remote)
            .with_remote_filter(Arc::new(|s: &Snapshot<RemotePerson>| {
                s.get(RemotePerson::Status).as_text() != Some("unsubscribed")
            }))
            .try_to_find_match_for(&local_origin("bop@yum.com"))
            .await;
        assert_eq!(result.status, MatchStatus::FoundMatch);
        assert_eq!(result.counterpart.unwrap().id(), Some(&kept));
    }

    #[tokio::test]
    async fn test_empty_key_is_an_error() {
        let (local, remote) = stores();
        let result = matcher(&local, &remote)
            .try_to_find_match_for(&local_origin(""))
            .await;
        assert_eq!(result.status, MatchStatus::Error);
        assert_eq!(result.message.as_deref(), Some("cannot match without email"));
    }

    #[tokio::test]
    async fn test_remote_origin_searches_local() {
        let (local, remote) = stores();
        let local_id = local
            .insert(BTreeMap::from([(LocalContact::Email, FieldValue::text("bop@yum.com"))]))
            .unwrap();
        let pair = Pair::<Contact>::new(Origin::remote_snapshot(
            Snapshot::new(ObjectId::text("p1").unwrap()).with(RemotePerson::Email, "bop@yum.com"),
        ));

        let result = matcher(&local, &remote).try_to_find_match_for(&pair).await;
        assert_eq!(result.status, MatchStatus::FoundMatch);
        assert_eq!(result.counterpart.unwrap().id(), Some(&local_id));
    }
}
