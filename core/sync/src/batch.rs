//! Batch runs of the single-object syncer under the process lock.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use mirrorsync_common::{Error, Result};
use mirrorsync_storage::{Criteria, FindIter, LocalStore, SnapshotFilter};

use crate::entity::{Entity, Origin};
use crate::lock::ProcessLock;
use crate::result::{DeletionSyncStatus, SyncStatus};
use crate::syncer::Syncer;

/// Counts of one batch run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    /// Objects written (or deleted, for deletion runs).
    pub synced: usize,
    /// Objects that needed nothing.
    pub unchanged: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.synced + self.unchanged + self.failed
    }
}

/// Runs many origins through one [`Syncer`], one at a time.
pub struct BatchRunner<E: Entity> {
    syncer: Syncer<E>,
    lock: ProcessLock,
}

impl<E: Entity> BatchRunner<E> {
    pub fn new(syncer: Syncer<E>, lock: ProcessLock) -> Self {
        Self { syncer, lock }
    }

    pub fn syncer(&self) -> &Syncer<E> {
        &self.syncer
    }

    pub fn lock(&self) -> &ProcessLock {
        &self.lock
    }

    async fn acquire(&self) -> Result<()> {
        if self.lock.acquire().await? {
            Ok(())
        } else {
            Err(Error::Locked(format!(
                "another {} run holds lock '{}'",
                E::TYPE,
                self.lock.name()
            )))
        }
    }

    /// Sync every origin.
    ///
    /// # Errors
    /// - `Locked` if another live process runs a batch under the same lock
    pub async fn run(&self, origins: Vec<Origin<E>>) -> Result<BatchSummary> {
        self.acquire().await?;
        let started = Instant::now();
        let mut summary = BatchSummary::default();

        for origin in origins {
            let pair = self.syncer.match_and_sync_if_eligible(origin).await;
            match pair.results.sync() {
                Some(SyncStatus::Success) => summary.synced += 1,
                Some(SyncStatus::NoSyncNeeded) => summary.unchanged += 1,
                Some(SyncStatus::Error) | None => summary.failed += 1,
            }
        }

        summary.duration = started.elapsed();
        self.lock.release().await?;
        info!(
            "{} batch: {} synced, {} unchanged, {} failed in {:?}",
            E::TYPE,
            summary.synced,
            summary.unchanged,
            summary.failed,
            summary.duration
        );
        Ok(summary)
    }

    /// Propagate the deletion of every origin.
    pub async fn run_deletions(&self, origins: Vec<Origin<E>>) -> Result<BatchSummary> {
        self.acquire().await?;
        let started = Instant::now();
        let mut summary = BatchSummary::default();

        for origin in origins {
            let pair = self.syncer.sync_deletion(origin).await;
            match pair.results.deletion_sync() {
                Some(DeletionSyncStatus::Deleted) => summary.synced += 1,
                Some(DeletionSyncStatus::NothingToDelete) => summary.unchanged += 1,
                Some(DeletionSyncStatus::Error) | None => summary.failed += 1,
            }
        }

        summary.duration = started.elapsed();
        self.lock.release().await?;
        info!(
            "{} deletions: {} deleted, {} not found, {} failed",
            E::TYPE,
            summary.synced,
            summary.unchanged,
            summary.failed
        );
        Ok(summary)
    }

    /// Up to `limit` remote objects matching `criteria` and `filter`, as
    /// origins of an inbound run.
    pub async fn inbound_origins(
        &self,
        criteria: Criteria<E::Remote>,
        filter: Option<SnapshotFilter<E::Remote>>,
        limit: usize,
    ) -> Result<Vec<Origin<E>>> {
        let mut iter = FindIter::new(self.syncer.remote().as_ref(), criteria);
        if let Some(filter) = filter {
            iter = iter.with_filter(filter);
        }
        let snapshots = iter.collect_up_to(limit).await?;
        let skipped = iter.raw_count() - iter.filtered_count();
        if skipped > 0 {
            warn!("{} inbound {} objects filtered out", skipped, E::TYPE);
        }
        debug!(
            "{} inbound {} objects ({} returned by the store)",
            snapshots.len(),
            E::TYPE,
            iter.raw_count()
        );
        Ok(snapshots.into_iter().map(Origin::remote_snapshot).collect())
    }

    /// Local objects matching `criteria`, as origins of an outbound run.
    pub async fn outbound_origins(&self, criteria: &Criteria<E::Local>) -> Result<Vec<Origin<E>>> {
        let snapshots = self.syncer.local().find(criteria).await?;
        debug!("{} outbound {} objects", snapshots.len(), E::TYPE);
        Ok(snapshots.into_iter().map(Origin::local_snapshot).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deletion::MemoryDeletionLedger;
    use crate::lock::{MemorySettingsStore, SettingsStore};
    use crate::testkit::{contact_fixture, values, Contact, Fixture, LocalContact, RemotePerson};
    use mirrorsync_common::{FieldValue, ObjectId};
    use mirrorsync_storage::{MemoryStore, Snapshot};
    use std::sync::Arc;

    struct Harness {
        runner: BatchRunner<Contact>,
        local: Arc<MemoryStore<LocalContact>>,
        remote: Arc<MemoryStore<RemotePerson>>,
        ledger: Arc<MemoryDeletionLedger>,
    }

    fn harness(settings: Arc<dyn SettingsStore>) -> Harness {
        let Fixture {
            local,
            remote,
            ledger,
            syncer,
            ..
        } = contact_fixture(MemoryStore::remote("people").with_page_size(2));
        Harness {
            runner: BatchRunner::new(syncer, ProcessLock::new("contacts", settings)),
            local,
            remote,
            ledger,
        }
    }

    fn settings() -> Arc<dyn SettingsStore> {
        Arc::new(MemorySettingsStore::new())
    }

    #[tokio::test]
    async fn test_run_counts_outcomes() {
        let h = harness(settings());
        h.local.insert(values(&[(LocalContact::Email, "a@yum.com")])).unwrap();
        h.local.insert(values(&[(LocalContact::Email, "b@yum.com")])).unwrap();
        h.local.insert(values(&[(LocalContact::FirstName, "No Email")])).unwrap();

        let origins = h.runner.outbound_origins(&Criteria::new()).await.unwrap();
        assert_eq!(origins.len(), 3);

        let summary = h.runner.run(origins).await.unwrap();
        assert_eq!(summary.synced, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 3);
        assert_eq!(h.remote.len(), 2);
        assert!(!h.runner.lock().status().await.unwrap().held);

        let origins = h.runner.outbound_origins(&Criteria::new()).await.unwrap();
        let again = h.runner.run(origins).await.unwrap();
        assert_eq!(again.unchanged, 2);
        assert_eq!(h.remote.creates(), 2);
    }

    #[tokio::test]
    async fn test_held_lock_refuses_run() {
        let settings = settings();
        let h = harness(settings.clone());
        let holder = ProcessLock::new("contacts", settings);
        assert!(holder.acquire().await.unwrap());

        let result = h.runner.run(Vec::new()).await;
        assert!(matches!(result, Err(Error::Locked(_))));

        holder.release().await.unwrap();
        assert!(h.runner.run(Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_inbound_origins_filter_and_limit() {
        let h = harness(settings());
        for email in ["a@yum.com", "b@yum.com", "c@yum.com"] {
            h.remote.insert(values(&[(RemotePerson::Email, email)])).unwrap();
        }
        let mut unsubscribed = values(&[(RemotePerson::Email, "d@yum.com")]);
        unsubscribed.insert(RemotePerson::Status, FieldValue::text("unsubscribed"));
        h.remote.insert(unsubscribed).unwrap();

        let subscribed: SnapshotFilter<RemotePerson> =
            Box::new(|s| s.get(RemotePerson::Status).as_text() != Some("unsubscribed"));
        let all = h
            .runner
            .inbound_origins(Criteria::new(), Some(subscribed), 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let first_two = h.runner.inbound_origins(Criteria::new(), None, 2).await.unwrap();
        assert_eq!(first_two.len(), 2);

        let summary = h.runner.run(all).await.unwrap();
        assert_eq!(summary.synced, 3);
        assert_eq!(h.local.len(), 3);
    }

    #[tokio::test]
    async fn test_run_deletions() {
        let h = harness(settings());
        let id = h.local.insert(values(&[(LocalContact::Email, "a@yum.com")])).unwrap();
        h.runner.run(vec![Origin::local_id(id.clone())]).await.unwrap();

        let last_known = h.local.get(&id).unwrap().unwrap();
        let stranger = Snapshot::new(ObjectId::Int(50)).with(LocalContact::Email, "nobody@yum.com");
        let summary = h
            .runner
            .run_deletions(vec![
                Origin::local_snapshot(last_known),
                Origin::local_snapshot(stranger),
            ])
            .await
            .unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.unchanged, 1);
        assert!(h.remote.is_empty());
        assert_eq!(h.ledger.len(), 1);
    }
}
