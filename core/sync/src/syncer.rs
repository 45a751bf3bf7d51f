//! Single-object syncer: matching, eligibility, one-way write and
//! bookkeeping for one origin object.
//!
//! Every call returns the completed [`Pair`]. Store faults never escape as
//! `Err`; they become `ERROR` results so that the sync state is always
//! persisted.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use mirrorsync_common::{Error, FieldKey, FieldValue, ObjectId, ProfileId, Result, Side};
use mirrorsync_storage::{LocalStore, ObjectStore, RemoteStore, Snapshot, WriteOutcome};

use crate::config::SyncConfig;
use crate::deletion::DeletionLedger;
use crate::entity::{Counterpart, Entity, Origin};
use crate::mapper::Mapper;
use crate::matcher::Matcher;
use crate::object::SyncableObject;
use crate::pair::Pair;
use crate::result::{
    DeletionSyncStatus, Eligibility, FieldDiff, MapAndWriteStatus, MapStatus, MatchStatus,
    OldOrNewMatchStatus, Outcome, ResultContext, Stage, StageResult, SyncStatus,
};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::state::{SyncState, SyncStateStore};

fn stage(outcome: Outcome, message: Option<String>) -> StageResult {
    StageResult {
        outcome,
        message,
        context: ResultContext::default(),
    }
}

fn fault_context(err: &impl std::fmt::Display) -> ResultContext {
    ResultContext {
        error: Some(err.to_string()),
        ..ResultContext::default()
    }
}

/// What a create or update ended in.
struct WriteReport {
    status: MapAndWriteStatus,
    message: Option<String>,
    succeeded: bool,
    error: Option<String>,
}

impl WriteReport {
    fn fault(succeeded: bool, message: &str, err: impl std::fmt::Display) -> Self {
        Self {
            status: MapAndWriteStatus::Error,
            message: Some(message.to_string()),
            succeeded,
            error: Some(err.to_string()),
        }
    }

    fn save_error(succeeded: bool, message: String) -> Self {
        Self {
            status: MapAndWriteStatus::SaveError,
            message: Some(message),
            succeeded,
            error: None,
        }
    }
}

async fn load_with_retry<F, S>(
    store: &S,
    retry: &RetryExecutor,
    id: &ObjectId,
) -> Result<Option<Snapshot<F>>>
where
    F: FieldKey,
    S: ObjectStore<F> + ?Sized,
{
    retry.execute(|| store.load(id)).await
}

/// Create or update `object`, then re-load it and check that the store kept
/// what was sent.
async fn write_and_verify<F, S>(
    store: &S,
    retry: &RetryExecutor,
    object: &mut SyncableObject<F>,
) -> WriteReport
where
    F: FieldKey,
    S: ObjectStore<F> + ?Sized,
{
    let creating = !object.has_id();
    let values = object.values_for_write();
    let intended = object.values_of(values.keys().copied());

    // Writes are not retried: a repeated create could duplicate the object.
    let id = match store.save(object.id(), &values).await {
        Ok(WriteOutcome::Saved { id }) => id,
        Ok(WriteOutcome::Rejected { reason }) => return WriteReport::save_error(false, reason),
        Err(e) => return WriteReport::fault(false, "write failed", e),
    };
    object.set_id(id.clone());

    let snapshot = match load_with_retry(store, retry, &id).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            return WriteReport::save_error(true, format!("{} {} missing after write", store.name(), id))
        }
        Err(e) => return WriteReport::fault(true, "re-load after write failed", e),
    };
    object.apply_snapshot(snapshot);

    let missing = object.missing_after_write(&intended);
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|key| key.name()).collect();
        return WriteReport::save_error(
            true,
            format!("{} did not keep {}", store.name(), names.join(", ")),
        );
    }

    WriteReport {
        status: if creating {
            MapAndWriteStatus::WroteNew
        } else {
            MapAndWriteStatus::WroteChanges
        },
        message: None,
        succeeded: true,
        error: None,
    }
}

/// Sync state or ledger update that failed after the write.
struct BookkeepingFailure {
    what: &'static str,
    error: Error,
}

/// Synchronizes single objects of entity type `E`.
pub struct Syncer<E: Entity> {
    local: Arc<dyn LocalStore<E::Local>>,
    remote: Arc<dyn RemoteStore<E::Remote>>,
    matcher: Arc<dyn Matcher<E>>,
    mapper: Arc<dyn Mapper<E>>,
    states: Arc<dyn SyncStateStore>,
    ledger: Arc<dyn DeletionLedger>,
    profile: ProfileId,
    retry: RetryExecutor,
    skipped_changes_settle: bool,
}

impl<E: Entity> Syncer<E> {
    pub fn new(
        local: Arc<dyn LocalStore<E::Local>>,
        remote: Arc<dyn RemoteStore<E::Remote>>,
        matcher: Arc<dyn Matcher<E>>,
        mapper: Arc<dyn Mapper<E>>,
        states: Arc<dyn SyncStateStore>,
        ledger: Arc<dyn DeletionLedger>,
    ) -> Self {
        Self {
            local,
            remote,
            matcher,
            mapper,
            states,
            ledger,
            profile: ProfileId::default(),
            retry: RetryExecutor::default(),
            skipped_changes_settle: true,
        }
    }

    pub fn with_profile(mut self, profile: ProfileId) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    pub fn with_skipped_changes_settle(mut self, settle: bool) -> Self {
        self.skipped_changes_settle = settle;
        self
    }

    /// Apply profile, retry and settle options from `config`.
    pub fn with_config(self, config: &SyncConfig) -> Self {
        self.with_profile(config.profile_id)
            .with_retry(config.retry_config())
            .with_skipped_changes_settle(config.skipped_changes_settle)
    }

    pub fn profile(&self) -> ProfileId {
        self.profile
    }

    pub fn local(&self) -> &Arc<dyn LocalStore<E::Local>> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore<E::Remote>> {
        &self.remote
    }

    /// Match `origin`, and map and write it into its counterpart if it
    /// changed since the last sync.
    pub async fn match_and_sync_if_eligible(&self, origin: Origin<E>) -> Pair<E> {
        let mut pair = Pair::new(origin);

        let matched = match self.load_origin(&mut pair).await {
            Ok(()) => self.fetch_old_or_find_new_match(&mut pair).await,
            Err(message) => {
                pair.results.push(stage(
                    Outcome::OldOrNewMatch(OldOrNewMatchStatus::Error),
                    Some(message),
                ));
                OldOrNewMatchStatus::Error
            }
        };

        if matched != OldOrNewMatchStatus::Error {
            pair.capture_pre_sync_times();
            if self.check_eligibility(&mut pair).await == Eligibility::Eligible {
                self.map_and_write(&mut pair).await;
            }
        }

        let persisted = self.persist_sync_state(&mut pair).await;
        let mut status = Self::sync_status(&pair);
        let mut context = ResultContext::default();
        let mut message = None;
        if let Err(failure) = persisted {
            error!("{} {}: {}", E::TYPE, failure.what, failure.error);
            status = SyncStatus::Error;
            message = Some(failure.what.to_string());
            context.error = Some(failure.error.to_string());
        }
        context.sync_state = pair.vars.sync_state.clone();

        match status {
            SyncStatus::Success => info!(
                "Synced {} {:?} -> {:?}",
                E::TYPE,
                pair.id_of(pair.origin()),
                pair.id_of(pair.target())
            ),
            SyncStatus::NoSyncNeeded => debug!("No sync needed for {} {:?}", E::TYPE, pair.id_of(pair.origin())),
            SyncStatus::Error => warn!(
                "Sync of {} {:?} failed: {}",
                E::TYPE,
                pair.id_of(pair.origin()),
                pair.results
                    .iter()
                    .filter(|result| result.is_error())
                    .map(|result| result.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            ),
        }

        let mut result = stage(Outcome::Sync(status), message);
        result.context = context;
        pair.results.push(result);
        pair
    }

    /// Propagate the deletion of `origin` to its counterpart.
    ///
    /// `origin` may refer to an object that no longer exists in its store;
    /// it is never loaded.
    pub async fn sync_deletion(&self, origin: Origin<E>) -> Pair<E> {
        let mut pair = Pair::new(origin);

        let (status, message, context) = match self.fetch_old_or_find_new_match(&mut pair).await {
            OldOrNewMatchStatus::Error => (
                DeletionSyncStatus::Error,
                Some("counterpart could not be resolved".to_string()),
                ResultContext::default(),
            ),
            OldOrNewMatchStatus::NoMatchFound => (
                DeletionSyncStatus::NothingToDelete,
                Some("no counterpart".to_string()),
                ResultContext::default(),
            ),
            OldOrNewMatchStatus::FetchedSavedMatch | OldOrNewMatchStatus::FoundNewMatch => {
                self.delete_target(&pair).await
            }
        };

        let mut result = stage(Outcome::DeletionSync(status), message);
        result.context = context;
        pair.results.push(result);
        pair
    }

    async fn delete_target(&self, pair: &Pair<E>) -> (DeletionSyncStatus, Option<String>, ResultContext) {
        let target = pair.target();
        let Some(target_id) = pair.id_of(target).cloned() else {
            return (
                DeletionSyncStatus::NothingToDelete,
                Some("counterpart has no id".to_string()),
                ResultContext::default(),
            );
        };

        let deleted = match target {
            Side::Local => self.local.delete(&target_id).await,
            Side::Remote => self.remote.delete(&target_id).await,
        };
        match deleted {
            Ok(true) => {
                info!("Deleted {} {} {}", target, E::TYPE, target_id);
                if target == Side::Remote {
                    if let Err(e) = self.ledger.record(E::TYPE, self.profile, &target_id).await {
                        error!("Could not record deletion of {} {}: {}", E::TYPE, target_id, e);
                        return (
                            DeletionSyncStatus::Error,
                            Some("deletion not recorded".to_string()),
                            fault_context(&e),
                        );
                    }
                }
                (DeletionSyncStatus::Deleted, None, ResultContext::default())
            }
            Ok(false) => (
                DeletionSyncStatus::NothingToDelete,
                Some(format!("{} {} already gone", E::TYPE, target_id)),
                ResultContext::default(),
            ),
            Err(e) => {
                warn!("Deleting {} {} failed: {}", E::TYPE, target_id, e);
                (
                    DeletionSyncStatus::Error,
                    Some("delete failed".to_string()),
                    fault_context(&e),
                )
            }
        }
    }

    /// Load an origin given by id only.
    async fn load_origin(&self, pair: &mut Pair<E>) -> std::result::Result<(), String> {
        let origin = pair.origin();
        let Some(id) = pair.id_of(origin).cloned() else {
            return Err(format!("{} origin has no id", E::TYPE));
        };
        let loaded = match origin {
            Side::Local => pair.local.as_ref().is_some_and(SyncableObject::is_loaded),
            Side::Remote => pair.remote.as_ref().is_some_and(SyncableObject::is_loaded),
        };
        if loaded {
            return Ok(());
        }
        match self.reload(pair, origin).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!("{} {} {} not found", origin, E::TYPE, id)),
            Err(e) => Err(format!("loading {} {} failed: {}", E::TYPE, id, e)),
        }
    }

    /// Replace the values of `side` with the store's.
    ///
    /// # Returns
    /// `false` if the object has no id or no longer exists.
    async fn reload(&self, pair: &mut Pair<E>, side: Side) -> Result<bool> {
        let Some(id) = pair.id_of(side).cloned() else {
            return Ok(false);
        };
        match side {
            Side::Local => match load_with_retry(self.local.as_ref(), &self.retry, &id).await? {
                Some(snapshot) => {
                    pair.ensure_local().apply_snapshot(snapshot);
                    Ok(true)
                }
                None => Ok(false),
            },
            Side::Remote => match load_with_retry(self.remote.as_ref(), &self.retry, &id).await? {
                Some(snapshot) => {
                    pair.ensure_remote().apply_snapshot(snapshot);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    async fn load_counterpart(&self, side: Side, id: &ObjectId) -> Result<Option<Counterpart<E>>> {
        Ok(match side {
            Side::Local => load_with_retry(self.local.as_ref(), &self.retry, id)
                .await?
                .map(Counterpart::local_snapshot),
            Side::Remote => load_with_retry(self.remote.as_ref(), &self.retry, id)
                .await?
                .map(Counterpart::remote_snapshot),
        })
    }

    /// Origin-side id of another sync state that already links `counterpart`.
    async fn claimed_by(
        &self,
        origin: Side,
        origin_id: &ObjectId,
        counterpart: &Counterpart<E>,
    ) -> Result<Option<ObjectId>> {
        let Some(counterpart_id) = counterpart.id() else {
            return Ok(None);
        };
        let state = self
            .states
            .find_by_id_on(origin.opposite(), E::TYPE, self.profile, counterpart_id)
            .await?;
        Ok(state
            .and_then(|state| state.id_on(origin).cloned())
            .filter(|linked| linked != origin_id))
    }

    /// Resolve the counterpart through a persisted link, or the matcher.
    async fn fetch_old_or_find_new_match(&self, pair: &mut Pair<E>) -> OldOrNewMatchStatus {
        let origin = pair.origin();
        let Some(origin_id) = pair.id_of(origin).cloned() else {
            pair.results.push(stage(
                Outcome::OldOrNewMatch(OldOrNewMatchStatus::Error),
                Some(format!("{} origin has no id", E::TYPE)),
            ));
            return OldOrNewMatchStatus::Error;
        };

        let state = match self
            .states
            .find_by_id_on(origin, E::TYPE, self.profile, &origin_id)
            .await
        {
            Ok(state) => state,
            Err(e) => {
                warn!("Sync state lookup for {} {} failed: {}", E::TYPE, origin_id, e);
                let mut result = stage(
                    Outcome::OldOrNewMatch(OldOrNewMatchStatus::Error),
                    Some("sync state lookup failed".to_string()),
                );
                result.context = fault_context(&e);
                pair.results.push(result);
                return OldOrNewMatchStatus::Error;
            }
        };

        if let Some(state) = state {
            let linked = state.id_on(origin.opposite()).cloned();
            pair.vars.sync_state = Some(state);
            if let Some(target_id) = linked {
                match self.load_counterpart(origin.opposite(), &target_id).await {
                    Ok(Some(counterpart)) => {
                        pair.set_counterpart(counterpart);
                        debug!("{} {} linked to {}", E::TYPE, origin_id, target_id);
                        pair.results.push(stage(
                            Outcome::OldOrNewMatch(OldOrNewMatchStatus::FetchedSavedMatch),
                            None,
                        ));
                        return OldOrNewMatchStatus::FetchedSavedMatch;
                    }
                    Ok(None) => warn!(
                        "Linked {} {} of {} is gone, matching again",
                        E::TYPE,
                        target_id,
                        origin_id
                    ),
                    Err(e) => {
                        let mut result = stage(
                            Outcome::OldOrNewMatch(OldOrNewMatchStatus::Error),
                            Some(format!("loading linked {} {} failed", E::TYPE, target_id)),
                        );
                        result.context = fault_context(&e);
                        pair.results.push(result);
                        return OldOrNewMatchStatus::Error;
                    }
                }
            }
        }

        let found = self.matcher.try_to_find_match_for(pair).await;
        pair.results
            .push(stage(Outcome::Match(found.status), found.message.clone()));

        let status = match (found.status, found.counterpart) {
            (MatchStatus::FoundMatch, Some(counterpart)) => {
                match self.claimed_by(origin, &origin_id, &counterpart).await {
                    Ok(None) => {
                        pair.set_counterpart(counterpart);
                        OldOrNewMatchStatus::FoundNewMatch
                    }
                    Ok(Some(other)) => {
                        let message = format!(
                            "{} {} {} already linked to {} {}",
                            origin.opposite(),
                            E::TYPE,
                            counterpart.id().map(ToString::to_string).unwrap_or_default(),
                            origin,
                            other
                        );
                        warn!("Refusing match for {} {}: {}", E::TYPE, origin_id, message);
                        pair.results.push(stage(
                            Outcome::OldOrNewMatch(OldOrNewMatchStatus::Error),
                            Some(message),
                        ));
                        return OldOrNewMatchStatus::Error;
                    }
                    Err(e) => {
                        let mut result = stage(
                            Outcome::OldOrNewMatch(OldOrNewMatchStatus::Error),
                            Some("sync state lookup failed".to_string()),
                        );
                        result.context = fault_context(&e);
                        pair.results.push(result);
                        return OldOrNewMatchStatus::Error;
                    }
                }
            }
            (MatchStatus::FoundMatch, None) => {
                pair.results.push(stage(
                    Outcome::OldOrNewMatch(OldOrNewMatchStatus::Error),
                    Some("matcher reported a match without counterpart".to_string()),
                ));
                return OldOrNewMatchStatus::Error;
            }
            (MatchStatus::NoMatch, _) => OldOrNewMatchStatus::NoMatchFound,
            (MatchStatus::Error, _) => OldOrNewMatchStatus::Error,
        };
        debug!("{} {}: {}", E::TYPE, origin_id, status);
        pair.results
            .push(stage(Outcome::OldOrNewMatch(status), found.message));
        status
    }

    async fn check_eligibility(&self, pair: &mut Pair<E>) -> Eligibility {
        let result = match self.eligibility_of(pair).await {
            Ok((status, reason)) => {
                debug!("{} {:?}: {} ({})", E::TYPE, pair.id_of(pair.origin()), status, reason);
                stage(Outcome::Eligibility(status), Some(reason.to_string()))
            }
            Err(e) => {
                warn!("Eligibility check for {} failed: {}", E::TYPE, e);
                let mut result = stage(
                    Outcome::Eligibility(Eligibility::Ineligible),
                    Some("eligibility check failed".to_string()),
                );
                result.context = fault_context(&e);
                result
            }
        };
        let status = match result.outcome {
            Outcome::Eligibility(status) => status,
            _ => Eligibility::Ineligible,
        };
        pair.results.push(result);
        status
    }

    async fn eligibility_of(&self, pair: &Pair<E>) -> Result<(Eligibility, &'static str)> {
        let origin = pair.origin();
        if pair.error_flag_of(origin) {
            return Ok((Eligibility::Ineligible, "origin is flagged as problematic"));
        }
        if origin == Side::Remote {
            if let Some(id) = pair.id_of(Side::Remote) {
                if self.ledger.contains(E::TYPE, self.profile, id).await? {
                    return Ok((Eligibility::Ineligible, "deleted by this system"));
                }
            }
        }
        let Some(state) = &pair.vars.sync_state else {
            return Ok((Eligibility::Eligible, "never synced"));
        };
        let Some(post) = state.post_sync_modified(origin) else {
            return Ok((Eligibility::Eligible, "no settled sync yet"));
        };
        Ok(match pair.modified_of(origin) {
            Some(current) if current > post => (Eligibility::Eligible, "changed since last sync"),
            Some(_) => (Eligibility::NotNeeded, "unchanged since last sync"),
            None => (Eligibility::Eligible, "no modification time"),
        })
    }

    fn push_write(
        pair: &mut Pair<E>,
        status: MapAndWriteStatus,
        message: Option<String>,
        context: ResultContext,
    ) -> MapAndWriteStatus {
        let mut result = stage(Outcome::MapAndWrite(status), message);
        result.context = context;
        pair.results.push(result);
        status
    }

    fn named_values_of(pair: &Pair<E>, side: Side) -> BTreeMap<&'static str, FieldValue> {
        match side {
            Side::Local => pair.local.as_ref().map(SyncableObject::named_values),
            Side::Remote => pair.remote.as_ref().map(SyncableObject::named_values),
        }
        .unwrap_or_default()
    }

    fn diff_of(pair: &Pair<E>, side: Side) -> Vec<FieldDiff> {
        match side {
            Side::Local => pair.local.as_ref().map(SyncableObject::diff),
            Side::Remote => pair.remote.as_ref().map(SyncableObject::diff),
        }
        .unwrap_or_default()
    }

    async fn map_and_write(&self, pair: &mut Pair<E>) -> MapAndWriteStatus {
        let origin = pair.origin();
        let target = pair.target();

        match self.reload(pair, origin).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("{} {} origin vanished before mapping", origin, E::TYPE);
                return Self::push_write(
                    pair,
                    MapAndWriteStatus::Error,
                    Some("origin no longer exists".to_string()),
                    ResultContext::default(),
                );
            }
            Err(e) => {
                warn!("Re-loading {} origin failed: {}", E::TYPE, e);
                return Self::push_write(
                    pair,
                    MapAndWriteStatus::Error,
                    Some("origin could not be re-loaded".to_string()),
                    fault_context(&e),
                );
            }
        }
        pair.ensure_target();
        let before = Self::named_values_of(pair, target);

        let mapped = self.mapper.map_one_way(pair).await;
        pair.results
            .push(stage(Outcome::Map(mapped.status), mapped.message.clone()));
        let base = ResultContext {
            snapshot: Some(before),
            ..ResultContext::default()
        };
        match mapped.status {
            MapStatus::Error => {
                return Self::push_write(pair, MapAndWriteStatus::Error, mapped.message, base)
            }
            MapStatus::SkippedAllChanges => {
                return Self::push_write(pair, MapAndWriteStatus::SkippedChanges, mapped.message, base)
            }
            MapStatus::Success => {}
        }

        if !pair.is_altered_of(target) {
            return Self::push_write(pair, MapAndWriteStatus::NoChangesToWrite, None, base);
        }
        if pair.id_of(target).is_some() && !self.mapper.update_capable(target) {
            debug!("{} {} objects take no updates, skipping", target, E::TYPE);
            return Self::push_write(
                pair,
                MapAndWriteStatus::SkippedChanges,
                Some(format!("{} {} objects do not accept updates", target, E::TYPE)),
                base,
            );
        }

        let diff = Self::diff_of(pair, target);
        let report = match target {
            Side::Local => write_and_verify(self.local.as_ref(), &self.retry, pair.ensure_local()).await,
            Side::Remote => {
                write_and_verify(self.remote.as_ref(), &self.retry, pair.ensure_remote()).await
            }
        };

        match report.status {
            MapAndWriteStatus::WroteNew | MapAndWriteStatus::WroteChanges => info!(
                "{} {} {} {:?}: {}",
                report.status,
                target,
                E::TYPE,
                pair.id_of(target),
                diff.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            ),
            _ => warn!(
                "Writing {} {} failed: {} {}",
                target,
                E::TYPE,
                report.status,
                report.message.as_deref().unwrap_or_default()
            ),
        }

        let context = ResultContext {
            diff,
            error: report.error,
            write_succeeded: Some(report.succeeded),
            ..base
        };
        Self::push_write(pair, report.status, report.message, context)
    }

    /// Last result that decides the persisted status.
    fn terminal_outcome(pair: &Pair<E>) -> Outcome {
        [Stage::MapAndWrite, Stage::Eligibility, Stage::OldOrNewMatch]
            .into_iter()
            .find_map(|stage| pair.results.last_of(stage))
            .map(|result| result.outcome)
            .unwrap_or(Outcome::Sync(SyncStatus::Error))
    }

    /// Whether the attempt brought both sides in line.
    fn settled(&self, pair: &Pair<E>) -> bool {
        match pair.results.map_and_write() {
            Some(
                MapAndWriteStatus::WroteNew
                | MapAndWriteStatus::WroteChanges
                | MapAndWriteStatus::NoChangesToWrite,
            ) => true,
            Some(MapAndWriteStatus::SkippedChanges) => self.skipped_changes_settle,
            _ => false,
        }
    }

    /// Write the sync state of this attempt and its side effects.
    async fn persist_sync_state(
        &self,
        pair: &mut Pair<E>,
    ) -> std::result::Result<(), BookkeepingFailure> {
        let origin = pair.origin();
        let local_id = pair.id_of(Side::Local).cloned();
        let remote_id = pair.id_of(Side::Remote).cloned();

        let existing = pair.vars.sync_state.take();
        if existing.is_none() && (local_id.is_none() || remote_id.is_none()) {
            debug!("{} pair is not linked, no sync state", E::TYPE);
            return Ok(());
        }

        let status = Self::terminal_outcome(pair);
        let mut state =
            existing.unwrap_or_else(|| SyncState::new(E::TYPE, self.profile, origin, status));
        state.origin = origin;
        state.status = status;
        state.sync_time = Utc::now();
        if local_id.is_some() {
            state.local_id = local_id.clone();
        }
        if remote_id.is_some() {
            state.remote_id = remote_id.clone();
        }
        state.local_pre_sync_modified = pair.vars.local_pre_sync_modified;
        state.remote_pre_sync_modified = pair.vars.remote_pre_sync_modified;
        if self.settled(pair) {
            state.local_post_sync_modified = pair.modified_of(Side::Local);
            state.remote_post_sync_modified = pair.modified_of(Side::Remote);
        }

        match self.states.save(&state).await {
            Ok(saved) => pair.vars.sync_state = Some(saved),
            Err(error) => {
                pair.vars.sync_state = Some(state);
                return Err(BookkeepingFailure {
                    what: "sync state not persisted",
                    error,
                });
            }
        }
        debug!("Persisted {} sync state: {}", E::TYPE, status);

        let remote_written = origin == Side::Local
            && pair
                .results
                .last_of(Stage::MapAndWrite)
                .and_then(|result| result.context.write_succeeded)
                .unwrap_or(false);
        if remote_written {
            if let Some(remote_id) = &remote_id {
                let forgotten = self
                    .ledger
                    .forget(E::TYPE, self.profile, remote_id)
                    .await
                    .map_err(|error| BookkeepingFailure {
                        what: "deletion ledger not updated",
                        error,
                    })?;
                if forgotten {
                    info!("{} {} re-synced, removed from deletion ledger", E::TYPE, remote_id);
                }
            }
        }

        if let (Some(local_id), Some(remote_id)) = (&local_id, &remote_id) {
            self.matcher.matched(local_id, remote_id);
        }
        Ok(())
    }

    /// Top-level status from the stage results.
    fn sync_status(pair: &Pair<E>) -> SyncStatus {
        if pair.results.old_or_new_match() == Some(OldOrNewMatchStatus::Error) {
            return SyncStatus::Error;
        }
        match pair.results.map_and_write() {
            Some(MapAndWriteStatus::WroteNew | MapAndWriteStatus::WroteChanges) => SyncStatus::Success,
            Some(MapAndWriteStatus::NoChangesToWrite | MapAndWriteStatus::SkippedChanges) => {
                SyncStatus::NoSyncNeeded
            }
            Some(MapAndWriteStatus::SaveError | MapAndWriteStatus::Error) => SyncStatus::Error,
            None => {
                let eligibility_fault = pair
                    .results
                    .last_of(Stage::Eligibility)
                    .is_some_and(|result| result.context.error.is_some());
                if eligibility_fault {
                    SyncStatus::Error
                } else {
                    SyncStatus::NoSyncNeeded
                }
            }
        }
    }
}
