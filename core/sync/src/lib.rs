//! Mirrorsync synchronization core
//!
//! Keeps objects of a local relational store and a remote hypermedia API in
//! line, one object at a time:
//! - Dirty-tracked fields and per-side syncable objects
//! - Matching through persisted links or entity-specific matchers
//! - Timestamp-based eligibility, one-way mapping and verified writes
//! - Sync state, deletion ledger and process lock bookkeeping
//!
//! The central type is [`Syncer`]; [`BatchRunner`] drives it over many
//! objects under a [`ProcessLock`].

pub mod batch;
pub mod cache;
pub mod config;
pub mod deletion;
pub mod entity;
pub mod field;
pub mod lock;
pub mod mapper;
pub mod matcher;
pub mod object;
pub mod pair;
pub mod result;
pub mod retry;
pub mod sqlite;
pub mod state;
pub mod syncer;

#[cfg(test)]
pub(crate) mod testkit;

// Re-export main types
pub use batch::{BatchRunner, BatchSummary};
pub use cache::{CachedMatcher, MatchCache};
pub use config::SyncConfig;
pub use deletion::{DeletionEntry, DeletionLedger, MemoryDeletionLedger};
pub use entity::{Counterpart, Entity, Origin};
pub use field::{FieldError, TrackedField};
pub use lock::{
    LockRecord, LockStatus, MemorySettingsStore, ProcessLock, ProcessProbe, SettingsStore,
    SystemProbe,
};
pub use mapper::{Direction, MapResult, Mapper, SkipPredicate, TableMapper};
pub use matcher::{MatchResult, Matcher, RemoteCandidateFilter, UniqueFieldMatcher};
pub use object::SyncableObject;
pub use pair::{Pair, PairVars};
pub use result::{
    DeletionSyncStatus, Eligibility, FieldDiff, MapAndWriteStatus, MapStatus, MatchStatus,
    OldOrNewMatchStatus, Outcome, ResultContext, ResultStack, Stage, StageResult, SyncStatus,
};
pub use retry::{RetryConfig, RetryExecutor};
pub use sqlite::SqliteSyncDb;
pub use state::{MemorySyncStateStore, SyncState, SyncStateStore};
pub use syncer::Syncer;
