//! Store capabilities for mirrorsync.
//!
//! The sync engine talks to both sides through the traits in [`provider`].
//! This crate also ships the backends:
//! - [`MemoryStore`]: in-memory store for either side, used in tests
//! - [`SqliteLocalStore`]: local relational store on SQLite
//! - [`HalRemoteStore`]: HAL+JSON CRUD API over HTTP
//!
//! # Design Principles
//! - Business failures are values: rejected writes are [`WriteOutcome::Rejected`],
//!   missing objects are `Ok(None)`
//! - `Err` means a fault (transport, I/O, corruption)
//! - All I/O operations are async

pub mod hal;
pub mod memory;
pub mod provider;
pub mod sqlite;

pub use hal::{HalConfig, HalRemoteStore};
pub use memory::MemoryStore;
pub use provider::{
    Criteria, FindIter, LocalStore, ObjectStore, Page, RemoteStore, Snapshot, SnapshotFilter,
    WriteOutcome,
};
pub use sqlite::{db_err, SqliteLocalStore};
