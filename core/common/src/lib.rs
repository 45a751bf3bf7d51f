//! Common types shared across the mirrorsync crates.
//!
//! This module provides the identity and value types that both sides of a
//! synchronization agree on, plus the workspace-wide error type.

pub mod error;
pub mod field;
pub mod types;

pub use error::{Error, Result};
pub use field::{Access, FieldKey, FieldValue};
pub use types::{ObjectId, ProfileId, Side};
