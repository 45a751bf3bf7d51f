//! Identity types used throughout mirrorsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the two stores being kept consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The local relational store.
    Local,
    /// The remote hypermedia API.
    Remote,
}

impl Side {
    /// The other side.
    pub fn opposite(self) -> Self {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }

    /// Lowercase name, as stored in the sync state table.
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "local" => Ok(Side::Local),
            "remote" => Ok(Side::Remote),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown side '{}'",
                other
            ))),
        }
    }
}

/// Identifier of an object in one of the stores.
///
/// Local rows use integer keys, remote resources usually use opaque
/// strings. The two never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectId {
    /// Integer primary key.
    Int(i64),
    /// Opaque string identifier.
    Text(String),
}

impl ObjectId {
    /// Create a text identifier.
    ///
    /// # Errors
    /// - Returns error if the identifier is empty
    pub fn text(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ObjectId cannot be empty".to_string(),
            ));
        }
        Ok(ObjectId::Text(id))
    }

    /// Integer value, if this is an integer id.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ObjectId::Int(i) => Some(*i),
            ObjectId::Text(_) => None,
        }
    }

    /// Stable storage encoding that keeps integer and text ids apart.
    pub fn encode(&self) -> String {
        match self {
            ObjectId::Int(i) => i.to_string(),
            ObjectId::Text(s) => format!("s:{}", s),
        }
    }

    /// Inverse of [`ObjectId::encode`].
    pub fn decode(raw: &str) -> crate::Result<Self> {
        if let Some(text) = raw.strip_prefix("s:") {
            return Self::text(text);
        }
        raw.parse::<i64>().map(ObjectId::Int).map_err(|_| {
            crate::Error::Serialization(format!("Malformed object id '{}'", raw))
        })
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Int(i) => write!(f, "{}", i),
            ObjectId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ObjectId {
    fn from(id: i64) -> Self {
        ObjectId::Int(id)
    }
}

/// Identifies one remote-system configuration.
///
/// Sync bookkeeping is scoped per profile so that one local database can be
/// mirrored into several remote accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub i64);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        ProfileId(1)
    }
}
