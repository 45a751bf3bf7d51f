//! SQLite-backed local store.
//!
//! One table per object type. Field values are kept as a JSON document so
//! that the table layout does not depend on the field set.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use mirrorsync_common::{Error, FieldKey, FieldValue, ObjectId, Result, Side};

use crate::provider::{Criteria, LocalStore, ObjectStore, Snapshot, WriteOutcome};

/// Convert a rusqlite error into the common error type.
pub fn db_err(err: rusqlite::Error) -> Error {
    Error::Database(err.to_string())
}

/// Local store persisting one object type in a SQLite table.
pub struct SqliteLocalStore<F: FieldKey> {
    conn: Mutex<Connection>,
    table: String,
    name: String,
    _fields: PhantomData<fn() -> F>,
}

impl<F: FieldKey> SqliteLocalStore<F> {
    /// Open (or create) the store.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    /// - `table`: Table name, `[A-Za-z0-9_]+`
    ///
    /// # Errors
    /// - Invalid table name
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        Self::with_connection(conn, table)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(table: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::InvalidInput(format!("Invalid table name '{}'", table)));
        }

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                modified_at TEXT NOT NULL,
                error_flag INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            );
            "#
        ))
        .map_err(db_err)?;

        info!("Local table {} ready", table);
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
            name: format!("sqlite:{}", table),
            _fields: PhantomData,
        })
    }

    /// Set or clear the error flag on a row.
    pub fn set_error_flag(&self, id: &ObjectId, flag: bool) -> Result<bool> {
        let key = Self::row_id(id)?;
        let changed = self
            .conn()?
            .execute(
                &format!("UPDATE {} SET error_flag = ?1 WHERE id = ?2", self.table),
                params![flag as i32, key],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Number of rows.
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()?
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get(0)
            })
            .map_err(db_err)?;
        Ok(count as u64)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("connection mutex poisoned".to_string()))
    }

    fn row_id(id: &ObjectId) -> Result<i64> {
        id.as_int()
            .ok_or_else(|| Error::InvalidInput(format!("Local ids are integers, got '{}'", id)))
    }

    fn encode(values: &BTreeMap<F, FieldValue>) -> Result<String> {
        let named: BTreeMap<&str, &FieldValue> =
            values.iter().map(|(key, value)| (key.name(), value)).collect();
        Ok(serde_json::to_string(&named)?)
    }

    fn decode(data: &str) -> Result<BTreeMap<F, FieldValue>> {
        let named: BTreeMap<String, FieldValue> = serde_json::from_str(data)?;
        // Columns of fields that no longer exist are ignored.
        Ok(named
            .into_iter()
            .filter_map(|(name, value)| F::from_name(&name).map(|key| (key, value)))
            .collect())
    }

    fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Serialization(format!("Bad timestamp '{}': {}", raw, e)))
    }

    fn read_row(conn: &Connection, table: &str, key: i64) -> Result<Option<Snapshot<F>>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT modified_at, error_flag, data FROM {} WHERE id = ?1",
                    table
                ),
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i32>(1)? != 0,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        match row {
            Some((modified, error_flag, data)) => Ok(Some(Snapshot {
                id: ObjectId::Int(key),
                values: Self::decode(&data)?,
                modified: Some(Self::parse_time(&modified)?),
                error_flag,
                url: None,
            })),
            None => Ok(None),
        }
    }

    fn next_modified(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = Utc::now();
        match previous {
            Some(prev) if prev >= now => prev + Duration::milliseconds(1),
            _ => now,
        }
    }
}

#[async_trait]
impl<F: FieldKey> ObjectStore<F> for SqliteLocalStore<F> {
    fn side(&self) -> Side {
        Side::Local
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, id: &ObjectId) -> Result<Option<Snapshot<F>>> {
        let key = Self::row_id(id)?;
        let conn = self.conn()?;
        Self::read_row(&conn, &self.table, key)
    }

    async fn save(
        &self,
        id: Option<&ObjectId>,
        values: &BTreeMap<F, FieldValue>,
    ) -> Result<WriteOutcome> {
        let conn = self.conn()?;

        match id {
            None => {
                let modified = Self::next_modified(None);
                conn.execute(
                    &format!(
                        "INSERT INTO {} (modified_at, error_flag, data) VALUES (?1, 0, ?2)",
                        self.table
                    ),
                    params![modified.to_rfc3339(), Self::encode(values)?],
                )
                .map_err(db_err)?;
                let id = ObjectId::Int(conn.last_insert_rowid());
                debug!("Inserted {} {}", self.name, id);
                Ok(WriteOutcome::Saved { id })
            }
            Some(id) => {
                let key = Self::row_id(id)?;
                let Some(existing) = Self::read_row(&conn, &self.table, key)? else {
                    return Ok(WriteOutcome::Rejected {
                        reason: format!("{} {} does not exist", self.name, id),
                    });
                };
                let mut merged = existing.values;
                merged.extend(values.iter().map(|(k, v)| (*k, v.clone())));
                let modified = Self::next_modified(existing.modified);
                conn.execute(
                    &format!(
                        "UPDATE {} SET modified_at = ?1, data = ?2 WHERE id = ?3",
                        self.table
                    ),
                    params![modified.to_rfc3339(), Self::encode(&merged)?, key],
                )
                .map_err(db_err)?;
                debug!("Updated {} {}", self.name, id);
                Ok(WriteOutcome::Saved { id: id.clone() })
            }
        }
    }

    async fn delete(&self, id: &ObjectId) -> Result<bool> {
        let key = Self::row_id(id)?;
        let deleted = self
            .conn()?
            .execute(&format!("DELETE FROM {} WHERE id = ?1", self.table), params![key])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl<F: FieldKey> LocalStore<F> for SqliteLocalStore<F> {
    async fn find(&self, criteria: &Criteria<F>) -> Result<Vec<Snapshot<F>>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, modified_at, error_flag, data FROM {} ORDER BY id",
                self.table
            ))
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)? != 0,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?;

        let mut result = Vec::new();
        for row in rows {
            let (key, modified, error_flag, data) = row.map_err(db_err)?;
            let snapshot = Snapshot {
                id: ObjectId::Int(key),
                values: Self::decode(&data)?,
                modified: Some(Self::parse_time(&modified)?),
                error_flag,
                url: None,
            };
            if criteria.matches(&snapshot) {
                result.push(snapshot);
            }
        }
        Ok(result)
    }
}
