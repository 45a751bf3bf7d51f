//! SQLite persistence for sync bookkeeping.
//!
//! One database holds sync states, the deletion ledger and settings, so a
//! batch run needs a single file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use mirrorsync_common::{Error, ObjectId, ProfileId, Result, Side};
use mirrorsync_storage::db_err;

use crate::deletion::{DeletionEntry, DeletionLedger};
use crate::lock::SettingsStore;
use crate::result::Outcome;
use crate::state::{resolve_row, SyncState, SyncStateStore};

const STATE_COLUMNS: &str = "id, entity_type, profile_id, local_id, remote_id, origin, sync_time, \
     local_pre_sync_modified, local_post_sync_modified, \
     remote_pre_sync_modified, remote_post_sync_modified, status";

/// Sync bookkeeping database.
pub struct SqliteSyncDb {
    conn: Mutex<Connection>,
}

impl SqliteSyncDb {
    /// Create or open the database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                profile_id INTEGER NOT NULL,
                local_id TEXT,
                remote_id TEXT,
                origin TEXT NOT NULL,
                sync_time TEXT NOT NULL,
                local_pre_sync_modified TEXT,
                local_post_sync_modified TEXT,
                remote_pre_sync_modified TEXT,
                remote_post_sync_modified TEXT,
                status TEXT NOT NULL,
                UNIQUE (entity_type, profile_id, local_id),
                UNIQUE (entity_type, profile_id, remote_id)
            );

            CREATE TABLE IF NOT EXISTS deletion_ledger (
                entity_type TEXT NOT NULL,
                profile_id INTEGER NOT NULL,
                remote_id TEXT NOT NULL,
                deleted_at TEXT NOT NULL,
                PRIMARY KEY (entity_type, profile_id, remote_id)
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;

        info!("Sync database opened successfully");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("connection mutex poisoned".to_string()))
    }

    fn read_state(row: &Row<'_>) -> rusqlite::Result<RawState> {
        Ok(RawState {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            profile_id: row.get(2)?,
            local_id: row.get(3)?,
            remote_id: row.get(4)?,
            origin: row.get(5)?,
            sync_time: row.get(6)?,
            times: [row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?],
            status: row.get(11)?,
        })
    }

    fn query_states(
        conn: &Connection,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<SyncState>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sync_state WHERE {} ORDER BY id",
                STATE_COLUMNS, filter
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params, Self::read_state).map_err(db_err)?;
        let mut states = Vec::new();
        for row in rows {
            states.push(row.map_err(db_err)?.decode()?);
        }
        Ok(states)
    }

    fn find_by(
        &self,
        column: &str,
        entity_type: &str,
        profile: ProfileId,
        id: &ObjectId,
    ) -> Result<Option<SyncState>> {
        let conn = self.conn()?;
        let mut states = Self::query_states(
            &conn,
            &format!("entity_type = ?1 AND profile_id = ?2 AND {} = ?3", column),
            params![entity_type, profile.0, id.encode()],
        )?;
        Ok(states.pop())
    }

    fn row_id_by(
        conn: &Connection,
        column: &str,
        state: &SyncState,
        id: Option<&ObjectId>,
    ) -> Result<Option<i64>> {
        let Some(id) = id else {
            return Ok(None);
        };
        conn.query_row(
            &format!(
                "SELECT id FROM sync_state WHERE entity_type = ?1 AND profile_id = ?2 AND {} = ?3",
                column
            ),
            params![state.entity_type, state.profile_id.0, id.encode()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

/// Columns of a sync state row before decoding.
struct RawState {
    id: i64,
    entity_type: String,
    profile_id: i64,
    local_id: Option<String>,
    remote_id: Option<String>,
    origin: String,
    sync_time: String,
    times: [Option<String>; 4],
    status: String,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("Bad timestamp '{}': {}", raw, e)))
}

fn parse_opt_time(raw: &Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

fn format_opt_time(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|t| t.to_rfc3339())
}

impl RawState {
    fn decode(self) -> Result<SyncState> {
        let [local_pre, local_post, remote_pre, remote_post] = &self.times;
        Ok(SyncState {
            id: Some(self.id),
            entity_type: self.entity_type,
            profile_id: ProfileId(self.profile_id),
            local_id: self.local_id.as_deref().map(ObjectId::decode).transpose()?,
            remote_id: self.remote_id.as_deref().map(ObjectId::decode).transpose()?,
            origin: self
                .origin
                .parse::<Side>()
                .map_err(|e| Error::Database(format!("Bad origin: {}", e)))?,
            sync_time: parse_time(&self.sync_time)?,
            local_pre_sync_modified: parse_opt_time(local_pre)?,
            local_post_sync_modified: parse_opt_time(local_post)?,
            remote_pre_sync_modified: parse_opt_time(remote_pre)?,
            remote_post_sync_modified: parse_opt_time(remote_post)?,
            status: Outcome::from_code(&self.status)
                .ok_or_else(|| Error::Database(format!("Bad status '{}'", self.status)))?,
        })
    }
}

#[async_trait]
impl SyncStateStore for SqliteSyncDb {
    async fn find_by_local_id(
        &self,
        entity_type: &str,
        profile: ProfileId,
        id: &ObjectId,
    ) -> Result<Option<SyncState>> {
        self.find_by("local_id", entity_type, profile, id)
    }

    async fn find_by_remote_id(
        &self,
        entity_type: &str,
        profile: ProfileId,
        id: &ObjectId,
    ) -> Result<Option<SyncState>> {
        self.find_by("remote_id", entity_type, profile, id)
    }

    async fn save(&self, state: &SyncState) -> Result<SyncState> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let by_local = Self::row_id_by(&tx, "local_id", state, state.local_id.as_ref())?;
        let by_remote = Self::row_id_by(&tx, "remote_id", state, state.remote_id.as_ref())?;
        let target = resolve_row(state, by_local, by_remote)?;

        let local_id = state.local_id.as_ref().map(ObjectId::encode);
        let remote_id = state.remote_id.as_ref().map(ObjectId::encode);
        let sync_time = state.sync_time.to_rfc3339();
        let local_pre = format_opt_time(state.local_pre_sync_modified);
        let local_post = format_opt_time(state.local_post_sync_modified);
        let remote_pre = format_opt_time(state.remote_pre_sync_modified);
        let remote_post = format_opt_time(state.remote_post_sync_modified);
        let status = state.status.code();

        let id = match target {
            Some(id) => {
                let changed = tx
                    .execute(
                        r#"
                        UPDATE sync_state SET
                            entity_type = ?1, profile_id = ?2, local_id = ?3, remote_id = ?4,
                            origin = ?5, sync_time = ?6,
                            local_pre_sync_modified = ?7, local_post_sync_modified = ?8,
                            remote_pre_sync_modified = ?9, remote_post_sync_modified = ?10,
                            status = ?11
                        WHERE id = ?12
                        "#,
                        params![
                            state.entity_type,
                            state.profile_id.0,
                            local_id,
                            remote_id,
                            state.origin.as_str(),
                            sync_time,
                            local_pre,
                            local_post,
                            remote_pre,
                            remote_post,
                            status,
                            id,
                        ],
                    )
                    .map_err(db_err)?;
                if changed == 0 {
                    return Err(Error::NotFound(format!("sync state {}", id)));
                }
                id
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO sync_state ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        STATE_COLUMNS
                    ),
                    params![
                        state.entity_type,
                        state.profile_id.0,
                        local_id,
                        remote_id,
                        state.origin.as_str(),
                        sync_time,
                        local_pre,
                        local_post,
                        remote_pre,
                        remote_post,
                        status,
                    ],
                )
                .map_err(db_err)?;
                tx.last_insert_rowid()
            }
        };
        tx.commit().map_err(db_err)?;
        debug!("Saved {} sync state {}", state.entity_type, id);

        let mut saved = state.clone();
        saved.id = Some(id);
        Ok(saved)
    }

    async fn list(&self, entity_type: &str, profile: ProfileId) -> Result<Vec<SyncState>> {
        let conn = self.conn()?;
        Self::query_states(
            &conn,
            "entity_type = ?1 AND profile_id = ?2",
            params![entity_type, profile.0],
        )
    }
}

#[async_trait]
impl DeletionLedger for SqliteSyncDb {
    async fn record(&self, entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT OR IGNORE INTO deletion_ledger (entity_type, profile_id, remote_id, deleted_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![entity_type, profile.0, remote_id.encode(), Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn contains(&self, entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> Result<bool> {
        let found: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT 1 FROM deletion_ledger WHERE entity_type = ?1 AND profile_id = ?2 AND remote_id = ?3",
                params![entity_type, profile.0, remote_id.encode()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn forget(&self, entity_type: &str, profile: ProfileId, remote_id: &ObjectId) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute(
                "DELETE FROM deletion_ledger WHERE entity_type = ?1 AND profile_id = ?2 AND remote_id = ?3",
                params![entity_type, profile.0, remote_id.encode()],
            )
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    async fn list(&self, profile: ProfileId) -> Result<Vec<DeletionEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT entity_type, remote_id, deleted_at FROM deletion_ledger
                WHERE profile_id = ?1 ORDER BY deleted_at
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![profile.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (entity_type, remote_id, deleted_at) = row.map_err(db_err)?;
            entries.push(DeletionEntry {
                entity_type,
                profile_id: profile,
                remote_id: ObjectId::decode(&remote_id)?,
                deleted_at: parse_time(&deleted_at)?,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl SettingsStore for SqliteSyncDb {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(db_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM settings WHERE key = ?1", [key])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{Eligibility, MapAndWriteStatus};

    fn state(local: i64, remote: &str) -> SyncState {
        let mut state = SyncState::new(
            "contact",
            ProfileId::default(),
            Side::Local,
            Outcome::MapAndWrite(MapAndWriteStatus::WroteNew),
        );
        state.local_id = Some(ObjectId::Int(local));
        state.remote_id = Some(ObjectId::text(remote).unwrap());
        state.local_post_sync_modified = Some(Utc::now());
        state
    }

    #[tokio::test]
    async fn test_sync_state_round_trip() {
        let db = SqliteSyncDb::in_memory().unwrap();
        let saved = db.save(&state(1, "p1")).await.unwrap();
        assert!(saved.id.is_some());

        let found = db
            .find_by_remote_id("contact", ProfileId::default(), &ObjectId::text("p1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.local_id, Some(ObjectId::Int(1)));
        assert_eq!(found.status, saved.status);
        assert_eq!(found.local_post_sync_modified, saved.local_post_sync_modified);
        assert!(found.remote_post_sync_modified.is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row() {
        let db = SqliteSyncDb::in_memory().unwrap();
        db.save(&state(1, "p1")).await.unwrap();

        let mut update = state(1, "p1");
        update.status = Outcome::Eligibility(Eligibility::NotNeeded);
        let saved = db.save(&update).await.unwrap();

        let all = SyncStateStore::list(&db, "contact", ProfileId::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, saved.id);
        assert_eq!(all[0].status, Outcome::Eligibility(Eligibility::NotNeeded));
    }

    #[tokio::test]
    async fn test_conflicting_links_are_refused() {
        let db = SqliteSyncDb::in_memory().unwrap();
        db.save(&state(1, "p1")).await.unwrap();
        db.save(&state(2, "p2")).await.unwrap();
        assert!(matches!(
            db.save(&state(1, "p2")).await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            db.save(&state(3, "p1")).await,
            Err(Error::AlreadyExists(_))
        ));
        let kept = db
            .find_by_remote_id("contact", ProfileId::default(), &ObjectId::text("p1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.local_id, Some(ObjectId::Int(1)));
    }

    #[tokio::test]
    async fn test_ledger() {
        let db = SqliteSyncDb::in_memory().unwrap();
        let id = ObjectId::text("t1").unwrap();
        let profile = ProfileId::default();
        db.record("tag", profile, &id).await.unwrap();
        db.record("tag", profile, &id).await.unwrap();
        assert!(db.contains("tag", profile, &id).await.unwrap());
        assert_eq!(DeletionLedger::list(&db, profile).await.unwrap().len(), 1);
        assert!(db.forget("tag", profile, &id).await.unwrap());
        assert!(!db.contains("tag", profile, &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_settings_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");
        {
            let db = SqliteSyncDb::open(&path).unwrap();
            db.set("lock.batch", "{}").await.unwrap();
        }
        let db = SqliteSyncDb::open(&path).unwrap();
        assert_eq!(db.get("lock.batch").await.unwrap().as_deref(), Some("{}"));
        assert!(db.remove("lock.batch").await.unwrap());
        assert!(db.get("lock.batch").await.unwrap().is_none());
    }
}
