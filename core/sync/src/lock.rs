//! Whole-batch process lock.
//!
//! The holder is identified by process id. A lock whose holder is no longer
//! running is free, so a crashed run never blocks later ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use mirrorsync_common::{Error, Result};

/// Small key/value store for process-wide settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// # Returns
    /// `false` if the key was not set.
    async fn remove(&self, key: &str) -> Result<bool>;
}

/// In-memory settings store.
#[derive(Default)]
pub struct MemorySettingsStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| Error::Storage("settings store poisoned".to_string()))
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.values()?.remove(key).is_some())
    }
}

/// Operating system process lookup.
pub trait ProcessProbe: Send + Sync {
    fn current_pid(&self) -> u32;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the host's process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_process(Pid::from_u32(pid))
    }
}

/// Persisted lock state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Process id of the current holder.
    pub holder_pid: Option<u32>,
    pub acquired_at: Option<DateTime<Utc>>,
    /// When the last holder released. Unset after an acquire.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Diagnostic view of a lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockStatus {
    pub name: String,
    pub record: LockRecord,
    /// A live process holds the lock.
    pub held: bool,
    pub holder_alive: bool,
    /// A holder was recorded, it is gone, and it never released.
    pub previous_run_crashed: bool,
}

/// Named lock serializing batch sync runs.
pub struct ProcessLock {
    name: String,
    settings: Arc<dyn SettingsStore>,
    probe: Arc<dyn ProcessProbe>,
}

impl ProcessLock {
    /// Lock using the host's process table.
    pub fn new(name: impl Into<String>, settings: Arc<dyn SettingsStore>) -> Self {
        Self::with_probe(name, settings, Arc::new(SystemProbe))
    }

    pub fn with_probe(
        name: impl Into<String>,
        settings: Arc<dyn SettingsStore>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            probe,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> String {
        format!("lock.{}", self.name)
    }

    async fn read(&self) -> Result<LockRecord> {
        match self.settings.get(&self.key()).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(LockRecord::default()),
        }
    }

    async fn write(&self, record: &LockRecord) -> Result<()> {
        self.settings
            .set(&self.key(), &serde_json::to_string(record)?)
            .await
    }

    /// Current lock state.
    pub async fn status(&self) -> Result<LockStatus> {
        let record = self.read().await?;
        let holder_alive = record.holder_pid.is_some_and(|pid| self.probe.is_alive(pid));
        let previous_run_crashed =
            record.holder_pid.is_some() && !holder_alive && record.completed_at.is_none();
        Ok(LockStatus {
            name: self.name.clone(),
            held: holder_alive,
            holder_alive,
            previous_run_crashed,
            record,
        })
    }

    /// Try to take the lock.
    ///
    /// # Returns
    /// `false` if a live process (this one included) holds it.
    pub async fn acquire(&self) -> Result<bool> {
        let status = self.status().await?;
        if status.held {
            warn!(
                "Lock '{}' is held by live process {:?}",
                self.name, status.record.holder_pid
            );
            return Ok(false);
        }
        if status.previous_run_crashed {
            warn!(
                "Previous holder {:?} of lock '{}' exited without releasing it",
                status.record.holder_pid, self.name
            );
        }

        let pid = self.probe.current_pid();
        self.write(&LockRecord {
            holder_pid: Some(pid),
            acquired_at: Some(Utc::now()),
            completed_at: None,
        })
        .await?;
        info!("Acquired lock '{}' (pid {})", self.name, pid);
        Ok(true)
    }

    /// Clear the holder and record completion.
    pub async fn release(&self) -> Result<()> {
        let mut record = self.read().await?;
        record.holder_pid = None;
        record.completed_at = Some(Utc::now());
        self.write(&record).await?;
        debug!("Released lock '{}'", self.name);
        Ok(())
    }
}
