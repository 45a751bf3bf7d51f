//! Mirrorsync CLI - inspection and maintenance of sync bookkeeping.
//!
//! Works on the SQLite database named by the configuration: sync states,
//! the deletion ledger, match caches and the batch process lock.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mirrorsync_common::{ObjectId, Side};
use mirrorsync_sync::{
    DeletionLedger, MatchCache, ProcessLock, SettingsStore, SqliteSyncDb, SyncConfig,
    SyncStateStore,
};

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(about = "Mirrorsync - local/remote object synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or release the batch process lock.
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Inspect persisted sync states.
    States {
        #[command(subcommand)]
        action: StatesAction,
    },

    /// Inspect or edit the deletion ledger.
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },

    /// Maintain match caches.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Create or print the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Show holder, liveness and whether the last run crashed.
    Status,
    /// Clear the holder, e.g. after a crashed run.
    Release,
}

#[derive(Subcommand)]
enum StatesAction {
    /// List all sync states of an entity type.
    List {
        /// Entity type, e.g. "contact".
        #[arg(short, long)]
        entity: String,
    },
    /// Show the sync state of one object.
    Show {
        #[arg(short, long)]
        entity: String,

        /// Local id.
        #[arg(long, conflicts_with = "remote_id", required_unless_present = "remote_id")]
        local_id: Option<String>,

        /// Remote id.
        #[arg(long)]
        remote_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum LedgerAction {
    /// List tombstones of the configured profile.
    List,
    /// Remove a tombstone so the remote object can be synced again.
    Forget {
        #[arg(short, long)]
        entity: String,

        /// Remote id.
        remote_id: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Empty the shared match cache of an entity type.
    Clear {
        #[arg(short, long)]
        entity: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => SyncConfig::default_path().context("Failed to locate configuration")?,
    };

    match cli.command {
        Commands::Lock { action } => cmd_lock(&config_path, action).await,
        Commands::States { action } => cmd_states(&config_path, action).await,
        Commands::Ledger { action } => cmd_ledger(&config_path, action).await,
        Commands::Cache { action } => cmd_cache(&config_path, action).await,
        Commands::Config { action } => cmd_config(&config_path, action),
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "mirrorsync", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Load the configuration and open its database.
fn open(config_path: &Path) -> Result<(SyncConfig, Arc<SqliteSyncDb>)> {
    let config = SyncConfig::load_or_default(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let db = SqliteSyncDb::open(&config.database_path)
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
    Ok((config, Arc::new(db)))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_id(side: Side, raw: &str) -> Result<ObjectId> {
    let id = match (side, raw.parse::<i64>()) {
        (Side::Local, Ok(id)) => ObjectId::Int(id),
        _ => ObjectId::text(raw)?,
    };
    Ok(id)
}

/// Show or release the batch lock.
async fn cmd_lock(config_path: &Path, action: LockAction) -> Result<()> {
    let (config, db) = open(config_path)?;
    let settings: Arc<dyn SettingsStore> = db;
    let lock = ProcessLock::new(config.lock_name.clone(), settings);

    match action {
        LockAction::Status => {
            let status = lock.status().await.context("Failed to read lock")?;
            if status.previous_run_crashed {
                warn!("Previous run of '{}' ended without releasing the lock", status.name);
            }
            print_json(&status)
        }
        LockAction::Release => {
            let status = lock.status().await.context("Failed to read lock")?;
            if status.held {
                anyhow::bail!(
                    "Lock '{}' is held by live process {:?}",
                    status.name,
                    status.record.holder_pid
                );
            }
            lock.release().await.context("Failed to release lock")?;
            println!("Lock '{}' released.", lock.name());
            Ok(())
        }
    }
}

/// List or show sync states.
async fn cmd_states(config_path: &Path, action: StatesAction) -> Result<()> {
    let (config, db) = open(config_path)?;
    let profile = config.profile_id;

    match action {
        StatesAction::List { entity } => {
            let states = SyncStateStore::list(db.as_ref(), &entity, profile)
                .await
                .context("Failed to list sync states")?;
            if states.is_empty() {
                println!("No {} sync states for profile {}.", entity, profile);
                return Ok(());
            }
            for state in states {
                println!(
                    "{:>6}  local {:<12} remote {:<38} {}  {}",
                    state.id.unwrap_or_default(),
                    state.local_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    state.remote_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    state.sync_time.format("%Y-%m-%d %H:%M:%S"),
                    state.status
                );
            }
            Ok(())
        }
        StatesAction::Show {
            entity,
            local_id,
            remote_id,
        } => {
            let (side, raw) = match (local_id, remote_id) {
                (Some(raw), _) => (Side::Local, raw),
                (None, Some(raw)) => (Side::Remote, raw),
                (None, None) => anyhow::bail!("Pass --local-id or --remote-id"),
            };
            let id = parse_id(side, &raw)?;
            let state = db
                .find_by_id_on(side, &entity, profile, &id)
                .await
                .context("Failed to look up sync state")?;
            match state {
                Some(state) => print_json(&state),
                None => anyhow::bail!("No {} sync state for {} id {}", entity, side, id),
            }
        }
    }
}

/// List or edit the deletion ledger.
async fn cmd_ledger(config_path: &Path, action: LedgerAction) -> Result<()> {
    let (config, db) = open(config_path)?;
    let profile = config.profile_id;

    match action {
        LedgerAction::List => {
            let entries = DeletionLedger::list(db.as_ref(), profile)
                .await
                .context("Failed to list deletion ledger")?;
            if entries.is_empty() {
                println!("Deletion ledger is empty.");
            }
            for entry in entries {
                println!(
                    "{:<12} {:<38} {}",
                    entry.entity_type,
                    entry.remote_id,
                    entry.deleted_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        LedgerAction::Forget { entity, remote_id } => {
            let id = parse_id(Side::Remote, &remote_id)?;
            if db
                .forget(&entity, profile, &id)
                .await
                .context("Failed to edit deletion ledger")?
            {
                info!("Forgot deletion of {} {}", entity, id);
                println!("Removed {} {} from the deletion ledger.", entity, id);
            } else {
                println!("{} {} is not in the deletion ledger.", entity, id);
            }
            Ok(())
        }
    }
}

/// Clear a shared match cache.
async fn cmd_cache(config_path: &Path, action: CacheAction) -> Result<()> {
    let (config, db) = open(config_path)?;

    match action {
        CacheAction::Clear { entity } => {
            let settings: Arc<dyn SettingsStore> = db;
            MatchCache::new(entity.clone(), config.profile_id)
                .with_settings(settings)
                .clear()
                .await
                .context("Failed to clear match cache")?;
            println!(
                "Cleared {} match cache. Running syncers keep their copy until they refresh.",
                entity
            );
            Ok(())
        }
    }
}

/// Write or print the configuration.
fn cmd_config(config_path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists, pass --force to overwrite",
                    config_path.display()
                );
            }
            SyncConfig::default()
                .save(config_path)
                .context("Failed to write configuration")?;
            println!("Configuration written to {}", config_path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = SyncConfig::load_or_default(config_path)
                .with_context(|| format!("Failed to load {}", config_path.display()))?;
            println!("# {}", config_path.display());
            print_json(&config)
        }
    }
}
