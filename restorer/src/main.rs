use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use restorer::{store, RestoreConfig, RestoreService, RestoreStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Restores exported snapshots into a SQLite database.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a restore and follow its progress until it finishes.
    Restore {
        /// Snapshot file (JSON, optionally gzip compressed).
        snapshot: PathBuf,
        /// Database file; defaults to the user data directory.
        #[arg(long)]
        db: Option<PathBuf>,
        /// Delete existing rows of the snapshot's types first.
        #[arg(long)]
        clear_existing: bool,
        #[arg(long)]
        session_id: Option<String>,
        /// TOML file with restore settings.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the progress record of a session as JSON.
    Progress {
        session: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List recent sessions, flagging the ones that look abandoned.
    Sessions {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .ok_or_else(|| anyhow!("no data directory available; pass --db"))?
        .join("restorer");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir.join("restorer.sqlite"))
}

fn open_service(db: Option<PathBuf>, config: Option<&Path>) -> Result<RestoreService> {
    let db_path = match db {
        Some(path) => path,
        None => default_db_path()?,
    };
    let config = match config {
        Some(path) => RestoreConfig::load_from_path(path)?,
        None => RestoreConfig::default(),
    };
    let pool = store::open_and_migrate(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    Ok(RestoreService::new(pool, config))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Restore {
            snapshot,
            db,
            clear_existing,
            session_id,
            config,
        } => {
            let service = open_service(db, config.as_deref())?;
            let session_id = service.start_restore(&snapshot, clear_existing, session_id)?;
            println!("session {session_id}");

            let mut last_line = String::new();
            let progress = loop {
                let progress = service
                    .get_progress(&session_id)?
                    .ok_or_else(|| anyhow!("session {session_id} disappeared"))?;
                let line = format!(
                    "[{:>3}%] {} ({}/{} ok, {} failed)",
                    progress.progress_percentage,
                    progress.current_step,
                    progress.success_count,
                    progress
                        .total_items
                        .map(|total| total.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    progress.error_count
                );
                if line != last_line {
                    println!("{line}");
                    last_line = line;
                }
                if progress.is_terminal() {
                    break progress;
                }
                thread::sleep(POLL_INTERVAL);
            };
            service.wait(&session_id)?;

            if let Some(summary) = &progress.result_summary {
                println!("{}", serde_json::to_string_pretty(summary)?);
            }
            if progress.status == RestoreStatus::Failed {
                return Err(anyhow!(
                    "restore failed: {}",
                    progress.error_message.unwrap_or_default()
                ));
            }
        }
        Command::Progress { session, db } => {
            let service = open_service(db, None)?;
            let progress = service
                .get_progress(&session)?
                .ok_or_else(|| anyhow!("no restore session {session}"))?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Command::Sessions { db, limit, config } => {
            let service = open_service(db, config.as_deref())?;
            let stale: Vec<String> = service
                .stale_sessions(limit)?
                .into_iter()
                .map(|progress| progress.session_id)
                .collect();
            for progress in service.list_sessions(limit)? {
                let marker = if stale.contains(&progress.session_id) {
                    " (stale)"
                } else {
                    ""
                };
                println!(
                    "{}  {:<10} {:>3}%  {}{}",
                    progress.session_id,
                    progress.status.as_str(),
                    progress.progress_percentage,
                    progress.updated_at.to_rfc3339(),
                    marker
                );
            }
        }
    }

    Ok(())
}
