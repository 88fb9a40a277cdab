// In restorer/src/store/mod.rs

pub mod migrations;
pub mod restore_progress;

use std::path::Path;
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::{DbPool, Error};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_SIZE: u32 = 8;

/// Opens a pooled SQLite database in WAL mode so progress pollers can read
/// while a restore writes.
pub fn open_pool(path: &Path) -> Result<DbPool, Error> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
    });
    let pool = r2d2::Pool::builder().max_size(POOL_SIZE).build(manager)?;
    Ok(pool)
}

pub fn migrate_db(conn: &mut Connection) -> Result<(), Error> {
    let pending = migrations::pending(migrations::current_version(conn)?);
    if !pending.is_empty() {
        tracing::info!(scripts = ?pending, "applying schema migrations");
    }
    migrations::runner().to_latest(conn)?;
    tracing::debug!(version = migrations::latest_version(), "database schema is current");
    Ok(())
}

/// Opens the pool and brings the schema up to date.
pub fn open_and_migrate(path: &Path) -> Result<DbPool, Error> {
    let pool = open_pool(path)?;
    {
        let mut conn = pool.get()?;
        migrate_db(&mut conn)?;
    }
    Ok(pool)
}
