// restorer/src/store/migrations.rs
//!
//! Schema scripts, applied in order. The applied count lives in SQLite's
//! `user_version`, so script N is recorded as version N.

use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

use crate::Error;

struct Script {
    name: &'static str,
    sql: &'static str,
}

const SCRIPTS: &[Script] = &[Script {
    name: "initial_schema",
    sql: include_str!("migrations/V1__initial_schema.sql"),
}];

pub fn runner() -> Migrations<'static> {
    Migrations::new(SCRIPTS.iter().map(|script| M::up(script.sql)).collect())
}

/// Version the database reaches once every script has run.
pub fn latest_version() -> i64 {
    SCRIPTS.len() as i64
}

pub fn current_version(conn: &Connection) -> Result<i64, Error> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Names of the scripts a database at `version` has not run yet.
pub fn pending(version: i64) -> Vec<&'static str> {
    let applied = usize::try_from(version.max(0)).unwrap_or(usize::MAX);
    SCRIPTS
        .iter()
        .skip(applied)
        .map(|script| script.name)
        .collect()
}
