// In restorer/src/store/restore_progress.rs

use crate::progress::{RestoreProgress, RestoreStatus};
use crate::Error;
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::convert::TryFrom;

// === Queries for the 'restore_progress' table ===

const COLUMNS: &str = "session_id, status, progress_percentage, current_step, total_items, processed_items, \
                       success_count, error_count, error_message, result_summary, created_at, updated_at";

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<RestoreProgress> {
    let status_raw: String = row.get(1)?;
    let status = RestoreStatus::try_from(status_raw.as_str()).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, err.into())
    })?;
    let percentage: i64 = row.get(2)?;
    let total_items: Option<i64> = row.get(4)?;
    let processed: i64 = row.get(5)?;
    let success: i64 = row.get(6)?;
    let errors: i64 = row.get(7)?;

    Ok(RestoreProgress {
        session_id: row.get(0)?,
        status,
        progress_percentage: percentage.clamp(0, 100) as u8,
        current_step: row.get(3)?,
        total_items: total_items.map(|value| value.max(0) as u64),
        processed_items: processed.max(0) as u64,
        success_count: success.max(0) as u64,
        error_count: errors.max(0) as u64,
        error_message: row.get(8)?,
        result_summary: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Inserts a new session row.
pub fn insert(conn: &Connection, progress: &RestoreProgress) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO restore_progress (session_id, status, progress_percentage, current_step, total_items,
                                       processed_items, success_count, error_count, error_message,
                                       result_summary, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            &progress.session_id,
            progress.status.as_str(),
            progress.progress_percentage,
            &progress.current_step,
            progress.total_items.map(to_i64),
            to_i64(progress.processed_items),
            to_i64(progress.success_count),
            to_i64(progress.error_count),
            &progress.error_message,
            &progress.result_summary,
            &progress.created_at,
            &progress.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, session_id: &str) -> Result<Option<RestoreProgress>, Error> {
    let progress = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM restore_progress WHERE session_id = ?1"),
            params![session_id],
            from_row,
        )
        .optional()?;
    Ok(progress)
}

/// Lists sessions, most recently created first.
pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<RestoreProgress>, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM restore_progress ORDER BY created_at DESC LIMIT ?1"
    ))?;
    let sessions = stmt
        .query_map(params![to_i64(limit as u64)], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sessions)
}

/// Sessions still `starting` or `processing` whose last write is older than
/// `cutoff`, most recently touched first.
pub fn list_stale(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<RestoreProgress>, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM restore_progress
         WHERE status IN ('starting', 'processing') AND julianday(updated_at) < julianday(?1)
         ORDER BY updated_at DESC LIMIT ?2"
    ))?;
    let sessions = stmt
        .query_map(params![&cutoff, to_i64(limit as u64)], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sessions)
}

/// Writes the non-terminal fields of a running session. Rows that already
/// reached a terminal status are left untouched.
pub fn save(conn: &Connection, progress: &RestoreProgress) -> Result<bool, Error> {
    let changed = conn.execute(
        "UPDATE restore_progress
         SET status = ?2, progress_percentage = ?3, current_step = ?4, total_items = ?5,
             processed_items = ?6, success_count = ?7, error_count = ?8, updated_at = ?9
         WHERE session_id = ?1 AND status IN ('starting', 'processing')",
        params![
            &progress.session_id,
            progress.status.as_str(),
            progress.progress_percentage,
            &progress.current_step,
            progress.total_items.map(to_i64),
            to_i64(progress.processed_items),
            to_i64(progress.success_count),
            to_i64(progress.error_count),
            &progress.updated_at,
        ],
    )?;
    Ok(changed > 0)
}

/// Performs the terminal transition carried by `progress.status`.
///
/// `completed` is only reachable from `processing`, `failed` from
/// `starting` or `processing`. Returns false when the row was not in an
/// allowed state, which makes a repeated finalize a no-op.
pub fn finalize(conn: &Connection, progress: &RestoreProgress) -> Result<bool, Error> {
    let allowed_from = match progress.status {
        RestoreStatus::Completed => "('processing')",
        RestoreStatus::Failed => "('starting', 'processing')",
        other => {
            return Err(Error::Api(format!(
                "{} is not a terminal status",
                other.as_str()
            )))
        }
    };

    let changed = conn.execute(
        &format!(
            "UPDATE restore_progress
             SET status = ?2, progress_percentage = ?3, current_step = ?4, total_items = ?5,
                 processed_items = ?6, success_count = ?7, error_count = ?8, error_message = ?9,
                 result_summary = ?10, updated_at = ?11
             WHERE session_id = ?1 AND status IN {allowed_from}"
        ),
        params![
            &progress.session_id,
            progress.status.as_str(),
            progress.progress_percentage,
            &progress.current_step,
            progress.total_items.map(to_i64),
            to_i64(progress.processed_items),
            to_i64(progress.success_count),
            to_i64(progress.error_count),
            &progress.error_message,
            &progress.result_summary,
            &progress.updated_at,
        ],
    )?;
    Ok(changed > 0)
}
