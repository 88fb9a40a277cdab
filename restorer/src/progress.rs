// restorer/src/progress.rs
//!
//! Progress tracking for restore sessions
//!
//! A restore session owns one `restore_progress` row. The running job keeps
//! the authoritative copy in memory and writes it back in batches; pollers
//! read the row from their own connections (the database runs in WAL mode,
//! so reads never wait for the job).

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use crate::store::restore_progress;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStatus {
    Starting,
    Processing,
    Completed,
    Failed,
}

impl RestoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStatus::Starting => "starting",
            RestoreStatus::Processing => "processing",
            RestoreStatus::Completed => "completed",
            RestoreStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RestoreStatus::Completed | RestoreStatus::Failed)
    }
}

impl TryFrom<&str> for RestoreStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "starting" => Ok(RestoreStatus::Starting),
            "processing" => Ok(RestoreStatus::Processing),
            "completed" => Ok(RestoreStatus::Completed),
            "failed" => Ok(RestoreStatus::Failed),
            other => Err(format!("unknown restore status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreProgress {
    pub session_id: String,
    pub status: RestoreStatus,
    pub progress_percentage: u8,
    pub current_step: String,
    /// Unknown until the snapshot has been read.
    pub total_items: Option<u64>,
    pub processed_items: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub error_message: Option<String>,
    pub result_summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RestoreProgress {
    pub fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            status: RestoreStatus::Starting,
            progress_percentage: 0,
            current_step: "Queued".to_string(),
            total_items: None,
            processed_items: 0,
            success_count: 0,
            error_count: 0,
            error_message: None,
            result_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `floor(100 * processed / total)`, clamped; 0 while the total is
    /// unknown and 100 once completed.
    pub fn percentage(&self) -> u8 {
        if self.status == RestoreStatus::Completed {
            return 100;
        }
        match self.total_items {
            Some(total) if total > 0 => (self.processed_items.saturating_mul(100) / total).min(100) as u8,
            _ => 0,
        }
    }

    /// A non-terminal session that has not been written for `max_age` most
    /// likely belongs to a job that died with its process.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        !self.is_terminal() && now.signed_duration_since(self.updated_at) > max_age
    }
}

/// Partial update of a session's progress. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub status: Option<RestoreStatus>,
    pub current_step: Option<String>,
    pub total_items: Option<u64>,
    pub processed_items: Option<u64>,
    pub success_count: Option<u64>,
    pub error_count: Option<u64>,
}

pub struct ProgressTracker {
    progress: RestoreProgress,
    flush_interval: u64,
    pending: u64,
}

impl ProgressTracker {
    /// Creates the session row in `starting` state.
    pub fn create(conn: &Connection, session_id: &str, flush_interval: u64) -> Result<Self, Error> {
        if restore_progress::get(conn, session_id)?.is_some() {
            return Err(Error::Api(format!(
                "restore session {session_id} already exists"
            )));
        }
        let progress = RestoreProgress::new(session_id);
        restore_progress::insert(conn, &progress)?;
        Ok(Self::from_progress(progress, flush_interval))
    }

    /// Picks up a session row created earlier.
    pub fn resume(conn: &Connection, session_id: &str, flush_interval: u64) -> Result<Self, Error> {
        let progress = restore_progress::get(conn, session_id)?.ok_or_else(|| {
            Error::Api(format!("restore session {session_id} not found"))
        })?;
        Ok(Self::from_progress(progress, flush_interval))
    }

    fn from_progress(progress: RestoreProgress, flush_interval: u64) -> Self {
        Self {
            progress,
            flush_interval: flush_interval.max(1),
            pending: 0,
        }
    }

    pub fn progress(&self) -> &RestoreProgress {
        &self.progress
    }

    pub fn session_id(&self) -> &str {
        &self.progress.session_id
    }

    /// Applies a partial update. Status, step and total changes are written
    /// immediately; count changes are written once per `flush_interval`.
    pub fn update(&mut self, conn: &Connection, update: ProgressUpdate) -> Result<(), Error> {
        if self.progress.is_terminal() {
            return Ok(());
        }

        let mut immediate = false;
        if let Some(status) = update.status {
            immediate |= status != self.progress.status;
            self.progress.status = status;
        }
        if let Some(step) = update.current_step {
            immediate |= step != self.progress.current_step;
            self.progress.current_step = step;
        }
        if let Some(total) = update.total_items {
            immediate |= Some(total) != self.progress.total_items;
            self.progress.total_items = Some(total);
        }
        let mut counted = false;
        if let Some(processed) = update.processed_items {
            // pollers must never see processed_items go backwards
            self.progress.processed_items = self.progress.processed_items.max(processed);
            counted = true;
        }
        if let Some(success) = update.success_count {
            self.progress.success_count = success;
            counted = true;
        }
        if let Some(errors) = update.error_count {
            self.progress.error_count = errors;
            counted = true;
        }
        self.progress.progress_percentage = self.progress.percentage();

        if counted {
            self.pending += 1;
        }
        if immediate || self.pending >= self.flush_interval {
            self.flush(conn)?;
        }
        Ok(())
    }

    pub fn step(&mut self, conn: &Connection, step: impl Into<String>) -> Result<(), Error> {
        self.update(
            conn,
            ProgressUpdate {
                current_step: Some(step.into()),
                ..ProgressUpdate::default()
            },
        )
    }

    /// Counts one processed record.
    pub fn record_outcome(&mut self, conn: &Connection, succeeded: bool) -> Result<(), Error> {
        let (success, errors) = if succeeded {
            (self.progress.success_count + 1, self.progress.error_count)
        } else {
            (self.progress.success_count, self.progress.error_count + 1)
        };
        self.update(
            conn,
            ProgressUpdate {
                processed_items: Some(self.progress.processed_items + 1),
                success_count: Some(success),
                error_count: Some(errors),
                ..ProgressUpdate::default()
            },
        )
    }

    /// Moves one failed record over to the successes.
    pub fn record_recovery(&mut self, conn: &Connection) -> Result<(), Error> {
        self.update(
            conn,
            ProgressUpdate {
                success_count: Some(self.progress.success_count + 1),
                error_count: Some(self.progress.error_count.saturating_sub(1)),
                ..ProgressUpdate::default()
            },
        )
    }

    pub fn flush(&mut self, conn: &Connection) -> Result<(), Error> {
        self.progress.updated_at = Utc::now();
        restore_progress::save(conn, &self.progress)?;
        self.pending = 0;
        Ok(())
    }

    /// `processing -> completed`. Returns false if the session was already
    /// terminal.
    pub fn complete(&mut self, conn: &Connection, summary: serde_json::Value) -> Result<bool, Error> {
        if self.progress.is_terminal() {
            return Ok(false);
        }
        let mut finished = self.progress.clone();
        finished.status = RestoreStatus::Completed;
        finished.progress_percentage = 100;
        finished.current_step = "Completed".to_string();
        finished.result_summary = Some(summary);
        self.finalize(conn, finished)
    }

    /// `starting | processing -> failed`. Returns false if the session was
    /// already terminal.
    pub fn fail(&mut self, conn: &Connection, message: &str) -> Result<bool, Error> {
        if self.progress.is_terminal() {
            return Ok(false);
        }
        let mut failed = self.progress.clone();
        failed.status = RestoreStatus::Failed;
        failed.current_step = "Failed".to_string();
        failed.error_message = Some(message.to_string());
        self.finalize(conn, failed)
    }

    fn finalize(&mut self, conn: &Connection, mut terminal: RestoreProgress) -> Result<bool, Error> {
        terminal.updated_at = Utc::now();
        let changed = restore_progress::finalize(conn, &terminal)?;
        if changed {
            self.progress = terminal;
        } else {
            tracing::warn!(
                session_id = %self.progress.session_id,
                status = terminal.status.as_str(),
                "terminal transition refused, session already finished or not started"
            );
            if let Some(current) = restore_progress::get(conn, &self.progress.session_id)? {
                self.progress = current;
            }
        }
        self.pending = 0;
        Ok(changed)
    }
}
