// restorer/src/orchestrator.rs
use crate::apply::{ApplyError, RecordApplier};
use crate::config::{ConstraintMode, RestoreConfig};
use crate::progress::{ProgressTracker, ProgressUpdate, RestoreProgress, RestoreStatus};
use crate::purge::{self, ProtectedTypes, PurgeError, PurgedType};
use crate::registry::EntityRegistry;
use crate::snapshot::{RecordSlot, SnapshotReader};
use crate::store::restore_progress;
use crate::{DbPool, Error};
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestorePhase {
    Reading,
    Purging,
    Applying,
    Summarizing,
    Completed,
    Failed,
}

impl RestorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorePhase::Reading => "reading",
            RestorePhase::Purging => "purging",
            RestorePhase::Applying => "applying",
            RestorePhase::Summarizing => "summarizing",
            RestorePhase::Completed => "completed",
            RestorePhase::Failed => "failed",
        }
    }

    fn step(&self) -> &'static str {
        match self {
            RestorePhase::Reading => "Reading snapshot",
            RestorePhase::Purging => "Clearing existing data",
            RestorePhase::Applying => "Restoring records",
            RestorePhase::Summarizing => "Summarizing",
            RestorePhase::Completed => "Completed",
            RestorePhase::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub snapshot_path: PathBuf,
    pub clear_existing: bool,
}

/// Final report of a restore, stored on the progress record as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub session_id: String,
    pub total_items: u64,
    pub processed_items: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Records whose type is not registered; not part of `total_items`.
    pub skipped_items: u64,
    pub unresolvable_types: Vec<String>,
    pub success_rate: f64,
    pub insert_order: Vec<String>,
    pub purged: Vec<PurgedType>,
    pub purge_errors: Vec<PurgeError>,
    pub protected_skipped: Vec<String>,
    pub recovered_on_second_pass: u64,
    pub placeholders_created: u64,
    /// First `error_report_limit` final failures, in processing order.
    pub errors: Vec<ApplyError>,
    pub dangling_references: u64,
    pub snapshot_sha256: String,
    pub compressed: bool,
    pub duration_ms: u64,
}

/// Relaxed foreign-key enforcement on one connection. Strict enforcement
/// is put back when the window is dropped, including during unwinding.
struct ConstraintWindow<'c> {
    conn: &'c Connection,
}

impl<'c> ConstraintWindow<'c> {
    fn open(conn: &'c Connection, mode: ConstraintMode) -> Result<Self, Error> {
        if mode == ConstraintMode::Disabled {
            conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        }
        tracing::debug!(mode = ?mode, "constraint window opened");
        Ok(Self { conn })
    }
}

impl Drop for ConstraintWindow<'_> {
    fn drop(&mut self) {
        if let Err(err) = self
            .conn
            .execute_batch("PRAGMA defer_foreign_keys = OFF; PRAGMA foreign_keys = ON;")
        {
            tracing::error!(error = %err, "failed to restore foreign key enforcement");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs one restore: read, optional purge, apply in dependency order,
/// second pass, summary.
pub struct RestoreOrchestrator<'a> {
    registry: &'a EntityRegistry,
    config: &'a RestoreConfig,
    cancel: &'a AtomicBool,
    window: &'a Mutex<()>,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(
        registry: &'a EntityRegistry,
        config: &'a RestoreConfig,
        cancel: &'a AtomicBool,
        window: &'a Mutex<()>,
    ) -> Self {
        Self {
            registry,
            config,
            cancel,
            window,
        }
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn enter(
        &self,
        conn: &Connection,
        tracker: &mut ProgressTracker,
        phase: RestorePhase,
    ) -> Result<(), Error> {
        tracing::info!(session_id = %tracker.session_id(), phase = phase.as_str(), "restore phase");
        tracker.step(conn, phase.step())
    }

    /// Drives the session owned by `tracker` to `completed`. Errors are
    /// returned without finalizing; the caller marks the session failed.
    pub fn run(
        &self,
        conn: &Connection,
        tracker: &mut ProgressTracker,
        request: &RestoreRequest,
    ) -> Result<RestoreSummary, Error> {
        let started = Instant::now();
        let session_id = tracker.session_id().to_string();

        tracker.update(
            conn,
            ProgressUpdate {
                status: Some(RestoreStatus::Processing),
                current_step: Some(RestorePhase::Reading.step().to_string()),
                ..ProgressUpdate::default()
            },
        )?;

        let mut last_read_pct = None;
        let snapshot = SnapshotReader::new(self.config).open(&request.snapshot_path, |read| {
            self.check_cancelled()?;
            if read.total_bytes == 0 {
                return Ok(());
            }
            let pct = (read.bytes_read.saturating_mul(100) / read.total_bytes).min(100);
            if last_read_pct != Some(pct) {
                last_read_pct = Some(pct);
                tracker.step(conn, format!("{} ({pct}%)", RestorePhase::Reading.step()))?;
            }
            Ok(())
        })?;

        let mut slots_by_type: HashMap<&str, Vec<&RecordSlot>> = HashMap::new();
        let mut skipped_items = 0u64;
        for slot in snapshot.slots() {
            if self.registry.contains(&slot.entity_type) {
                slots_by_type.entry(slot.entity_type.as_str()).or_default().push(slot);
            } else {
                skipped_items += 1;
            }
        }
        let (resolvable, unresolvable): (Vec<String>, Vec<String>) = snapshot
            .distinct_types()
            .into_iter()
            .partition(|entity_type| self.registry.contains(entity_type));
        for entity_type in &unresolvable {
            tracing::warn!(session_id = %session_id, entity_type = %entity_type, "skipping records of unregistered type");
        }

        let order = self.registry.order(&resolvable);
        let total_items = snapshot.len() as u64 - skipped_items;
        tracker.update(
            conn,
            ProgressUpdate {
                total_items: Some(total_items),
                ..ProgressUpdate::default()
            },
        )?;
        tracing::info!(
            session_id = %session_id,
            total_items,
            skipped_items,
            types = order.insert_order.len(),
            "snapshot ready"
        );

        let window_lock = lock(self.window);

        let mut purge_report = purge::PurgeReport::default();
        if request.clear_existing {
            self.check_cancelled()?;
            self.enter(conn, tracker, RestorePhase::Purging)?;
            // protected rows may keep pointing at identities purged here;
            // they show up in the dangling reference count
            let _purge_window = ConstraintWindow::open(conn, ConstraintMode::Disabled)?;
            let protected = ProtectedTypes::with_extra(self.config.extra_protected_types.iter().cloned());
            purge_report = purge::purge(conn, self.registry, &order.delete_order, &protected);
        }

        let window = ConstraintWindow::open(conn, self.config.constraint_mode)?;
        self.enter(conn, tracker, RestorePhase::Applying)?;
        let applier = RecordApplier::new(self.registry, self.config);
        let mut placeholders_created = 0u64;
        let mut failures: Vec<(&RecordSlot, ApplyError)> = Vec::new();

        for entity_type in &order.insert_order {
            let Some(slots) = slots_by_type.get(entity_type.as_str()) else {
                continue;
            };
            for &slot in slots {
                self.check_cancelled()?;
                let record = snapshot.decode(slot)?;
                match applier.apply(conn, &record) {
                    Ok(applied) => {
                        placeholders_created += u64::from(applied.placeholders);
                        tracker.record_outcome(conn, true)?;
                    }
                    Err(err) => {
                        tracker.record_outcome(conn, false)?;
                        failures.push((slot, err));
                    }
                }
            }
        }

        let mut recovered_on_second_pass = 0u64;
        let final_errors: Vec<ApplyError> = if self.config.enable_second_pass && !failures.is_empty() {
            tracker.step(conn, format!("Retrying {} failed records", failures.len()))?;
            let mut remaining = Vec::new();
            for (slot, _) in failures {
                self.check_cancelled()?;
                // decoded again from the snapshot bytes
                let record = snapshot.decode(slot)?;
                match applier.apply(conn, &record) {
                    Ok(applied) => {
                        placeholders_created += u64::from(applied.placeholders);
                        recovered_on_second_pass += 1;
                        tracker.record_recovery(conn)?;
                    }
                    Err(err) => remaining.push(err),
                }
            }
            remaining
        } else {
            failures.into_iter().map(|(_, err)| err).collect()
        };

        drop(window);
        let dangling_references = count_dangling_references(conn)?;
        drop(window_lock);
        if dangling_references > 0 {
            tracing::warn!(session_id = %session_id, dangling_references, "restored data has dangling references");
        }

        self.enter(conn, tracker, RestorePhase::Summarizing)?;
        let progress = tracker.progress();
        let success_rate = if total_items == 0 {
            1.0
        } else {
            progress.success_count as f64 / total_items as f64
        };
        let source = snapshot.source();
        let summary = RestoreSummary {
            session_id: session_id.clone(),
            total_items,
            processed_items: progress.processed_items,
            success_count: progress.success_count,
            error_count: progress.error_count,
            skipped_items,
            unresolvable_types: unresolvable,
            success_rate,
            insert_order: order.insert_order.clone(),
            purged: purge_report.deleted,
            purge_errors: purge_report.errors,
            protected_skipped: purge_report.skipped_protected,
            recovered_on_second_pass,
            placeholders_created,
            errors: final_errors
                .into_iter()
                .take(self.config.error_report_limit)
                .collect(),
            dangling_references,
            snapshot_sha256: source.sha256.clone(),
            compressed: source.compressed,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if !tracker.complete(conn, serde_json::to_value(&summary)?)? {
            tracing::warn!(session_id = %session_id, "session was finished elsewhere before completion");
        }
        tracing::info!(
            session_id = %session_id,
            success = summary.success_count,
            errors = summary.error_count,
            recovered = recovered_on_second_pass,
            duration_ms = summary.duration_ms,
            "restore completed"
        );
        Ok(summary)
    }
}

fn count_dangling_references(conn: &Connection) -> Result<u64, Error> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt
        .query_map([], |_| Ok(()))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.len() as u64)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Everything a job thread needs, cheap to clone.
#[derive(Clone)]
struct JobContext {
    pool: DbPool,
    registry: Arc<EntityRegistry>,
    config: Arc<RestoreConfig>,
    window: Arc<Mutex<()>>,
}

impl JobContext {
    /// Runs the session to a terminal state. Any error, including a panic
    /// inside the pipeline, marks the session failed.
    fn execute(
        &self,
        session_id: &str,
        request: &RestoreRequest,
        cancel: &AtomicBool,
    ) -> Result<RestoreSummary, Error> {
        let conn = self.pool.get()?;
        let mut tracker =
            ProgressTracker::resume(&conn, session_id, self.config.progress_flush_interval)?;
        let orchestrator =
            RestoreOrchestrator::new(&self.registry, &self.config, cancel, &self.window);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            orchestrator.run(&conn, &mut tracker, request)
        }))
        .unwrap_or_else(|payload| {
            Err(Error::Api(format!(
                "restore job panicked: {}",
                panic_message(&*payload)
            )))
        });

        if let Err(err) = &result {
            tracing::error!(session_id, error = %err, "restore failed");
            if let Err(mark_err) = tracker.fail(&conn, &err.to_string()) {
                tracing::error!(session_id, error = %mark_err, "could not mark session failed");
            }
        }
        result
    }
}

/// Entry point for triggering, observing and cancelling restores.
pub struct RestoreService {
    ctx: JobContext,
    cancel_flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    jobs: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RestoreService {
    /// A service over the built-in entity registry.
    pub fn new(pool: DbPool, config: RestoreConfig) -> Self {
        Self::with_registry(pool, EntityRegistry::builtin().clone(), config)
    }

    pub fn with_registry(pool: DbPool, registry: EntityRegistry, config: RestoreConfig) -> Self {
        Self {
            ctx: JobContext {
                pool,
                registry: Arc::new(registry),
                config: Arc::new(config),
                window: Arc::new(Mutex::new(())),
            },
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.ctx.config
    }

    fn register(&self, session_id: Option<String>) -> Result<(String, Arc<AtomicBool>), Error> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let conn = self.ctx.pool.get()?;
        ProgressTracker::create(&conn, &session_id, self.ctx.config.progress_flush_interval)?;
        let cancel = Arc::new(AtomicBool::new(false));
        lock(&self.cancel_flags).insert(session_id.clone(), cancel.clone());
        Ok((session_id, cancel))
    }

    /// Creates the session in `starting` state and runs it on a background
    /// thread. Returns the session id right away.
    pub fn start_restore(
        &self,
        snapshot_path: impl Into<PathBuf>,
        clear_existing: bool,
        session_id: Option<String>,
    ) -> Result<String, Error> {
        let (session_id, cancel) = self.register(session_id)?;
        let request = RestoreRequest {
            snapshot_path: snapshot_path.into(),
            clear_existing,
        };

        let ctx = self.ctx.clone();
        let flags = self.cancel_flags.clone();
        let jobs = self.jobs.clone();
        let job_id = session_id.clone();
        // held until the handle is stored, so a fast job cannot try to
        // remove its entry before it exists
        let mut running = lock(&self.jobs);
        let spawned = thread::Builder::new()
            .name(format!("restore-{session_id}"))
            .spawn(move || {
                // outcome is recorded on the progress row
                let _ = ctx.execute(&job_id, &request, &cancel);
                lock(&flags).remove(&job_id);
                lock(&jobs).remove(&job_id);
            });

        match spawned {
            Ok(handle) => {
                running.insert(session_id.clone(), handle);
                drop(running);
                tracing::info!(session_id = %session_id, "restore started");
                Ok(session_id)
            }
            Err(err) => {
                drop(running);
                lock(&self.cancel_flags).remove(&session_id);
                let conn = self.ctx.pool.get()?;
                let mut tracker = ProgressTracker::resume(
                    &conn,
                    &session_id,
                    self.ctx.config.progress_flush_interval,
                )?;
                tracker.fail(&conn, &format!("could not start restore job: {err}"))?;
                Err(err.into())
            }
        }
    }

    /// Runs a restore on the calling thread.
    pub fn run_restore(
        &self,
        snapshot_path: impl Into<PathBuf>,
        clear_existing: bool,
        session_id: Option<String>,
    ) -> Result<RestoreSummary, Error> {
        let (session_id, cancel) = self.register(session_id)?;
        let request = RestoreRequest {
            snapshot_path: snapshot_path.into(),
            clear_existing,
        };
        let result = self.ctx.execute(&session_id, &request, &cancel);
        lock(&self.cancel_flags).remove(&session_id);
        result
    }

    pub fn get_progress(&self, session_id: &str) -> Result<Option<RestoreProgress>, Error> {
        let conn = self.ctx.pool.get()?;
        restore_progress::get(&conn, session_id)
    }

    pub fn list_sessions(&self, limit: usize) -> Result<Vec<RestoreProgress>, Error> {
        let conn = self.ctx.pool.get()?;
        restore_progress::list_recent(&conn, limit)
    }

    /// Sessions that are still open but have not been written for
    /// `stale_after_secs`. They are reported, never modified.
    pub fn stale_sessions(&self, limit: usize) -> Result<Vec<RestoreProgress>, Error> {
        let max_age = chrono::Duration::seconds(self.ctx.config.stale_after_secs as i64);
        let conn = self.ctx.pool.get()?;
        restore_progress::list_stale(&conn, Utc::now() - max_age, limit)
    }

    /// Asks a running job to stop. Returns false when no job with that id
    /// is running in this process.
    pub fn cancel_restore(&self, session_id: &str) -> bool {
        match lock(&self.cancel_flags).get(session_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                tracing::info!(session_id, "restore cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Ids of background jobs whose threads have not exited yet.
    pub fn running_jobs(&self) -> Vec<String> {
        lock(&self.jobs).keys().cloned().collect()
    }

    /// Blocks until the background job for `session_id` has finished.
    pub fn wait(&self, session_id: &str) -> Result<(), Error> {
        let handle = lock(&self.jobs).remove(session_id);
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| Error::Api(format!("restore job {session_id} panicked")))?;
        }
        Ok(())
    }
}
