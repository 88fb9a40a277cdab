// In restorer/src/tests.rs
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crate::{
    config::{ConstraintMode, MissingReferencePolicy},
    progress::RestoreProgress,
    provenance,
    registry::{ColumnDef, ColumnKind, EntityDef, EntityRegistry},
    store::{self, restore_progress},
    DbPool, Error, RestoreConfig, RestoreService, RestoreStatus,
};
use anyhow::{anyhow, Result};
use flate2::{write::GzEncoder, Compression};
use rusqlite::params;
use serde_json::{json, Value};
use tempfile::TempDir;

fn setup_pool(dir: &TempDir) -> Result<DbPool> {
    let pool = store::open_and_migrate(&dir.path().join("restore.sqlite"))?;
    {
        let conn = pool.get()?;
        let recorded: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        assert_eq!(recorded, store::migrations::latest_version());
    }
    Ok(pool)
}

fn write_snapshot(dir: &TempDir, name: &str, records: &Value) -> Result<PathBuf> {
    let path = dir.path().join(name);
    std::fs::write(&path, serde_json::to_vec(records)?)?;
    Ok(path)
}

fn count(pool: &DbPool, table: &str) -> Result<i64> {
    let conn = pool.get()?;
    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
}

/// A small shop: category 2 points forward at category 3, and order line 2
/// points at a product that never appears.
fn shop_snapshot() -> Value {
    json!([
        {"model": "auth.user", "pk": 1, "fields": {"username": "ada", "email": "ada@example.com", "active": "yes"}},
        {"model": "auth.user", "pk": 2, "fields": {"username": "grace", "is_staff": "true"}},
        {"model": "core.organization", "pk": 10, "fields": {"name": "Acme", "owner": 1, "created_at": "2023-05-01T09:00:00Z"}},
        {"model": "core.membership", "pk": 1, "fields": {"organization": 10, "user": 2, "role": "admin"}},
        {"model": "catalog.category", "pk": 2, "fields": {"organization": 10, "parent": 3, "name": "Teas"}},
        {"model": "catalog.category", "pk": 3, "fields": {"organization": 10, "parent": null, "name": "Drinks"}},
        {"model": "catalog.product", "pk": 100, "fields": {"category": 2, "name": "Sencha", "price": "4.50", "available": "on"}},
        {"model": "sales.customer", "pk": 5, "fields": {"organization": 10, "name": "Bob", "phone_number": "555-0100", "created_at": "2024-01-02T03:04:05Z"}},
        {"model": "sales.order", "pk": 50, "fields": {"customer": 5, "placed_at": "2024-01-03T10:00:00Z", "status": "paid", "total": 9.0}},
        {"model": "sales.orderline", "pk": 1, "fields": {"order": 50, "product": 100, "quantity": 2, "unit_price": 4.5}},
        {"model": "sales.orderline", "pk": 2, "fields": {"order": 50, "product": 999, "quantity": 1, "unit_price": 1.0}},
        {"model": "integrations.connection", "pk": 7, "fields": {"organization": 10, "provider": "shopify", "status": "Connected", "config": {"shop": "acme"}}},
        {"model": "sessions.session", "pk": "abc123", "fields": {"session_data": "e30=", "expire_date": "2030-01-01T00:00:00Z"}}
    ])
}

fn wait_for_terminal(service: &RestoreService, session_id: &str) -> Result<RestoreProgress> {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let progress = service
            .get_progress(session_id)?
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;
        if progress.is_terminal() {
            return Ok(progress);
        }
        if Instant::now() > deadline {
            return Err(anyhow!("session {session_id} did not finish: {progress:?}"));
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn restore_accounts_for_every_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(&dir, "shop.json", &shop_snapshot())?;
    let service = RestoreService::new(pool.clone(), RestoreConfig::default());

    let summary = service.run_restore(&snapshot, false, Some("shop".into()))?;

    assert_eq!(summary.total_items, 13);
    assert_eq!(summary.success_count + summary.error_count, summary.total_items);
    assert_eq!(summary.processed_items, summary.total_items);
    assert_eq!(summary.success_count, 12);
    assert_eq!(summary.error_count, 1);
    // category 2, the product under it and order line 1 all recover
    assert_eq!(summary.recovered_on_second_pass, 3);
    assert_eq!(summary.dangling_references, 0);
    assert!((summary.success_rate - 12.0 / 13.0).abs() < 1e-9);
    assert_eq!(summary.insert_order.first().map(String::as_str), Some("auth.user"));

    // the permanent failure is listed once, with its context
    assert_eq!(summary.errors.len(), 1);
    let failure = &summary.errors[0];
    assert_eq!(failure.entity_type, "sales.orderline");
    assert_eq!(failure.index, 10);
    assert_eq!(failure.primary_key, Some(crate::PrimaryKey::Int(2)));
    assert!(failure.message.contains("FOREIGN KEY"));

    let progress = service.get_progress("shop")?.expect("progress row");
    assert_eq!(progress.status, RestoreStatus::Completed);
    assert_eq!(progress.progress_percentage, 100);
    assert_eq!(progress.success_count, 12);
    assert_eq!(progress.error_count, 1);
    let stored = progress.result_summary.expect("summary stored");
    assert_eq!(stored["recoveredOnSecondPass"], json!(3));
    assert_eq!(stored["errors"][0]["entityType"], json!("sales.orderline"));

    // legacy fields were repaired on the way in
    let conn = pool.get()?;
    let (connected, settings): (i64, String) = conn.query_row(
        "SELECT is_connected, settings FROM integrations_connection WHERE id = 7",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    assert_eq!(connected, 1);
    assert_eq!(serde_json::from_str::<Value>(&settings)?, json!({"shop": "acme"}));
    let parent: Option<i64> = conn.query_row(
        "SELECT parent_id FROM catalog_category WHERE id = 2",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(parent, Some(3));
    Ok(())
}

#[test]
fn without_second_pass_forward_references_stay_failed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(&dir, "shop.json", &shop_snapshot())?;
    let config = RestoreConfig {
        enable_second_pass: false,
        ..RestoreConfig::default()
    };
    let service = RestoreService::new(pool.clone(), config);

    let summary = service.run_restore(&snapshot, false, None)?;
    // category 2 fails, and so does everything that hangs off it
    assert_eq!(summary.recovered_on_second_pass, 0);
    assert_eq!(summary.error_count, 4);
    assert_eq!(summary.success_count + summary.error_count, summary.total_items);
    Ok(())
}

#[test]
fn restoring_twice_with_clear_existing_is_stable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(&dir, "shop.json", &shop_snapshot())?;
    let service = RestoreService::new(pool.clone(), RestoreConfig::default());

    let first = service.run_restore(&snapshot, true, None)?;
    let second = service.run_restore(&snapshot, true, None)?;

    assert_eq!(first.success_count, second.success_count);
    assert_eq!(first.error_count, second.error_count);
    assert!(second.purge_errors.is_empty(), "{:?}", second.purge_errors);
    let purged_users = second
        .purged
        .iter()
        .find(|entry| entry.entity_type == "auth.user")
        .map(|entry| entry.rows);
    assert_eq!(purged_users, Some(2));
    assert_eq!(count(&pool, "auth_user")?, 2);
    assert_eq!(count(&pool, "sales_orderline")?, 1);
    Ok(())
}

#[test]
fn protected_type_survives_wipe() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO sessions_session (session_key, session_data, expire_date) VALUES (?1, ?2, ?3)",
            params!["still-logged-in", "e30=", "2031-01-01T00:00:00Z"],
        )?;
        conn.execute("INSERT INTO auth_user (id, username) VALUES (50, 'stale')", [])?;
    }
    let snapshot = write_snapshot(
        &dir,
        "wipe.json",
        &json!([
            {"model": "sessions.session", "pk": "fresh", "fields": {"session_data": "e30=", "expire_date": "2030-01-01T00:00:00Z"}},
            {"model": "auth.user", "pk": 1, "fields": {"username": "ada"}}
        ]),
    )?;
    let service = RestoreService::new(pool.clone(), RestoreConfig::default());

    let summary = service.run_restore(&snapshot, true, None)?;

    assert_eq!(summary.protected_skipped, vec!["sessions.session".to_string()]);
    assert_eq!(summary.success_count, 2);
    let conn = pool.get()?;
    let kept: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions_session WHERE session_key = 'still-logged-in'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(kept, 1);
    assert_eq!(count(&pool, "sessions_session")?, 2);
    let usernames: Vec<String> = conn
        .prepare("SELECT username FROM auth_user ORDER BY id")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    assert_eq!(usernames, vec!["ada".to_string()]);
    Ok(())
}

#[test]
fn wipe_clears_identities_still_referenced_by_protected_rows() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    {
        let conn = pool.get()?;
        conn.execute("INSERT INTO auth_user (id, username) VALUES (50, 'stale')", [])?;
        conn.execute("INSERT INTO auth_token (key, user_id) VALUES ('tok', 50)", [])?;
    }
    let snapshot = write_snapshot(
        &dir,
        "tokens.json",
        &json!([
            {"model": "auth.user", "pk": 1, "fields": {"username": "ada"}},
            {"model": "auth.token", "pk": "fresh", "fields": {"user": 1}}
        ]),
    )?;
    let service = RestoreService::new(pool.clone(), RestoreConfig::default());

    let summary = service.run_restore(&snapshot, true, None)?;

    assert!(summary.purge_errors.is_empty(), "{:?}", summary.purge_errors);
    assert_eq!(summary.protected_skipped, vec!["auth.token".to_string()]);
    assert_eq!(summary.success_count, 2);
    // the kept token still points at user 50
    assert_eq!(summary.dangling_references, 1);
    let conn = pool.get()?;
    let usernames: Vec<String> = conn
        .prepare("SELECT username FROM auth_user ORDER BY id")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    assert_eq!(usernames, vec!["ada".to_string()]);
    let tokens: Vec<String> = conn
        .prepare("SELECT key FROM auth_token ORDER BY key")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    assert_eq!(tokens, vec!["fresh".to_string(), "tok".to_string()]);
    Ok(())
}

#[test]
fn oversized_snapshot_fails_before_reading() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(&dir, "big.json", &shop_snapshot())?;
    let config = RestoreConfig {
        max_snapshot_bytes: 64,
        ..RestoreConfig::default()
    };
    let service = RestoreService::new(pool.clone(), config);

    let err = service
        .run_restore(&snapshot, true, Some("too-big".into()))
        .unwrap_err();
    assert!(matches!(err, Error::SnapshotTooLarge { limit: 64, .. }));

    let progress = service.get_progress("too-big")?.expect("progress row");
    assert_eq!(progress.status, RestoreStatus::Failed);
    assert!(progress.error_message.unwrap_or_default().contains("too large"));
    assert_eq!(progress.total_items, None);
    Ok(())
}

#[test]
fn empty_snapshot_completes_with_zero_counts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(&dir, "empty.json", &json!([]))?;
    let service = RestoreService::new(pool, RestoreConfig::default());

    let summary = service.run_restore(&snapshot, false, Some("empty".into()))?;
    assert_eq!(summary.total_items, 0);
    assert_eq!(summary.success_count, 0);
    assert_eq!(summary.error_count, 0);
    assert_eq!(summary.success_rate, 1.0);

    let progress = service.get_progress("empty")?.expect("progress row");
    assert_eq!(progress.status, RestoreStatus::Completed);
    assert_eq!(progress.progress_percentage, 100);
    assert_eq!(progress.total_items, Some(0));
    Ok(())
}

const NOTE_COLUMNS: &[ColumnDef] = &[
    ColumnDef::foreign_key("author", "author_id", "auth.user"),
    ColumnDef::new("body", ColumnKind::Text),
];

#[test]
fn unprioritized_type_is_restored_last() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    pool.get()?.execute_batch(
        "CREATE TABLE notes_note (
            id INTEGER PRIMARY KEY,
            author_id INTEGER NOT NULL REFERENCES auth_user(id),
            body TEXT NOT NULL
        );",
    )?;
    let mut registry = EntityRegistry::builtin().clone();
    registry.register(EntityDef {
        name: "notes.note",
        table: "notes_note",
        primary_key: "id",
        primary_key_kind: ColumnKind::Integer,
        columns: NOTE_COLUMNS,
    });
    assert!(registry.validate().is_ok());

    let snapshot = write_snapshot(
        &dir,
        "notes.json",
        &json!([
            {"model": "notes.note", "pk": 1, "fields": {"author": 1, "body": "hello"}},
            {"model": "legacy.widget", "pk": 9, "fields": {"size": 3}},
            {"model": "auth.user", "pk": 1, "fields": {"username": "ada"}}
        ]),
    )?;
    let service = RestoreService::with_registry(pool.clone(), registry, RestoreConfig::default());

    let summary = service.run_restore(&snapshot, false, None)?;
    assert_eq!(summary.insert_order, vec!["auth.user".to_string(), "notes.note".to_string()]);
    assert_eq!(summary.total_items, 2);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.skipped_items, 1);
    assert_eq!(summary.unresolvable_types, vec!["legacy.widget".to_string()]);
    assert_eq!(summary.recovered_on_second_pass, 0);
    assert_eq!(count(&pool, "notes_note")?, 1);
    Ok(())
}

#[test]
fn processing_session_is_returned_as_is() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    {
        let conn = pool.get()?;
        let mut progress = RestoreProgress::new("crashed");
        progress.status = RestoreStatus::Processing;
        progress.total_items = Some(100);
        progress.processed_items = 50;
        progress.progress_percentage = 50;
        progress.updated_at = progress.updated_at - chrono::Duration::hours(1);
        restore_progress::insert(&conn, &progress)?;
    }
    let service = RestoreService::new(pool, RestoreConfig::default());

    let progress = service.get_progress("crashed")?.expect("progress row");
    assert_eq!(progress.status, RestoreStatus::Processing);
    assert_eq!(progress.processed_items, 50);

    let stale = service.stale_sessions(10)?;
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].session_id, "crashed");
    // reporting a stale session never rewrites it
    let again = service.get_progress("crashed")?.expect("progress row");
    assert_eq!(again, progress);
    Ok(())
}

#[test]
fn stale_sessions_reach_past_the_newest_rows() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(&dir, "empty.json", &json!([]))?;
    {
        let conn = pool.get()?;
        let mut abandoned = RestoreProgress::new("abandoned");
        abandoned.status = RestoreStatus::Processing;
        abandoned.created_at = abandoned.created_at - chrono::Duration::days(2);
        abandoned.updated_at = abandoned.created_at;
        restore_progress::insert(&conn, &abandoned)?;
    }
    let service = RestoreService::new(pool, RestoreConfig::default());
    service.run_restore(&snapshot, false, Some("newer-1".into()))?;
    service.run_restore(&snapshot, false, Some("newer-2".into()))?;

    let recent: Vec<String> = service
        .list_sessions(1)?
        .into_iter()
        .map(|progress| progress.session_id)
        .collect();
    assert!(!recent.contains(&"abandoned".to_string()));
    let stale = service.stale_sessions(1)?;
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].session_id, "abandoned");
    Ok(())
}

#[test]
fn background_restore_is_observable_by_polling() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(&dir, "shop.json", &shop_snapshot())?;
    let service = RestoreService::new(pool, RestoreConfig::default());

    let session_id = service.start_restore(&snapshot, false, None)?;
    assert!(service.get_progress(&session_id)?.is_some());

    let progress = wait_for_terminal(&service, &session_id)?;
    assert_eq!(progress.status, RestoreStatus::Completed);
    assert_eq!(progress.processed_items, 13);

    // the finished job drops its own handle without anyone calling wait
    let deadline = Instant::now() + Duration::from_secs(10);
    while !service.running_jobs().is_empty() {
        if Instant::now() > deadline {
            return Err(anyhow!("job handles left behind: {:?}", service.running_jobs()));
        }
        thread::sleep(Duration::from_millis(10));
    }
    service.wait(&session_id)?;
    assert!(!service.cancel_restore(&session_id));
    Ok(())
}

#[test]
fn duplicate_session_id_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(&dir, "empty.json", &json!([]))?;
    let service = RestoreService::new(pool, RestoreConfig::default());

    service.run_restore(&snapshot, false, Some("fixed".into()))?;
    let err = service
        .start_restore(&snapshot, false, Some("fixed".into()))
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));
    assert_eq!(
        service.get_progress("fixed")?.map(|progress| progress.status),
        Some(RestoreStatus::Completed)
    );
    Ok(())
}

#[test]
fn credentials_file_fails_the_session() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(
        &dir,
        "key.json",
        &json!({"type": "service_account", "project_id": "p", "private_key": "k", "client_email": "e"}),
    )?;
    let service = RestoreService::new(pool, RestoreConfig::default());

    let err = service.run_restore(&snapshot, false, Some("creds".into())).unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_)));
    let progress = service.get_progress("creds")?.expect("progress row");
    assert_eq!(progress.status, RestoreStatus::Failed);
    Ok(())
}

#[test]
fn placeholder_policy_fills_missing_targets() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(
        &dir,
        "orphans.json",
        &json!([
            {"model": "sales.customer", "pk": 1, "fields": {"organization": 77, "name": "Orphan", "created_at": "2024-01-01T00:00:00Z"}}
        ]),
    )?;
    let config = RestoreConfig {
        missing_reference: MissingReferencePolicy::Placeholder,
        ..RestoreConfig::default()
    };
    let service = RestoreService::new(pool.clone(), config);

    let summary = service.run_restore(&snapshot, false, None)?;
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.placeholders_created, 1);
    let conn = pool.get()?;
    let name: String = conn.query_row(
        "SELECT name FROM core_organization WHERE id = 77",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(name, "Restored organization 77");
    Ok(())
}

#[test]
fn disabled_constraints_report_dangling_references() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let snapshot = write_snapshot(
        &dir,
        "dangling.json",
        &json!([
            {"model": "core.membership", "pk": 1, "fields": {"organization": 3, "user": 4}}
        ]),
    )?;
    let config = RestoreConfig {
        constraint_mode: ConstraintMode::Disabled,
        ..RestoreConfig::default()
    };
    let service = RestoreService::new(pool.clone(), config);

    let summary = service.run_restore(&snapshot, false, None)?;
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.error_count, 0);
    assert_eq!(summary.dangling_references, 2);
    assert_eq!(count(&pool, "core_membership")?, 1);
    Ok(())
}

#[test]
fn gzip_snapshot_restores_with_its_checksum() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = setup_pool(&dir)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&serde_json::to_vec(&shop_snapshot())?)?;
    let compressed = encoder.finish()?;
    // no suffix: detection goes by the magic bytes
    let path = dir.path().join("shop.snapshot");
    std::fs::write(&path, &compressed)?;
    let service = RestoreService::new(pool, RestoreConfig::default());

    let summary = service.run_restore(&path, false, None)?;
    assert!(summary.compressed);
    assert_eq!(summary.snapshot_sha256, provenance::sha256_hex(&compressed));
    assert_eq!(summary.success_count, 12);
    Ok(())
}
