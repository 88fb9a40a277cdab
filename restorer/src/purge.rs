// restorer/src/purge.rs
//!
//! Clearing existing rows before a restore
//!
//! Tables are emptied in delete order (dependents first). Protected types
//! are never touched, and one table failing to clear does not stop the
//! others.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::registry::EntityRegistry;

/// Types that a purge never deletes, whatever the configuration says.
pub const BUILT_IN_PROTECTED: &[&str] = &[
    "restore.restoreprogress",
    "sessions.session",
    "auth.token",
    "contenttypes.contenttype",
    "migrations.migration",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedTypes {
    names: BTreeSet<String>,
}

impl ProtectedTypes {
    /// The built-in set plus `extra`.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: BTreeSet<String> =
            BUILT_IN_PROTECTED.iter().map(|name| name.to_string()).collect();
        names.extend(extra.into_iter().map(Into::into));
        Self { names }
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.names.contains(entity_type)
    }
}

impl Default for ProtectedTypes {
    fn default() -> Self {
        Self::with_extra(Vec::<String>::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgedType {
    pub entity_type: String,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeError {
    pub entity_type: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub deleted: Vec<PurgedType>,
    pub skipped_protected: Vec<String>,
    pub errors: Vec<PurgeError>,
}

impl PurgeReport {
    pub fn total_deleted(&self) -> u64 {
        self.deleted.iter().map(|entry| entry.rows).sum()
    }
}

/// Deletes every row of every non-protected type in `delete_order`.
pub fn purge(
    conn: &Connection,
    registry: &EntityRegistry,
    delete_order: &[String],
    protected: &ProtectedTypes,
) -> PurgeReport {
    let mut report = PurgeReport::default();

    for entity_type in delete_order {
        if protected.contains(entity_type) {
            tracing::debug!(entity_type = %entity_type, "skipping protected type");
            report.skipped_protected.push(entity_type.clone());
            continue;
        }
        let Some(entity) = registry.get(entity_type) else {
            report.errors.push(PurgeError {
                entity_type: entity_type.clone(),
                message: "type is not registered".to_string(),
            });
            continue;
        };

        match conn.execute(&format!("DELETE FROM \"{}\"", entity.table), []) {
            Ok(rows) => {
                tracing::info!(entity_type = %entity_type, rows, "purged existing rows");
                report.deleted.push(PurgedType {
                    entity_type: entity_type.clone(),
                    rows: rows as u64,
                });
            }
            Err(err) => {
                tracing::warn!(entity_type = %entity_type, error = %err, "purge failed, continuing");
                report.errors.push(PurgeError {
                    entity_type: entity_type.clone(),
                    message: err.to_string(),
                });
            }
        }
    }

    report
}
