// restorer/src/apply.rs
//!
//! Writing one snapshot record into its table
//!
//! Every record gets its own transaction, so a failing record rolls back
//! alone. Rows are upserted on the primary key: a row left by an earlier
//! restore, or a placeholder created for a missing reference, is
//! overwritten by the real record.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::config::{ConstraintMode, MissingReferencePolicy, RestoreConfig};
use crate::legacy;
use crate::registry::{ColumnDef, ColumnKind, EntityDef, EntityRegistry, Placeholder};
use crate::{EntityRecord, Error, PrimaryKey};

/// A record that could not be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyError {
    pub index: usize,
    pub entity_type: String,
    pub primary_key: Option<PrimaryKey>,
    pub message: String,
}

impl ApplyError {
    fn new(record: &EntityRecord, message: &str, max_chars: usize) -> Self {
        Self {
            index: record.index,
            entity_type: record.entity_type.clone(),
            primary_key: record.primary_key.clone(),
            message: truncate_message(message, max_chars),
        }
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.primary_key {
            Some(pk) => write!(
                f,
                "record {} ({} pk={}): {}",
                self.index, self.entity_type, pk, self.message
            ),
            None => write!(f, "record {} ({}): {}", self.index, self.entity_type, self.message),
        }
    }
}

/// Cuts `message` to at most `max_chars` characters, never inside one.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

/// Outcome of a successful apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    /// Placeholder rows inserted for missing references.
    pub placeholders: u32,
}

pub struct RecordApplier<'a> {
    registry: &'a EntityRegistry,
    constraint_mode: ConstraintMode,
    missing_reference: MissingReferencePolicy,
    max_message_chars: usize,
}

impl<'a> RecordApplier<'a> {
    pub fn new(registry: &'a EntityRegistry, config: &RestoreConfig) -> Self {
        Self {
            registry,
            constraint_mode: config.constraint_mode,
            missing_reference: config.missing_reference,
            max_message_chars: config.error_message_max_chars,
        }
    }

    pub fn apply(&self, conn: &Connection, record: &EntityRecord) -> Result<Applied, ApplyError> {
        self.write(conn, record).map_err(|err| {
            tracing::debug!(
                index = record.index,
                entity_type = %record.entity_type,
                error = %err,
                "record failed"
            );
            ApplyError::new(record, &err.to_string(), self.max_message_chars)
        })
    }

    fn write(&self, conn: &Connection, record: &EntityRecord) -> Result<Applied, Error> {
        let entity = self.registry.get(&record.entity_type).ok_or_else(|| {
            Error::Api(format!("type {} is not registered", record.entity_type))
        })?;
        let fields = legacy::repair(entity, record.fields.clone());

        let mut columns: Vec<&'static str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        let mut references: Vec<(&ColumnDef, i64)> = Vec::new();

        if let Some(pk) = &record.primary_key {
            columns.push(entity.primary_key);
            values.push(primary_key_value(entity, pk)?);
        }
        for (field, value) in &fields {
            if field == entity.primary_key {
                continue;
            }
            let Some(column) = entity.column_for_field(field) else {
                tracing::debug!(entity_type = entity.name, field = %field, "ignoring unknown field");
                continue;
            };
            if columns.contains(&column.column) {
                continue;
            }
            let sql_value = column_value(column, value)
                .map_err(|message| Error::Api(format!("field {field}: {message}")))?;
            if let (Some(_), SqlValue::Integer(target)) = (column.references, &sql_value) {
                references.push((column, *target));
            }
            columns.push(column.column);
            values.push(sql_value);
        }

        let tx = conn.unchecked_transaction()?;
        if self.constraint_mode == ConstraintMode::Deferred {
            tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
        }

        let mut applied = Applied::default();
        if self.missing_reference == MissingReferencePolicy::Placeholder {
            for (column, target_pk) in references {
                if self.ensure_target(&tx, entity, record, column, target_pk)? {
                    applied.placeholders += 1;
                }
            }
        }

        let has_pk = record.primary_key.is_some();
        tx.execute(&upsert_sql(entity, &columns, has_pk), params_from_iter(values))?;
        tx.commit()?;
        Ok(applied)
    }

    /// Inserts a placeholder for the row `column` points at, unless it
    /// exists. Returns whether a row was created.
    fn ensure_target(
        &self,
        conn: &Connection,
        entity: &EntityDef,
        record: &EntityRecord,
        column: &ColumnDef,
        target_pk: i64,
    ) -> Result<bool, Error> {
        let Some(target) = column.references.and_then(|name| self.registry.get(name)) else {
            return Ok(false);
        };
        if target.name == entity.name && record.primary_key == Some(PrimaryKey::Int(target_pk)) {
            return Ok(false);
        }

        let exists = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM \"{}\" WHERE \"{}\" = ?1",
                    target.table, target.primary_key
                ),
                params![target_pk],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(false);
        }

        let mut columns = vec![target.primary_key];
        let mut values = vec![SqlValue::Integer(target_pk)];
        for column in target.placeholder_columns() {
            if let Some(placeholder) = column.placeholder {
                columns.push(column.column);
                values.push(placeholder_value(placeholder, target_pk));
            }
        }
        let created = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO \"{}\" ({}) VALUES ({})",
                target.table,
                quoted(&columns),
                placeholders(columns.len())
            ),
            params_from_iter(values),
        )?;
        if created > 0 {
            tracing::info!(
                entity_type = target.name,
                pk = target_pk,
                referenced_by = entity.name,
                "created placeholder for missing reference"
            );
        }
        Ok(created > 0)
    }
}

fn quoted(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|column| format!("\"{column}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|n| format!("?{n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn upsert_sql(entity: &EntityDef, columns: &[&str], has_pk: bool) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO \"{}\" DEFAULT VALUES", entity.table);
    }
    let insert = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        entity.table,
        quoted(columns),
        placeholders(columns.len())
    );
    if !has_pk {
        return insert;
    }

    let updates: Vec<String> = columns
        .iter()
        .filter(|column| **column != entity.primary_key)
        .map(|column| format!("\"{column}\" = excluded.\"{column}\""))
        .collect();
    if updates.is_empty() {
        format!("{insert} ON CONFLICT(\"{}\") DO NOTHING", entity.primary_key)
    } else {
        format!(
            "{insert} ON CONFLICT(\"{}\") DO UPDATE SET {}",
            entity.primary_key,
            updates.join(", ")
        )
    }
}

fn primary_key_value(entity: &EntityDef, pk: &PrimaryKey) -> Result<SqlValue, Error> {
    match (entity.primary_key_kind, pk) {
        (ColumnKind::Integer, PrimaryKey::Int(value)) => Ok(SqlValue::Integer(*value)),
        (ColumnKind::Integer, PrimaryKey::Text(text)) => text
            .trim()
            .parse::<i64>()
            .map(SqlValue::Integer)
            .map_err(|_| Error::Api(format!("primary key {text:?} is not an integer"))),
        (_, PrimaryKey::Int(value)) => Ok(SqlValue::Text(value.to_string())),
        (_, PrimaryKey::Text(text)) => Ok(SqlValue::Text(text.clone())),
    }
}

fn column_value(column: &ColumnDef, value: &Value) -> Result<SqlValue, String> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let mismatch = || format!("expected {:?}, found {value}", column.kind);

    match column.kind {
        ColumnKind::Integer => match value {
            Value::Number(number) => number.as_i64().map(SqlValue::Integer).ok_or_else(mismatch),
            Value::String(text) => text
                .trim()
                .parse::<i64>()
                .map(SqlValue::Integer)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ColumnKind::Real => match value {
            Value::Number(number) => number.as_f64().map(SqlValue::Real).ok_or_else(mismatch),
            Value::String(text) => text
                .trim()
                .parse::<f64>()
                .map(SqlValue::Real)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ColumnKind::Text => match value {
            Value::String(text) => Ok(SqlValue::Text(text.clone())),
            Value::Number(number) => Ok(SqlValue::Text(number.to_string())),
            _ => Err(mismatch()),
        },
        ColumnKind::Boolean => legacy::normalize_bool(value)
            .map(|flag| SqlValue::Integer(flag as i64))
            .ok_or_else(mismatch),
        ColumnKind::Timestamp => match value {
            Value::String(text) if is_timestamp(text) => Ok(SqlValue::Text(text.clone())),
            _ => Err(format!("invalid timestamp {value}")),
        },
        ColumnKind::Json => Ok(SqlValue::Text(value.to_string())),
    }
}

fn is_timestamp(text: &str) -> bool {
    DateTime::parse_from_rfc3339(text).is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

fn placeholder_value(placeholder: Placeholder, pk: i64) -> SqlValue {
    match placeholder {
        Placeholder::Text(text) => SqlValue::Text(text.to_string()),
        Placeholder::KeyedText(prefix) => SqlValue::Text(format!("{prefix}{pk}")),
        Placeholder::Integer(value) => SqlValue::Integer(value),
        Placeholder::Boolean(flag) => SqlValue::Integer(flag as i64),
        Placeholder::Now => SqlValue::Text(Utc::now().to_rfc3339()),
    }
}
