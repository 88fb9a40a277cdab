// restorer/src/legacy.rs
//!
//! Legacy field repairs applied to a record before it is written
//!
//! Older exports used different field names and encoded some flags as
//! strings. The rules here are a fixed table of (type, old field, new field,
//! transform) entries plus a normalization of string-encoded booleans for
//! every boolean column. `repair` is a pure function over the field map.

use serde_json::{Map, Value};

use crate::registry::{ColumnKind, EntityDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationRule {
    pub entity_type: &'static str,
    pub from: &'static str,
    pub to: &'static str,
    pub transform: Transform,
}

const fn rename(
    entity_type: &'static str,
    from: &'static str,
    to: &'static str,
    transform: Transform,
) -> MigrationRule {
    MigrationRule {
        entity_type,
        from,
        to,
        transform,
    }
}

pub const LEGACY_RULES: &[MigrationRule] = &[
    rename("auth.user", "active", "is_active", Transform::Boolean),
    rename("catalog.product", "available", "is_available", Transform::Boolean),
    rename("catalog.product", "extra", "attributes", Transform::Identity),
    rename("sales.customer", "phone_number", "phone", Transform::Identity),
    rename("integrations.connection", "status", "is_connected", Transform::Boolean),
    rename("integrations.connection", "config", "settings", Transform::Identity),
    rename("audit.logentry", "user", "actor", Transform::Identity),
];

/// Interprets the boolean encodings found in older exports.
pub fn normalize_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "on" | "1" | "connected" | "active" | "enabled" => {
                Some(true)
            }
            "false" | "f" | "no" | "n" | "off" | "0" | "disconnected" | "inactive"
            | "disabled" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn apply_transform(transform: Transform, value: Value) -> Value {
    match transform {
        Transform::Identity => value,
        Transform::Boolean => normalize_bool(&value).map(Value::Bool).unwrap_or(value),
    }
}

/// Returns the repaired field map. The current field name wins when an
/// export carries both the old and the new name.
pub fn repair(entity: &EntityDef, mut fields: Map<String, Value>) -> Map<String, Value> {
    for rule in LEGACY_RULES.iter().filter(|rule| rule.entity_type == entity.name) {
        let Some(old) = fields.remove(rule.from) else {
            continue;
        };
        if fields.contains_key(rule.to) {
            tracing::debug!(
                entity_type = entity.name,
                field = rule.from,
                "dropping legacy field shadowed by {}",
                rule.to
            );
            continue;
        }
        fields.insert(rule.to.to_string(), apply_transform(rule.transform, old));
    }

    for column in entity.columns.iter().filter(|c| c.kind == ColumnKind::Boolean) {
        for key in [column.field, column.column] {
            if let Some(value) = fields.get_mut(key) {
                if let Some(flag) = normalize_bool(value) {
                    *value = Value::Bool(flag);
                }
            }
        }
    }

    fields
}
