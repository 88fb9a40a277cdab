// restorer/src/registry.rs
//!
//! Entity registry: snapshot type names mapped to their backing tables
//!
//! Each registered type (`app.model`, the name used by the snapshot's
//! `model` key) knows its table, primary key and columns, including which
//! columns reference other types. The registry also carries the fixed
//! dependency-priority table used to order inserts and deletes.
//!
//! A type can be registered without a priority slot; it is then restored
//! after every prioritized type. A type missing from the registry cannot be
//! restored at all.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

use crate::ordering::{self, DependencyOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Boolean,
    /// RFC 3339 text.
    Timestamp,
    /// Arbitrary JSON stored as text.
    Json,
}

/// Value written into a required column of a synthesized placeholder row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placeholder {
    Text(&'static str),
    /// Prefix followed by the missing primary key, for unique columns.
    KeyedText(&'static str),
    Integer(i64),
    Boolean(bool),
    Now,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnDef {
    /// Field name in the snapshot.
    pub field: &'static str,
    pub column: &'static str,
    pub kind: ColumnKind,
    /// Entity type this column points at, if it is a foreign key.
    pub references: Option<&'static str>,
    pub placeholder: Option<Placeholder>,
}

impl ColumnDef {
    pub const fn new(field: &'static str, kind: ColumnKind) -> Self {
        Self {
            field,
            column: field,
            kind,
            references: None,
            placeholder: None,
        }
    }

    /// Foreign key stored in `<field>_id`.
    pub const fn foreign_key(field: &'static str, column: &'static str, target: &'static str) -> Self {
        Self {
            field,
            column,
            kind: ColumnKind::Integer,
            references: Some(target),
            placeholder: None,
        }
    }

    pub const fn with_placeholder(self, placeholder: Placeholder) -> Self {
        Self {
            placeholder: Some(placeholder),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDef {
    pub name: &'static str,
    pub table: &'static str,
    pub primary_key: &'static str,
    pub primary_key_kind: ColumnKind,
    pub columns: &'static [ColumnDef],
}

impl EntityDef {
    /// Resolves a snapshot field by field name, or by column name for
    /// exports that already use `<field>_id`.
    pub fn column_for_field(&self, field: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|column| column.field == field)
            .or_else(|| self.columns.iter().find(|column| column.column == field))
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|column| column.references.is_some())
    }

    pub fn placeholder_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .filter(|column| column.placeholder.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct EntityRegistry {
    entities: HashMap<&'static str, EntityDef>,
    priority: Vec<&'static str>,
}

impl EntityRegistry {
    pub fn new(entities: Vec<EntityDef>, priority: Vec<&'static str>) -> Self {
        let entities = entities
            .into_iter()
            .map(|entity| (entity.name, entity))
            .collect();
        Self { entities, priority }
    }

    /// The registry matching the schema created by `store::migrate_db`.
    pub fn builtin() -> &'static EntityRegistry {
        &BUILTIN
    }

    /// Adds or replaces a type. It is restored after every prioritized type
    /// unless it also appears in the priority table.
    pub fn register(&mut self, entity: EntityDef) {
        self.entities.insert(entity.name, entity);
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntityDef> {
        self.entities.get(entity_type)
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.entities.contains_key(entity_type)
    }

    pub fn priority(&self) -> &[&'static str] {
        &self.priority
    }

    pub fn priority_of(&self, entity_type: &str) -> Option<usize> {
        self.priority.iter().position(|name| *name == entity_type)
    }

    pub fn order(&self, distinct_types: &[String]) -> DependencyOrder {
        ordering::order(&self.priority, distinct_types)
    }

    /// Checks that every foreign key points at a registered type that is
    /// restored before the referencing type. Self references are allowed.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();

        for name in &self.priority {
            if !seen.insert(*name) {
                problems.push(format!("{name} appears twice in the priority table"));
            }
            if !self.contains(name) {
                problems.push(format!("{name} is prioritized but not registered"));
            }
        }

        let mut names: Vec<_> = self.entities.keys().copied().collect();
        names.sort_unstable();
        for name in names {
            let entity = &self.entities[name];
            let own_rank = self.priority_of(name);
            for column in entity.foreign_keys() {
                let Some(target) = column.references else {
                    continue;
                };
                if target == name {
                    continue;
                }
                if !self.contains(target) {
                    problems.push(format!(
                        "{name}.{} references unregistered type {target}",
                        column.field
                    ));
                    continue;
                }
                let Some(own_rank) = own_rank else {
                    continue;
                };
                match self.priority_of(target) {
                    Some(target_rank) if target_rank < own_rank => {}
                    _ => problems.push(format!(
                        "{name}.{} references {target}, which is not restored before {name}",
                        column.field
                    )),
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

use ColumnKind::{Boolean, Integer, Json, Real, Text, Timestamp};

const AUTH_USER: &[ColumnDef] = &[
    ColumnDef::new("username", Text).with_placeholder(Placeholder::KeyedText("restored-user-")),
    ColumnDef::new("email", Text),
    ColumnDef::new("first_name", Text),
    ColumnDef::new("last_name", Text),
    ColumnDef::new("is_active", Boolean),
    ColumnDef::new("is_staff", Boolean),
    ColumnDef::new("date_joined", Timestamp),
    ColumnDef::new("last_login", Timestamp),
];

const CONTENT_TYPE: &[ColumnDef] = &[
    ColumnDef::new("app_label", Text),
    ColumnDef::new("model", Text),
];

const ORGANIZATION: &[ColumnDef] = &[
    ColumnDef::new("name", Text).with_placeholder(Placeholder::KeyedText("Restored organization ")),
    ColumnDef::new("slug", Text),
    ColumnDef::foreign_key("owner", "owner_id", "auth.user"),
    ColumnDef::new("created_at", Timestamp),
];

const MEMBERSHIP: &[ColumnDef] = &[
    ColumnDef::foreign_key("organization", "organization_id", "core.organization"),
    ColumnDef::foreign_key("user", "user_id", "auth.user"),
    ColumnDef::new("role", Text),
    ColumnDef::new("joined_at", Timestamp),
];

const AUTH_TOKEN: &[ColumnDef] = &[
    ColumnDef::foreign_key("user", "user_id", "auth.user"),
    ColumnDef::new("created", Timestamp),
];

const SESSION: &[ColumnDef] = &[
    ColumnDef::new("session_data", Text),
    ColumnDef::new("expire_date", Timestamp),
];

const CATEGORY: &[ColumnDef] = &[
    ColumnDef::foreign_key("organization", "organization_id", "core.organization"),
    ColumnDef::foreign_key("parent", "parent_id", "catalog.category"),
    ColumnDef::new("name", Text).with_placeholder(Placeholder::KeyedText("Restored category ")),
];

const PRODUCT: &[ColumnDef] = &[
    ColumnDef::foreign_key("category", "category_id", "catalog.category"),
    ColumnDef::new("name", Text).with_placeholder(Placeholder::KeyedText("Restored product ")),
    ColumnDef::new("sku", Text),
    ColumnDef::new("price", Real),
    ColumnDef::new("is_available", Boolean),
    ColumnDef::new("attributes", Json),
];

const CUSTOMER: &[ColumnDef] = &[
    ColumnDef::foreign_key("organization", "organization_id", "core.organization"),
    ColumnDef::new("name", Text).with_placeholder(Placeholder::KeyedText("Restored customer ")),
    ColumnDef::new("email", Text),
    ColumnDef::new("phone", Text),
    ColumnDef::new("created_at", Timestamp).with_placeholder(Placeholder::Now),
];

const ORDER: &[ColumnDef] = &[
    ColumnDef::foreign_key("customer", "customer_id", "sales.customer"),
    ColumnDef::new("placed_at", Timestamp),
    ColumnDef::new("status", Text).with_placeholder(Placeholder::Text("restored")),
    ColumnDef::new("total", Real),
];

const ORDER_LINE: &[ColumnDef] = &[
    ColumnDef::foreign_key("order", "order_id", "sales.order"),
    ColumnDef::foreign_key("product", "product_id", "catalog.product"),
    ColumnDef::new("quantity", Integer),
    ColumnDef::new("unit_price", Real),
];

const CONNECTION: &[ColumnDef] = &[
    ColumnDef::foreign_key("organization", "organization_id", "core.organization"),
    ColumnDef::new("provider", Text),
    ColumnDef::new("is_connected", Boolean),
    ColumnDef::new("settings", Json),
    ColumnDef::new("connected_at", Timestamp),
];

const LOG_ENTRY: &[ColumnDef] = &[
    ColumnDef::foreign_key("actor", "actor_id", "auth.user"),
    ColumnDef::new("action", Text),
    ColumnDef::new("object_type", Text),
    ColumnDef::new("object_id", Text),
    ColumnDef::new("payload", Json),
    ColumnDef::new("created_at", Timestamp),
];

const fn entity(
    name: &'static str,
    table: &'static str,
    columns: &'static [ColumnDef],
) -> EntityDef {
    EntityDef {
        name,
        table,
        primary_key: "id",
        primary_key_kind: Integer,
        columns,
    }
}

/// Restore order for the built-in types. A type must come after every type
/// it references.
pub const BUILTIN_PRIORITY: &[&str] = &[
    "auth.user",
    "contenttypes.contenttype",
    "core.organization",
    "core.membership",
    "auth.token",
    "sessions.session",
    "catalog.category",
    "catalog.product",
    "sales.customer",
    "sales.order",
    "sales.orderline",
    "integrations.connection",
    "audit.logentry",
];

static BUILTIN: Lazy<EntityRegistry> = Lazy::new(|| {
    EntityRegistry::new(
        vec![
            entity("auth.user", "auth_user", AUTH_USER),
            entity("contenttypes.contenttype", "contenttypes_contenttype", CONTENT_TYPE),
            entity("core.organization", "core_organization", ORGANIZATION),
            entity("core.membership", "core_membership", MEMBERSHIP),
            EntityDef {
                name: "auth.token",
                table: "auth_token",
                primary_key: "key",
                primary_key_kind: Text,
                columns: AUTH_TOKEN,
            },
            EntityDef {
                name: "sessions.session",
                table: "sessions_session",
                primary_key: "session_key",
                primary_key_kind: Text,
                columns: SESSION,
            },
            entity("catalog.category", "catalog_category", CATEGORY),
            entity("catalog.product", "catalog_product", PRODUCT),
            entity("sales.customer", "sales_customer", CUSTOMER),
            entity("sales.order", "sales_order", ORDER),
            entity("sales.orderline", "sales_orderline", ORDER_LINE),
            entity("integrations.connection", "integrations_connection", CONNECTION),
            entity("audit.logentry", "audit_logentry", LOG_ENTRY),
        ],
        BUILTIN_PRIORITY.to_vec(),
    )
});
