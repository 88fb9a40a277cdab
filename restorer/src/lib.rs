// In restorer/src/lib.rs

use std::fmt;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

// The shared database pool type
pub type DbPool = Pool<SqliteConnectionManager>;

// Main error type for the restore engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid restore config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid snapshot format: {0}")]
    Format(String),
    #[error("unsupported snapshot format: {0}")]
    UnsupportedFormat(String),
    #[error("snapshot too large: {size} bytes exceeds the limit of {limit} bytes")]
    SnapshotTooLarge { size: u64, limit: u64 },
    #[error("restore cancelled")]
    Cancelled,
    #[error("{0}")]
    Api(String),
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

pub mod apply;
pub mod config;
pub mod legacy;
pub mod orchestrator;
pub mod ordering;
pub mod progress;
pub mod provenance;
pub mod purge;
pub mod registry;
pub mod snapshot;
pub mod store;

pub use config::RestoreConfig;
pub use orchestrator::{RestoreService, RestoreSummary};
pub use progress::{RestoreProgress, RestoreStatus};
pub use registry::EntityRegistry;

// === Core data structures ===

/// Primary key of a snapshot record, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Int(i64),
    Text(String),
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(value) => write!(f, "{value}"),
            PrimaryKey::Text(value) => f.write_str(value),
        }
    }
}

/// One typed row-equivalent unit of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    /// Zero-based position in the snapshot stream.
    pub index: usize,
    pub entity_type: String,
    pub primary_key: Option<PrimaryKey>,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests;
