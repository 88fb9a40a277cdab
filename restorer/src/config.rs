// restorer/src/config.rs
//!
//! Restore configuration: tunables for a restore job
//!
//! Loaded from a TOML file (see `config/restore.toml` at the repository
//! root). Every key is optional; missing keys fall back to the defaults
//! below, and callers without a file use `RestoreConfig::default()`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::Error;

pub const DEFAULT_MAX_SNAPSHOT_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_DECODED_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_READ_CHUNK_BYTES: usize = 1024 * 1024;

/// How foreign-key checking is relaxed while records are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintMode {
    /// Checks run at each record's commit instead of per statement.
    #[default]
    Deferred,
    /// Checks are switched off on the job's connection for the apply window.
    Disabled,
}

/// What the applier does when a referenced row does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingReferencePolicy {
    /// Leave it to the foreign-key check; the record fails.
    #[default]
    Reject,
    /// Insert a minimal placeholder row for the missing target first.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Ceiling on the size of the snapshot file as stored (compressed or not).
    pub max_snapshot_bytes: u64,
    /// Ceiling on the decoded size, guards against decompression bombs.
    pub max_decoded_bytes: u64,
    pub read_chunk_bytes: usize,
    /// Durable progress writes happen at most once per this many records.
    pub progress_flush_interval: u64,
    pub error_report_limit: usize,
    pub error_message_max_chars: usize,
    pub enable_second_pass: bool,
    pub constraint_mode: ConstraintMode,
    pub missing_reference: MissingReferencePolicy,
    /// Added on top of the built-in protected types, never replacing them.
    pub extra_protected_types: Vec<String>,
    pub stale_after_secs: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            max_snapshot_bytes: DEFAULT_MAX_SNAPSHOT_BYTES,
            max_decoded_bytes: DEFAULT_MAX_DECODED_BYTES,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            progress_flush_interval: 25,
            error_report_limit: 20,
            error_message_max_chars: 300,
            enable_second_pass: true,
            constraint_mode: ConstraintMode::default(),
            missing_reference: MissingReferencePolicy::default(),
            extra_protected_types: Vec::new(),
            stale_after_secs: 300,
        }
    }
}

impl RestoreConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|err| {
            Error::Api(format!(
                "failed to read restore config {}: {err}",
                path.display()
            ))
        })?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self, Error> {
        let config: RestoreConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.read_chunk_bytes == 0 {
            return Err(Error::Api(
                "read_chunk_bytes must be greater than zero".to_string(),
            ));
        }
        if self.progress_flush_interval == 0 {
            return Err(Error::Api(
                "progress_flush_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RestoreConfig::load_from_str("").unwrap();
        assert_eq!(config, RestoreConfig::default());
        assert_eq!(config.max_snapshot_bytes, 50 * 1024 * 1024);
        assert_eq!(config.error_report_limit, 20);
        assert!(config.enable_second_pass);
        assert_eq!(config.constraint_mode, ConstraintMode::Deferred);
        assert_eq!(config.missing_reference, MissingReferencePolicy::Reject);
    }

    #[test]
    fn partial_document_overrides_selected_keys() {
        let toml = r#"
progress_flush_interval = 10
constraint_mode = "disabled"
missing_reference = "placeholder"
extra_protected_types = ["billing.invoice"]
"#;

        let config = RestoreConfig::load_from_str(toml).unwrap();
        assert_eq!(config.progress_flush_interval, 10);
        assert_eq!(config.constraint_mode, ConstraintMode::Disabled);
        assert_eq!(config.missing_reference, MissingReferencePolicy::Placeholder);
        assert_eq!(config.extra_protected_types, vec!["billing.invoice"]);
        assert_eq!(config.read_chunk_bytes, DEFAULT_READ_CHUNK_BYTES);
    }

    #[test]
    fn unknown_constraint_mode_is_rejected() {
        let err = RestoreConfig::load_from_str("constraint_mode = \"replica\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let err = RestoreConfig::load_from_str("read_chunk_bytes = 0").unwrap_err();
        assert!(err.to_string().contains("read_chunk_bytes"));
    }
}
