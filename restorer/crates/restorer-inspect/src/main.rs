use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use restorer::snapshot::SnapshotReader;
use restorer::{EntityRegistry, RestoreConfig};

/// Decodes a restore snapshot without touching any database.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Snapshot file (JSON, optionally gzip compressed).
    #[arg(long)]
    path: PathBuf,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// TOML file with restore settings (size limits).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    records: usize,
    compressed: bool,
    sha256: String,
    counts: BTreeMap<String, usize>,
    insert_order: Vec<String>,
    unresolvable_types: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RestoreConfig::load_from_path(path)?,
        None => RestoreConfig::default(),
    };

    let snapshot = SnapshotReader::new(&config)
        .open(&cli.path, |_| Ok(()))
        .with_context(|| format!("failed to read snapshot: {}", cli.path.display()))?;

    let registry = EntityRegistry::builtin();
    let mut counts = BTreeMap::new();
    for slot in snapshot.slots() {
        *counts.entry(slot.entity_type.clone()).or_insert(0) += 1;
    }
    let (known, unresolvable): (Vec<String>, Vec<String>) = snapshot
        .distinct_types()
        .into_iter()
        .partition(|entity_type| registry.contains(entity_type));

    let report = Report {
        records: snapshot.len(),
        compressed: snapshot.source().compressed,
        sha256: snapshot.source().sha256.clone(),
        counts,
        insert_order: registry.order(&known).insert_order,
        unresolvable_types: unresolvable,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{} records, sha256 {}", report.records, report.sha256);
    if report.compressed {
        println!("gzip compressed");
    }
    for (entity_type, count) in &report.counts {
        println!("  {entity_type:<28} {count:>8}");
    }
    println!("insert order: {}", report.insert_order.join(" -> "));
    if !report.unresolvable_types.is_empty() {
        println!("unresolvable: {}", report.unresolvable_types.join(", "));
    }
    Ok(())
}
