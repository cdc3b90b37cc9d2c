//! `vectorize run` and `vectorize rebuild`.
//!
//! Wires config, store, embedding client, pacer, and progress reporter into
//! a [`Pipeline`] and prints the run summary on stdout.

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::embedding::EmbeddingClient;
use crate::error::FatalError;
use crate::models::RecordKind;
use crate::pacing;
use crate::pipeline::{self, CancelFlag, Pipeline, RunOptions, RunReport};
use crate::progress::ProgressMode;
use crate::sqlite_store::SqliteStore;
use crate::store::Store;

/// Command-line overrides for a run.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub limit: Option<usize>,
    pub kind: Option<RecordKind>,
    pub drain: bool,
    pub dry_run: bool,
}

impl RunArgs {
    fn options(&self, config: &Config) -> RunOptions {
        RunOptions {
            limit: self.limit.unwrap_or(config.pipeline.batch_limit).max(1),
            kind: self.kind,
            drain: self.drain,
            status_every: config.pipeline.status_every,
        }
    }
}

/// Vectorize pending records.
///
/// Returns an error only for fatal conditions; per-record failures are
/// counted in the summary and leave the exit status untouched.
pub async fn run_vectorize(
    config: &Config,
    args: &RunArgs,
    progress: ProgressMode,
    cancel: CancelFlag,
) -> Result<()> {
    let options = args.options(config);

    let pool = db::connect_existing(config)
        .await
        .map_err(FatalError::store)?;
    let store = SqliteStore::new(pool);

    if args.dry_run {
        let pending = pipeline::preview(&store, &options).await?;
        println!("vectorize (dry-run)");
        println!("  records that would be attempted: {}", pending.len());
        for kind in RecordKind::ALL {
            let n = pending.iter().filter(|k| k.kind == kind).count();
            if n > 0 {
                println!("    {}: {}", kind, n);
            }
        }
        store.close().await;
        return Ok(());
    }

    let client = EmbeddingClient::from_config(&config.embedding)
        .map_err(|e| FatalError::Provider(format!("{:#}", e)))?;
    let reporter = progress.reporter();

    let pacer = pacing::from_config(&config.pacing);

    let result = Pipeline::new(&store, &client, pacer, reporter.as_ref())
        .with_cancel(cancel)
        .run(&options)
        .await;
    store.close().await;

    let report = result?;
    print_summary(&report);
    Ok(())
}

/// Clear vectors (and flags) for the selected kinds, then drain.
pub async fn run_rebuild(
    config: &Config,
    kind: Option<RecordKind>,
    progress: ProgressMode,
    cancel: CancelFlag,
) -> Result<()> {
    // Fail on provider config before touching any stored vector
    EmbeddingClient::from_config(&config.embedding)
        .map_err(|e| FatalError::Provider(format!("{:#}", e)))?;

    let pool = db::connect_existing(config)
        .await
        .map_err(FatalError::store)?;
    let store = SqliteStore::new(pool);
    let cleared = store
        .clear_vectors(kind)
        .await
        .context("Failed to clear existing vectors")?;
    store.close().await;

    info!(cleared, "cleared stored vectors");
    println!("vectorize rebuild: cleared {} vectors", cleared);

    let args = RunArgs {
        kind,
        drain: true,
        ..RunArgs::default()
    };
    run_vectorize(config, &args, progress, cancel).await
}

pub fn print_summary(report: &RunReport) {
    println!("vectorize");
    if report.cancelled {
        println!("  status: cancelled");
    }
    println!("  started: {}", report.started_at.to_rfc3339_opts(SecondsFormat::Secs, true));
    println!("  passes: {}", report.passes);
    println!("  selected: {}", report.selected);
    println!("  processed: {}", report.processed);
    println!("  errors: {}", report.errors);
    println!("  elapsed: {:.1}s", report.elapsed.as_secs_f64());

    if !report.failures.is_empty() {
        println!("  failed records:");
        for f in report.failures.iter().take(20) {
            println!("    {}  {}", f.key, f.error);
        }
        if report.failures.len() > 20 {
            println!("    ... and {} more", report.failures.len() - 20);
        }
    }

    if let Some(consistency) = &report.consistency {
        println!("  consistency:");
        for (kind, c) in &consistency.kinds {
            println!(
                "    {:<6} rows: {}  vectors: {}  flagged: {}{}",
                kind,
                c.total,
                c.with_vector,
                c.flagged,
                if c.is_consistent() { "" } else { "  MISMATCH" }
            );
        }
        let totals = consistency.totals();
        if totals.is_complete() {
            println!("  all records vectorized");
        } else if consistency.is_consistent() {
            println!("  remaining: {}", totals.remaining());
        }
    }
}
