//! # `vectorize`
//!
//! Backfills embedding vectors for CRM call transcripts and emails.
//!
//! ```bash
//! vectorize                       # one pass with config defaults
//! vectorize run --drain           # keep going until nothing is pending
//! vectorize run --kind email --limit 100
//! vectorize stats                 # coverage and invariant check
//! ```
//!
//! Safe to schedule repeatedly: a run with nothing pending changes nothing.
//! The exit status is non-zero only when the run could not start (bad
//! config, unreachable store); individual record failures are reported in
//! the summary and retried by the next run.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use crm_vectorize::embed_cmd::{self, RunArgs};
use crm_vectorize::models::RecordKind;
use crm_vectorize::progress::ProgressMode;
use crm_vectorize::{config, migrate, stats, CancelFlag};

#[derive(Parser)]
#[command(
    name = "vectorize",
    about = "Incremental embedding backfill for CRM call transcripts and emails",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vectorize.toml")]
    config: PathBuf,

    /// Progress output on stderr: auto, human, json, or off.
    #[arg(long, global = true, default_value = "auto", value_parser = ProgressMode::parse)]
    progress: ProgressMode,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the CRM tables used by the pipeline. Idempotent.
    Init,

    /// Vectorize pending records (the default command).
    Run {
        /// Maximum records per pass (defaults to `pipeline.batch_limit`).
        #[arg(long)]
        limit: Option<usize>,

        /// Only process one kind of record: `call` or `email`.
        #[arg(long)]
        kind: Option<RecordKind>,

        /// Keep running passes until no new pending records remain.
        #[arg(long)]
        drain: bool,

        /// Show what would be attempted without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear stored vectors and re-embed everything.
    ///
    /// Use after switching embedding model or dimensionality.
    Rebuild {
        #[arg(long)]
        kind: Option<RecordKind>,
    },

    /// Show vector coverage and check the vector/flag invariant.
    Stats,
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run().await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run {
        limit: None,
        kind: None,
        drain: false,
        dry_run: false,
    }) {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Run {
            limit,
            kind,
            drain,
            dry_run,
        } => {
            let args = RunArgs {
                limit,
                kind,
                drain,
                dry_run,
            };
            embed_cmd::run_vectorize(&cfg, &args, cli.progress, cancel_on_ctrl_c()).await?;
        }
        Commands::Rebuild { kind } => {
            embed_cmd::run_rebuild(&cfg, kind, cli.progress, cancel_on_ctrl_c()).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

/// A cancel flag that trips on Ctrl-C; the run stops after the current record.
fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current record");
            flag.cancel();
        }
    });
    cancel
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_writer(std::io::stderr)
        .init();
}
