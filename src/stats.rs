//! Vector coverage overview.
//!
//! Prints, per record kind, the row count, how many rows carry a vector,
//! and how many are flagged processed. At rest the three agree once every
//! record is vectorized; vectors and flags must agree at all times.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::models::RecordKind;
use crate::progress::{check_consistency, format_number};
use crate::sqlite_store::SqliteStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect_existing(config).await?;
    let store = SqliteStore::new(pool);

    let report = check_consistency(&store, &RecordKind::ALL, config.embedding.dims).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("vectorize coverage");
    println!("==================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Dimensions:  {}", config.embedding.dims);
    println!();
    println!(
        "  {:<8} {:>10} {:>10} {:>10} {:>10}   {}",
        "KIND", "ROWS", "VECTORS", "FLAGGED", "WRONG DIM", "STATUS"
    );
    println!("  {}", "-".repeat(70));

    for (kind, c) in &report.kinds {
        let status = if !c.is_consistent() {
            "MISMATCH".to_string()
        } else if c.is_complete() {
            "complete".to_string()
        } else {
            format!("{} pending", format_number(c.remaining() as u64))
        };
        println!(
            "  {:<8} {:>10} {:>10} {:>10} {:>10}   {}",
            kind.as_str(),
            format_number(c.total as u64),
            format_number(c.with_vector as u64),
            format_number(c.flagged as u64),
            format_number(c.wrong_dims as u64),
            status
        );
    }

    let totals = report.totals();
    println!();
    println!(
        "  Coverage:    {} / {} ({}%)",
        totals.with_vector,
        totals.total,
        if totals.total > 0 {
            (totals.with_vector * 100) / totals.total
        } else {
            0
        }
    );
    println!(
        "  Invariant:   {}",
        if report.is_consistent() { "ok" } else { "VIOLATED" }
    );
    println!();

    store.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
