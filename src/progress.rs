//! Run progress reporting and the end-of-run consistency check.
//!
//! Progress is emitted on **stderr** so stdout stays reserved for the final
//! summary. [`ProgressTracker`] counts outcomes and emits a status event
//! every `status_every` attempted records; the reporter decides how (or
//! whether) it is rendered.

use std::io::Write;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::models::{ConsistencyCounts, RecordKind};
use crate::store::Store;

/// A single progress event for a vectorization pass.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// Selection finished; `total` records will be attempted.
    Selected { total: u64 },
    /// `n` of `total` records attempted so far.
    Status {
        n: u64,
        total: u64,
        processed: u64,
        errors: u64,
    },
    /// The pass reached its end (or was cancelled between records).
    Finished {
        processed: u64,
        errors: u64,
        cancelled: bool,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "vectorize  125 / 500 records  (123 ok, 2 failed)".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Selected { total } => {
                format!("vectorize  selected {} records\n", format_number(*total))
            }
            RunProgressEvent::Status {
                n,
                total,
                processed,
                errors,
            } => format!(
                "vectorize  {} / {} records  ({} ok, {} failed)\n",
                format_number(*n),
                format_number(*total),
                format_number(*processed),
                format_number(*errors)
            ),
            RunProgressEvent::Finished {
                processed,
                errors,
                cancelled,
            } => format!(
                "vectorize  {}  {} ok, {} failed\n",
                if *cancelled { "cancelled" } else { "done" },
                format_number(*processed),
                format_number(*errors)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Selected { total } => serde_json::json!({
                "event": "progress",
                "phase": "selected",
                "total": total
            }),
            RunProgressEvent::Status {
                n,
                total,
                processed,
                errors,
            } => serde_json::json!({
                "event": "progress",
                "phase": "processing",
                "n": n,
                "total": total,
                "processed": processed,
                "errors": errors
            }),
            RunProgressEvent::Finished {
                processed,
                errors,
                cancelled,
            } => serde_json::json!({
                "event": "progress",
                "phase": "done",
                "processed": processed,
                "errors": errors,
                "cancelled": cancelled
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse a `--progress` value. `auto` defers to [`default_for_tty`](Self::default_for_tty).
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "auto" => Ok(Self::default_for_tty()),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            "off" => Ok(ProgressMode::Off),
            other => Err(format!(
                "invalid progress mode '{}': expected auto, human, json, or off",
                other
            )),
        }
    }

    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Counts outcomes for one pass and emits periodic status.
pub struct ProgressTracker<'a> {
    reporter: &'a dyn RunProgressReporter,
    every: u64,
    total: u64,
    attempted: u64,
    processed: u64,
    errors: u64,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(reporter: &'a dyn RunProgressReporter, every: u64, total: u64) -> Self {
        reporter.report(RunProgressEvent::Selected { total });
        Self {
            reporter,
            every: every.max(1),
            total,
            attempted: 0,
            processed: 0,
            errors: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.advance();
    }

    pub fn record_failure(&mut self) {
        self.errors += 1;
        self.advance();
    }

    fn advance(&mut self) {
        self.attempted += 1;
        if self.attempted % self.every == 0 {
            info!(
                n = self.attempted,
                total = self.total,
                processed = self.processed,
                errors = self.errors,
                "vectorize progress"
            );
            self.reporter.report(RunProgressEvent::Status {
                n: self.attempted,
                total: self.total,
                processed: self.processed,
                errors: self.errors,
            });
        }
    }

    /// Emit the final event and return `(processed, errors)`.
    pub fn finish(self, cancelled: bool) -> (u64, u64) {
        self.reporter.report(RunProgressEvent::Finished {
            processed: self.processed,
            errors: self.errors,
            cancelled,
        });
        (self.processed, self.errors)
    }
}

/// Per-kind counts taken after a pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    pub kinds: Vec<(RecordKind, ConsistencyCounts)>,
}

impl ConsistencyReport {
    pub fn totals(&self) -> ConsistencyCounts {
        self.kinds
            .iter()
            .fold(ConsistencyCounts::default(), |acc, (_, c)| acc + *c)
    }

    pub fn is_consistent(&self) -> bool {
        self.kinds.iter().all(|(_, c)| c.is_consistent())
    }
}

/// Compare total rows, vectors present, and processed flags for each kind.
///
/// Divergence between vectors and flags, or stored vectors of the wrong
/// length, means a write broke the invariant and is logged at error level.
pub async fn check_consistency(
    store: &dyn Store,
    kinds: &[RecordKind],
    dims: usize,
) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport::default();
    for &kind in kinds {
        let counts = store.consistency(kind, dims).await?;
        if counts.with_vector != counts.flagged {
            error!(
                kind = %kind,
                with_vector = counts.with_vector,
                flagged = counts.flagged,
                "vector presence and processed flag disagree"
            );
        }
        if counts.wrong_dims > 0 {
            error!(
                kind = %kind,
                wrong_dims = counts.wrong_dims,
                expected = dims,
                "stored vectors with unexpected dimensionality"
            );
        }
        if counts.is_consistent() && counts.remaining() > 0 {
            warn!(kind = %kind, remaining = counts.remaining(), "records still awaiting vectors");
        }
        report.kinds.push((kind, counts));
    }
    Ok(report)
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<RunProgressEvent>>);

    impl RunProgressReporter for Collecting {
        fn report(&self, event: RunProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn status_every_k_attempts() {
        let sink = Collecting::default();
        let mut tracker = ProgressTracker::new(&sink, 25, 60);
        for i in 0..60 {
            if i % 10 == 3 {
                tracker.record_failure();
            } else {
                tracker.record_success();
            }
        }
        assert_eq!(tracker.finish(false), (54, 6));

        let events = sink.0.lock().unwrap();
        let statuses: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                RunProgressEvent::Status { n, .. } => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![25, 50]);
        assert!(matches!(events[0], RunProgressEvent::Selected { total: 60 }));
        assert!(matches!(
            events.last(),
            Some(RunProgressEvent::Finished {
                processed: 54,
                errors: 6,
                cancelled: false
            })
        ));
    }

    #[test]
    fn progress_mode_parse() {
        assert_eq!(ProgressMode::parse("json").unwrap(), ProgressMode::Json);
        assert_eq!(ProgressMode::parse("off").unwrap(), ProgressMode::Off);
        assert!(ProgressMode::parse("loud").is_err());
    }

    #[test]
    fn report_totals_sum_kinds() {
        let report = ConsistencyReport {
            kinds: vec![
                (
                    RecordKind::Call,
                    ConsistencyCounts {
                        total: 3,
                        with_vector: 3,
                        flagged: 3,
                        wrong_dims: 0,
                    },
                ),
                (
                    RecordKind::Email,
                    ConsistencyCounts {
                        total: 5,
                        with_vector: 2,
                        flagged: 2,
                        wrong_dims: 0,
                    },
                ),
            ],
        };
        let t = report.totals();
        assert_eq!((t.total, t.with_vector, t.flagged), (8, 5, 5));
        assert!(report.is_consistent());
    }
}
