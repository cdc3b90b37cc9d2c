//! The run controller: one idempotent vectorization pass.
//!
//! ```text
//! SELECTING ─▶ PROCESSING(0) ─▶ PROCESSING(1) ─▶ … ─▶ DONE
//!                  │ success: vector stored
//!                  │ failure: logged, record left pending
//! ```
//!
//! Each selected record is built into a context blob, embedded, and written
//! back with one atomic update. A failure on one record is recorded and the
//! pass moves on; the next invocation retries it, because a record without a
//! vector is by definition still pending. Only a store that cannot be
//! reached or queried aborts the run, and it does so before any record is
//! touched.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::context::build_context;
use crate::embedding::EmbeddingClient;
use crate::error::{FatalError, PersistenceError, ProviderError, RecordError};
use crate::models::{RecordKey, RecordKind, VectorizableRecord};
use crate::pacing::{CallOutcome, Pacer};
use crate::progress::{check_consistency, ConsistencyReport, ProgressTracker, RunProgressReporter};
use crate::store::{kinds_for, Store};

/// Cooperative cancellation, checked between records.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum records selected per pass.
    pub limit: usize,
    pub kind: Option<RecordKind>,
    /// Keep running passes until nothing new is left to attempt.
    pub drain: bool,
    /// Emit a status event every this many attempted records.
    pub status_every: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: 500,
            kind: None,
            drain: false,
            status_every: 25,
        }
    }
}

/// A record that could not be vectorized in this run.
#[derive(Debug)]
pub struct RecordFailure {
    pub key: RecordKey,
    pub error: RecordError,
}

/// State of a single pass.
#[derive(Debug)]
pub struct BatchRun {
    pub selected: Vec<RecordKey>,
    pub processed: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
}

/// Outcome of a whole invocation (one pass, or several with `drain`).
#[derive(Debug)]
pub struct RunReport {
    pub passes: u32,
    pub selected: u64,
    pub processed: u64,
    pub errors: u64,
    pub failures: Vec<RecordFailure>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// `None` if the counts could not be read after the run.
    pub consistency: Option<ConsistencyReport>,
}

pub struct Pipeline<'a> {
    store: &'a dyn Store,
    client: &'a EmbeddingClient,
    pacer: Box<dyn Pacer>,
    reporter: &'a dyn RunProgressReporter,
    cancel: CancelFlag,
    /// Delay still owed before the next provider call, and when it started.
    owed: Option<(Instant, Duration)>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        store: &'a dyn Store,
        client: &'a EmbeddingClient,
        pacer: Box<dyn Pacer>,
        reporter: &'a dyn RunProgressReporter,
    ) -> Self {
        Self {
            store,
            client,
            pacer,
            reporter,
            cancel: CancelFlag::new(),
            owed: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one pass (or several, with `options.drain`) to completion.
    ///
    /// # Errors
    ///
    /// [`FatalError`] if the store is unreachable or pending records cannot
    /// be selected. Per-record failures are reported in [`RunReport`] instead.
    pub async fn run(&mut self, options: &RunOptions) -> Result<RunReport, FatalError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        self.store.ping().await.map_err(FatalError::store)?;

        let mut report = RunReport {
            passes: 0,
            selected: 0,
            processed: 0,
            errors: 0,
            failures: Vec::new(),
            cancelled: false,
            started_at,
            elapsed: Duration::ZERO,
            consistency: None,
        };
        // Records that failed earlier in this invocation; never attempted twice
        let mut failed: HashSet<RecordKey> = HashSet::new();

        loop {
            let batch = self.run_pass(options, &mut failed, &mut report).await?;
            report.passes += 1;
            report.selected += batch.selected.len() as u64;
            report.processed += batch.processed;
            report.errors += batch.errors;
            debug!(
                pass = report.passes,
                pass_started = %batch.started_at,
                selected = batch.selected.len(),
                processed = batch.processed,
                errors = batch.errors,
                "pass finished"
            );

            let full_batch = batch.selected.len() >= options.limit;
            if !options.drain || report.cancelled || !full_batch || batch.processed == 0 {
                break;
            }
            debug!(pass = report.passes, "batch was full, draining further");
        }

        let kinds = kinds_for(options.kind);
        report.consistency = match check_consistency(self.store, &kinds, self.client.dims()).await
        {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "could not read consistency counts");
                None
            }
        };
        report.elapsed = clock.elapsed();

        info!(
            passes = report.passes,
            selected = report.selected,
            processed = report.processed,
            errors = report.errors,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "vectorize run finished"
        );
        Ok(report)
    }

    async fn run_pass(
        &mut self,
        options: &RunOptions,
        failed: &mut HashSet<RecordKey>,
        report: &mut RunReport,
    ) -> Result<BatchRun, FatalError> {
        let started_at = Utc::now();

        // SELECTING: over-fetch by the failures to skip so they cannot starve the batch
        let mut records = self
            .store
            .select_unprocessed(options.limit + failed.len(), options.kind)
            .await
            .map_err(FatalError::selection)?;
        records.retain(|r| !failed.contains(&r.key));
        records.truncate(options.limit);

        let selected: Vec<RecordKey> = records.iter().map(|r| r.key.clone()).collect();
        info!(
            selected = selected.len(),
            limit = options.limit,
            kind = options.kind.map(|k| k.as_str()).unwrap_or("all"),
            model = self.client.model_name(),
            "selected records for vectorization"
        );

        let mut tracker =
            ProgressTracker::new(self.reporter, options.status_every, selected.len() as u64);

        // PROCESSING(i)
        for record in records {
            if self.cancel.is_cancelled() {
                warn!("cancellation requested, stopping between records");
                report.cancelled = true;
                break;
            }

            let key = record.key.clone();
            match self.process_record(record).await {
                Ok(()) => {
                    debug!(record = %key, "stored vector");
                    tracker.record_success();
                }
                Err(error) => {
                    warn!(record = %key, kind = error.kind(), error = %error, "record failed, leaving it pending");
                    tracker.record_failure();
                    failed.insert(key.clone());
                    report.failures.push(RecordFailure { key, error });
                }
            }
        }

        // DONE
        let (processed, errors) = tracker.finish(report.cancelled);
        Ok(BatchRun {
            selected,
            processed,
            errors,
            started_at,
        })
    }

    async fn process_record(&mut self, record: VectorizableRecord) -> Result<(), RecordError> {
        let text = build_context(&record);
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyInput.into());
        }

        self.wait_for_pacer().await;
        let result = self.client.embed(&text).await;
        let outcome = if result.is_ok() {
            CallOutcome::Success
        } else {
            CallOutcome::Failure
        };
        self.owed = Some((Instant::now(), self.pacer.next_delay(outcome)));

        let vector = result?;
        self.store
            .store_vector(&record.key, &vector)
            .await
            .map_err(|e| PersistenceError::new(record.key.clone(), e))?;
        Ok(())
    }

    /// Sleep off whatever part of the owed inter-call delay has not yet elapsed.
    async fn wait_for_pacer(&mut self) {
        if let Some((since, delay)) = self.owed.take() {
            let remaining = delay.saturating_sub(since.elapsed());
            if !remaining.is_zero() {
                tokio::time::sleep(remaining).await;
            }
        }
    }
}

/// Records a pass would attempt, without embedding anything.
pub async fn preview(
    store: &dyn Store,
    options: &RunOptions,
) -> Result<Vec<RecordKey>, FatalError> {
    store.ping().await.map_err(FatalError::store)?;
    let records = store
        .select_unprocessed(options.limit, options.kind)
        .await
        .map_err(FatalError::selection)?;
    Ok(records.into_iter().map(|r| r.key).collect())
}
