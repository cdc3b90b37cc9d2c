//! Storage abstraction for the vectorization pipeline.
//!
//! The [`Store`] trait is everything the pipeline needs from the CRM
//! database: a filtered, ordered, limited read of pending records with
//! their display fields pre-joined, a single-row vector write, and
//! aggregate counts for the consistency check.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`ping`](Store::ping) | Verify the store is reachable before a run |
//! | [`select_unprocessed`](Store::select_unprocessed) | Pending records, newest first |
//! | [`store_vector`](Store::store_vector) | Atomically set vector and processed flag |
//! | [`consistency`](Store::consistency) | Total / vector / flag counts per kind |
//! | [`clear_vectors`](Store::clear_vectors) | Reset vectors for a rebuild |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ConsistencyCounts, RecordKey, RecordKind, VectorizableRecord};

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap round-trip proving the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Records with no vector, newest first, at most `limit`, optionally
    /// restricted to one kind. No record appears twice.
    async fn select_unprocessed(
        &self,
        limit: usize,
        kind: Option<RecordKind>,
    ) -> Result<Vec<VectorizableRecord>>;

    /// Set the vector and the processed flag in one atomic update.
    ///
    /// Fails if the record no longer exists.
    async fn store_vector(&self, key: &RecordKey, vector: &[f32]) -> Result<()>;

    /// Aggregate counts for one kind. `dims` is the expected vector length.
    async fn consistency(&self, kind: RecordKind, dims: usize) -> Result<ConsistencyCounts>;

    /// Drop vectors and processed flags together. Returns rows reset.
    async fn clear_vectors(&self, kind: Option<RecordKind>) -> Result<u64>;
}

/// Kinds covered by an optional filter.
pub fn kinds_for(filter: Option<RecordKind>) -> Vec<RecordKind> {
    match filter {
        Some(kind) => vec![kind],
        None => RecordKind::ALL.to_vec(),
    }
}

/// Merge per-kind selections into one stable, newest-first sequence capped at `limit`.
///
/// Ties on recency are broken by kind, then id, so the order is deterministic.
pub fn merge_by_recency(
    mut records: Vec<VectorizableRecord>,
    limit: usize,
) -> Vec<VectorizableRecord> {
    records.sort_by(|a, b| {
        b.occurred_at
            .cmp(&a.occurred_at)
            .then_with(|| a.key.cmp(&b.key))
    });
    records.dedup_by(|a, b| a.key == b.key);
    records.truncate(limit);
    records
}
