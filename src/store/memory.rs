//! In-memory [`Store`] implementation for tests and dry experiments.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`. Faults can be
//! injected per record (failed writes) or globally (unreachable store) to
//! exercise the pipeline's isolation and fatal paths.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{ConsistencyCounts, RecordKey, RecordKind, VectorizableRecord};

use super::{merge_by_recency, Store};

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<Vec<VectorizableRecord>>,
    failing_writes: RwLock<HashSet<RecordKey>>,
    unreachable: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `records`, stored as given.
    pub fn with_records(records: Vec<VectorizableRecord>) -> Self {
        let store = Self::new();
        for r in records {
            store.insert(r);
        }
        store
    }

    /// Insert or replace a record verbatim (vector and flag included).
    pub fn insert(&self, record: VectorizableRecord) {
        if let Ok(mut records) = self.records.write() {
            records.retain(|r| r.key != record.key);
            records.push(record);
        }
    }

    /// Make every subsequent write for `key` fail.
    pub fn fail_writes_for(&self, key: RecordKey) {
        if let Ok(mut failing) = self.failing_writes.write() {
            failing.insert(key);
        }
    }

    /// Simulate a store that cannot be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Snapshot of a record by key.
    pub fn get(&self, key: &RecordKey) -> Option<VectorizableRecord> {
        self.read().ok()?.iter().find(|r| &r.key == key).cloned()
    }

    /// Number of successful `store_vector` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<VectorizableRecord>>> {
        self.records
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<VectorizableRecord>>> {
        self.records
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("in-memory store is unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn select_unprocessed(
        &self,
        limit: usize,
        kind: Option<RecordKind>,
    ) -> Result<Vec<VectorizableRecord>> {
        self.check_reachable()?;
        let records = self.read()?;
        let pending: Vec<VectorizableRecord> = records
            .iter()
            .filter(|r| r.vector.is_none())
            .filter(|r| kind.map_or(true, |k| r.key.kind == k))
            .cloned()
            .collect();
        Ok(merge_by_recency(pending, limit))
    }

    async fn store_vector(&self, key: &RecordKey, vector: &[f32]) -> Result<()> {
        self.check_reachable()?;
        let failing = self
            .failing_writes
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?
            .contains(key);
        if failing {
            bail!("injected write failure");
        }

        let mut records = self.write()?;
        let record = records
            .iter_mut()
            .find(|r| &r.key == key)
            .ok_or_else(|| anyhow!("record {} not found", key))?;
        record.vector = Some(vector.to_vec());
        record.processed = true;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consistency(&self, kind: RecordKind, dims: usize) -> Result<ConsistencyCounts> {
        self.check_reachable()?;
        let records = self.read()?;
        let mut counts = ConsistencyCounts::default();
        for r in records.iter().filter(|r| r.key.kind == kind) {
            counts.total += 1;
            if let Some(v) = &r.vector {
                counts.with_vector += 1;
                if v.len() != dims {
                    counts.wrong_dims += 1;
                }
            }
            if r.processed {
                counts.flagged += 1;
            }
        }
        Ok(counts)
    }

    async fn clear_vectors(&self, kind: Option<RecordKind>) -> Result<u64> {
        self.check_reachable()?;
        let mut records = self.write()?;
        let mut cleared = 0;
        for r in records
            .iter_mut()
            .filter(|r| kind.map_or(true, |k| r.key.kind == k))
        {
            if r.vector.is_some() || r.processed {
                cleared += 1;
            }
            r.vector = None;
            r.processed = false;
        }
        Ok(cleared)
    }
}
