//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the CRM schema created by
//! [`migrate`](crate::migrate). Every write is a single `UPDATE` statement,
//! so a record's vector and its `embedded` flag change together or not at
//! all, and no transaction ever spans two records.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::embedding::vec_to_blob;
use crate::models::{
    ConsistencyCounts, EmailDirection, RecordContext, RecordKey, RecordKind, VectorizableRecord,
};
use crate::store::{kinds_for, merge_by_recency, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Release pooled connections at the end of a run.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn select_calls(&self, limit: i64) -> Result<Vec<VectorizableRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.title, c.transcript, c.occurred_at,
                   ct.name AS contact_name, ct.email AS contact_email,
                   COALESCE(co.name, dor.name) AS organization,
                   d.title AS deal_title
            FROM calls c
            LEFT JOIN contacts ct ON ct.id = c.contact_id
            LEFT JOIN organizations co ON co.id = ct.organization_id
            LEFT JOIN deals d ON d.id = c.deal_id
            LEFT JOIN organizations dor ON dor.id = d.organization_id
            WHERE c.embedding IS NULL
            ORDER BY c.occurred_at DESC, c.id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let key = RecordKey::new(RecordKind::Call, row.get::<String, _>("id"));
                let occurred_at = timestamp(&key, row.get("occurred_at"));
                Ok(VectorizableRecord {
                    key,
                    primary_text: row.get("transcript"),
                    context: RecordContext {
                        subject: row.get("title"),
                        direction: None,
                        ..joined_context(row)
                    },
                    occurred_at,
                    vector: None,
                    processed: false,
                })
            })
            .collect()
    }

    async fn select_emails(&self, limit: i64) -> Result<Vec<VectorizableRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.subject, e.body, e.direction, e.sent_at,
                   ct.name AS contact_name, ct.email AS contact_email,
                   COALESCE(co.name, dor.name) AS organization,
                   d.title AS deal_title
            FROM emails e
            LEFT JOIN contacts ct ON ct.id = e.contact_id
            LEFT JOIN organizations co ON co.id = ct.organization_id
            LEFT JOIN deals d ON d.id = e.deal_id
            LEFT JOIN organizations dor ON dor.id = d.organization_id
            WHERE e.embedding IS NULL
            ORDER BY e.sent_at DESC, e.id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let direction: String = row.get("direction");
                let direction = direction
                    .parse::<EmailDirection>()
                    .map_err(anyhow::Error::msg)?;
                let key = RecordKey::new(RecordKind::Email, row.get::<String, _>("id"));
                let occurred_at = timestamp(&key, row.get("sent_at"));
                Ok(VectorizableRecord {
                    key,
                    primary_text: row.get("body"),
                    context: RecordContext {
                        subject: row.get("subject"),
                        direction: Some(direction),
                        ..joined_context(row)
                    },
                    occurred_at,
                    vector: None,
                    processed: false,
                })
            })
            .collect()
    }
}

fn joined_context(row: &SqliteRow) -> RecordContext {
    RecordContext {
        subject: None,
        contact_name: row.get("contact_name"),
        contact_email: row.get("contact_email"),
        organization: row.get("organization"),
        deal: row.get("deal_title"),
        direction: None,
    }
}

fn timestamp(key: &RecordKey, ts: i64) -> Option<DateTime<Utc>> {
    let at = DateTime::from_timestamp(ts, 0);
    if at.is_none() {
        warn!(record = %key, ts, "timestamp out of range, omitting date");
    }
    at
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn select_unprocessed(
        &self,
        limit: usize,
        kind: Option<RecordKind>,
    ) -> Result<Vec<VectorizableRecord>> {
        let limit_val = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut records = Vec::new();
        for kind in kinds_for(kind) {
            let batch = match kind {
                RecordKind::Call => self.select_calls(limit_val).await?,
                RecordKind::Email => self.select_emails(limit_val).await?,
            };
            records.extend(batch);
        }
        Ok(merge_by_recency(records, limit))
    }

    async fn store_vector(&self, key: &RecordKey, vector: &[f32]) -> Result<()> {
        let blob = vec_to_blob(vector);
        let sql = format!(
            "UPDATE {} SET embedding = ?, embedded = 1 WHERE id = ?",
            key.kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(&blob)
            .bind(&key.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            bail!("record {} not found", key);
        }
        Ok(())
    }

    async fn consistency(&self, kind: RecordKind, dims: usize) -> Result<ConsistencyCounts> {
        let sql = format!(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(embedding) AS with_vector,
                   COALESCE(SUM(CASE WHEN embedded != 0 THEN 1 ELSE 0 END), 0) AS flagged,
                   COALESCE(SUM(CASE WHEN embedding IS NOT NULL AND length(embedding) != ? THEN 1 ELSE 0 END), 0) AS wrong_dims
            FROM {}
            "#,
            kind.table()
        );
        let row = sqlx::query(&sql)
            .bind((dims * 4) as i64)
            .fetch_one(&self.pool)
            .await?;

        Ok(ConsistencyCounts {
            total: row.get("total"),
            with_vector: row.get("with_vector"),
            flagged: row.get("flagged"),
            wrong_dims: row.get("wrong_dims"),
        })
    }

    async fn clear_vectors(&self, kind: Option<RecordKind>) -> Result<u64> {
        let mut cleared = 0;
        for kind in kinds_for(kind) {
            let sql = format!(
                "UPDATE {} SET embedding = NULL, embedded = 0 WHERE embedding IS NOT NULL OR embedded != 0",
                kind.table()
            );
            cleared += sqlx::query(&sql)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(cleared)
    }
}
