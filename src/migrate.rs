use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the CRM tables this pipeline reads and writes. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            name TEXT,
            email TEXT,
            organization_id TEXT,
            FOREIGN KEY (organization_id) REFERENCES organizations(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deals (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            organization_id TEXT,
            FOREIGN KEY (organization_id) REFERENCES organizations(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector presence is the processed marker; `embedded` mirrors it so the
    // consistency check can detect a half-applied write.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
            id TEXT PRIMARY KEY,
            title TEXT,
            transcript TEXT NOT NULL,
            contact_id TEXT,
            deal_id TEXT,
            occurred_at INTEGER NOT NULL,
            embedding BLOB,
            embedded INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (contact_id) REFERENCES contacts(id),
            FOREIGN KEY (deal_id) REFERENCES deals(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS emails (
            id TEXT PRIMARY KEY,
            subject TEXT,
            body TEXT NOT NULL,
            direction TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')),
            contact_id TEXT,
            deal_id TEXT,
            sent_at INTEGER NOT NULL,
            embedding BLOB,
            embedded INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (contact_id) REFERENCES contacts(id),
            FOREIGN KEY (deal_id) REFERENCES deals(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Partial indexes keep pending-row selection cheap once most rows are done
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_calls_pending ON calls(occurred_at DESC, id) WHERE embedding IS NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_emails_pending ON emails(sent_at DESC, id) WHERE embedding IS NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}
