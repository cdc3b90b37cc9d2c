//! End-to-end runs of the pipeline against a SQLite database on disk.
//!
//! The embedding provider is a scripted in-process fake so the tests are
//! hermetic; everything else (schema, selection SQL, writes, counts) is
//! the production code path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crm_vectorize::config::{parse_config, Config};
use crm_vectorize::embedding::{blob_to_vec, Embedder, EmbeddingClient, EmbeddingRequest};
use crm_vectorize::models::{RecordKey, RecordKind};
use crm_vectorize::pacing::FixedDelay;
use crm_vectorize::progress::NoProgress;
use crm_vectorize::sqlite_store::SqliteStore;
use crm_vectorize::{db, migrate, Pipeline, ProviderError, RunOptions, Store};
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

const DIMS: usize = 16;

/// Fake provider: fails for inputs containing any poison marker, records inputs.
struct FakeProvider {
    poison: Vec<String>,
    inputs: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Embedder for FakeProvider {
    fn model_name(&self) -> &str {
        "fake-embed"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, request: &EmbeddingRequest<'_>) -> Result<Vec<f32>, ProviderError> {
        self.inputs.lock().unwrap().push(request.input.to_string());
        if self.poison.iter().any(|p| request.input.contains(p.as_str())) {
            return Err(ProviderError::Status {
                status: 503,
                body: "upstream unavailable".to_string(),
            });
        }
        let seed = request.input.len() as f32;
        Ok((0..request.dims).map(|i| (seed + i as f32).sin()).collect())
    }
}

struct Env {
    _tmp: TempDir,
    config: Config,
    store: SqliteStore,
}

impl Env {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let config = parse_config(&format!(
            "[db]\npath = \"{}/crm.sqlite\"\n[embedding]\ndims = {}\n",
            tmp.path().display(),
            DIMS
        ))
        .unwrap();
        migrate::run_migrations(&config).await.unwrap();
        let pool = db::connect_existing(&config).await.unwrap();
        Env {
            _tmp: tmp,
            config,
            store: SqliteStore::new(pool),
        }
    }

    fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    async fn seed_people(&self) {
        sqlx::query("INSERT INTO organizations (id, name) VALUES ('o1', 'Acme Corp'), ('o2', 'Globex')")
            .execute(self.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO contacts (id, name, email, organization_id) VALUES \
             ('p1', 'Dana Reyes', 'dana@acme.io', 'o1'), ('p2', NULL, 'ops@globex.com', NULL)",
        )
        .execute(self.pool())
        .await
        .unwrap();
        sqlx::query("INSERT INTO deals (id, title, organization_id) VALUES ('d1', 'Globex pilot', 'o2')")
            .execute(self.pool())
            .await
            .unwrap();
    }

    async fn add_call(&self, id: &str, transcript: &str, ts: i64) {
        sqlx::query(
            "INSERT INTO calls (id, title, transcript, contact_id, deal_id, occurred_at) \
             VALUES (?, ?, ?, NULL, NULL, ?)",
        )
        .bind(id)
        .bind(format!("Call {}", id))
        .bind(transcript)
        .bind(ts)
        .execute(self.pool())
        .await
        .unwrap();
    }

    async fn add_email(&self, id: &str, direction: &str, contact: Option<&str>, deal: Option<&str>, body: &str, ts: i64) {
        sqlx::query(
            "INSERT INTO emails (id, subject, body, direction, contact_id, deal_id, sent_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(format!("Re: {}", id))
        .bind(body)
        .bind(direction)
        .bind(contact)
        .bind(deal)
        .bind(ts)
        .execute(self.pool())
        .await
        .unwrap();
    }

    /// (embedding present, embedded flag) for one row.
    async fn state(&self, kind: RecordKind, id: &str) -> (Option<Vec<f32>>, bool) {
        let row = sqlx::query(&format!(
            "SELECT embedding, embedded FROM {} WHERE id = ?",
            kind.table()
        ))
        .bind(id)
        .fetch_one(self.pool())
        .await
        .unwrap();
        let blob: Option<Vec<u8>> = row.get("embedding");
        let flag: i64 = row.get("embedded");
        (blob.map(|b| blob_to_vec(&b)), flag != 0)
    }

    fn client(&self, poison: &[&str]) -> (EmbeddingClient, Arc<Mutex<Vec<String>>>) {
        let inputs = Arc::new(Mutex::new(Vec::new()));
        let provider = FakeProvider {
            poison: poison.iter().map(|s| s.to_string()).collect(),
            inputs: Arc::clone(&inputs),
        };
        let client = EmbeddingClient::new(
            Box::new(provider),
            DIMS,
            self.config.embedding.max_input_chars,
            Duration::from_secs(5),
        );
        (client, inputs)
    }
}

async fn run(env: &Env, client: &EmbeddingClient, options: RunOptions) -> crm_vectorize::RunReport {
    let reporter = NoProgress;
    Pipeline::new(
        &env.store,
        client,
        Box::new(FixedDelay::new(Duration::ZERO)),
        &reporter,
    )
    .run(&options)
    .await
    .unwrap()
}

#[tokio::test]
async fn scenario_a_provider_failure_on_middle_record() {
    let env = Env::new().await;
    env.add_call("A", "alpha transcript", 300).await;
    env.add_call("B", "bravo transcript", 200).await;
    env.add_call("C", "charlie transcript", 100).await;

    let (client, _) = env.client(&["bravo"]);
    let report = run(&env, &client, RunOptions::default()).await;

    assert_eq!(report.processed, 2);
    assert_eq!(report.errors, 1);

    let (a, a_flag) = env.state(RecordKind::Call, "A").await;
    let (b, b_flag) = env.state(RecordKind::Call, "B").await;
    let (c, c_flag) = env.state(RecordKind::Call, "C").await;
    assert!(a.is_some() && a_flag);
    assert!(b.is_none() && !b_flag);
    assert!(c.is_some() && c_flag);
}

#[tokio::test]
async fn scenario_b_batch_limit_leaves_rest_for_next_run() {
    let env = Env::new().await;
    for i in 0..5 {
        env.add_call(&format!("c{}", i), "some transcript", 1_000 + i).await;
    }

    let (client, _) = env.client(&[]);
    let options = RunOptions {
        limit: 2,
        ..RunOptions::default()
    };
    let report = run(&env, &client, options.clone()).await;
    assert_eq!(report.processed, 2);

    let counts = env.store.consistency(RecordKind::Call, DIMS).await.unwrap();
    assert_eq!(counts.remaining(), 3);

    // Newest first: c4 and c3 went in the first run
    assert!(env.state(RecordKind::Call, "c4").await.1);
    assert!(env.state(RecordKind::Call, "c3").await.1);
    assert!(!env.state(RecordKind::Call, "c2").await.1);

    let pending = env.store.select_unprocessed(10, None).await.unwrap();
    assert_eq!(pending.len(), 3);
}

#[tokio::test]
async fn second_run_without_new_input_processes_nothing() {
    let env = Env::new().await;
    env.seed_people().await;
    env.add_call("A", "alpha", 10).await;
    env.add_email("E1", "inbound", Some("p1"), None, "hello", 20).await;

    let (client, inputs) = env.client(&[]);
    let first = run(&env, &client, RunOptions::default()).await;
    assert_eq!(first.processed, 2);

    let second = run(&env, &client, RunOptions::default()).await;
    assert_eq!(second.selected, 0);
    assert_eq!(second.processed, 0);
    assert_eq!(second.errors, 0);
    assert_eq!(inputs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn clean_run_completes_every_record_with_configured_dims() {
    let env = Env::new().await;
    env.seed_people().await;
    env.add_call("A", "alpha", 10).await;
    env.add_call("B", "bravo", 11).await;
    env.add_email("E1", "inbound", Some("p1"), None, "hello", 20).await;
    env.add_email("E2", "outbound", Some("p2"), Some("d1"), "invoice", 21).await;

    let (client, _) = env.client(&[]);
    let report = run(&env, &client, RunOptions::default()).await;
    assert_eq!(report.processed, 4);

    for (kind, id) in [
        (RecordKind::Call, "A"),
        (RecordKind::Call, "B"),
        (RecordKind::Email, "E1"),
        (RecordKind::Email, "E2"),
    ] {
        let (vector, flag) = env.state(kind, id).await;
        assert!(flag, "{}:{} not flagged", kind, id);
        assert_eq!(vector.unwrap().len(), DIMS);
    }

    let consistency = report.consistency.unwrap();
    assert!(consistency.is_consistent());
    assert!(consistency.totals().is_complete());
}

#[tokio::test]
async fn selection_joins_related_entities_into_context() {
    let env = Env::new().await;
    env.seed_people().await;
    env.add_email("E1", "inbound", Some("p1"), None, "Can we talk pricing?", 20).await;
    env.add_email("E2", "outbound", Some("p2"), Some("d1"), "Invoice attached.", 10).await;

    let (client, inputs) = env.client(&[]);
    run(&env, &client, RunOptions::default()).await;

    let inputs = inputs.lock().unwrap();
    assert_eq!(inputs.len(), 2);
    assert_eq!(
        inputs[0],
        "Subject: Re: E1\nFrom: Dana Reyes <dana@acme.io>\nOrganization: Acme Corp\nDate: 1970-01-01\n\nCan we talk pricing?"
    );
    // Organization falls back to the deal's organization
    assert_eq!(
        inputs[1],
        "Subject: Re: E2\nTo: ops@globex.com\nOrganization: Globex\nDeal: Globex pilot\nDate: 1970-01-01\n\nInvoice attached."
    );
}

#[tokio::test]
async fn kind_filter_limits_selection() {
    let env = Env::new().await;
    env.add_call("A", "alpha", 10).await;
    env.add_email("E1", "inbound", None, None, "hello", 20).await;

    let (client, _) = env.client(&[]);
    let report = run(
        &env,
        &client,
        RunOptions {
            kind: Some(RecordKind::Call),
            ..RunOptions::default()
        },
    )
    .await;
    assert_eq!(report.processed, 1);
    assert!(env.state(RecordKind::Call, "A").await.1);
    assert!(!env.state(RecordKind::Email, "E1").await.1);
}

#[tokio::test]
async fn oversized_transcript_is_truncated_identically_across_runs() {
    let env = Env::new().await;
    let huge = "lorem ipsum dolor sit amet ".repeat(1_000);
    env.add_call("big", &huge, 10).await;

    let (client, inputs) = env.client(&["lorem"]);
    run(&env, &client, RunOptions::default()).await;
    run(&env, &client, RunOptions::default()).await;

    let inputs = inputs.lock().unwrap();
    assert_eq!(inputs.len(), 2, "failed record is retried by the next run");
    assert_eq!(inputs[0], inputs[1]);
    assert_eq!(inputs[0].chars().count(), env.config.embedding.max_input_chars);
}

#[tokio::test]
async fn out_of_range_timestamp_drops_the_date_line() {
    let env = Env::new().await;
    env.add_call("far", "distant transcript", i64::MAX).await;

    let pending = env.store.select_unprocessed(10, None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].occurred_at.is_none());

    let (client, inputs) = env.client(&[]);
    let report = run(&env, &client, RunOptions::default()).await;
    assert_eq!(report.processed, 1);
    assert_eq!(
        inputs.lock().unwrap()[0],
        "Call: Call far\n\ndistant transcript"
    );
}

#[tokio::test]
async fn rebuild_clears_vector_and_flag_together() {
    let env = Env::new().await;
    env.add_call("A", "alpha", 10).await;
    env.add_email("E1", "inbound", None, None, "hello", 20).await;

    let (client, _) = env.client(&[]);
    run(&env, &client, RunOptions::default()).await;

    let cleared = env.store.clear_vectors(Some(RecordKind::Email)).await.unwrap();
    assert_eq!(cleared, 1);
    assert_eq!(env.state(RecordKind::Email, "E1").await, (None, false));
    assert!(env.state(RecordKind::Call, "A").await.1);

    let counts = env.store.consistency(RecordKind::Email, DIMS).await.unwrap();
    assert!(counts.is_consistent());
    assert_eq!(counts.remaining(), 1);
}

#[tokio::test]
async fn consistency_check_flags_half_applied_write() {
    let env = Env::new().await;
    env.add_call("A", "alpha", 10).await;
    sqlx::query("UPDATE calls SET embedded = 1 WHERE id = 'A'")
        .execute(env.pool())
        .await
        .unwrap();

    let counts = env.store.consistency(RecordKind::Call, DIMS).await.unwrap();
    assert_eq!((counts.total, counts.with_vector, counts.flagged), (1, 0, 1));
    assert!(!counts.is_consistent());
}

#[tokio::test]
async fn write_to_vanished_record_fails() {
    let env = Env::new().await;
    let err = env
        .store
        .store_vector(&RecordKey::new(RecordKind::Call, "ghost"), &[0.0; DIMS])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}
