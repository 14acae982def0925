use anyhow::{anyhow, Result};
use serde_json::json;
use sqlx::Row;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use rental_digest::config::{self, Config};
use rental_digest::mailer::{Mailer, OutgoingEmail};
use rental_digest::pipeline::{self, Deps, RunMode};
use rental_digest::scheduler::{self, RunLocks};
use rental_digest::shortlink::ShortLinker;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

#[derive(Clone, Default)]
struct RecordingMailer {
    responses: Arc<Mutex<VecDeque<Result<String>>>>,
    sent: Arc<Mutex<Vec<OutgoingEmail>>>,
}

impl RecordingMailer {
    fn with_responses(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String> {
        let response = self
            .responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok("msg-id".into()));
        if response.is_ok() {
            self.sent.lock().await.push(email.clone());
        }
        response
    }
}

/// Mints a deterministic short URL per listing, failing for chosen ids.
#[derive(Clone, Default)]
struct FakeLinker {
    fail_ids: HashSet<i64>,
}

#[async_trait::async_trait]
impl ShortLinker for FakeLinker {
    async fn mint(&self, _original_url: &str, listing_id: Option<i64>) -> Result<String> {
        match listing_id {
            Some(id) if self.fail_ids.contains(&id) => Err(anyhow!("mint rejected")),
            Some(id) => Ok(format!("https://go.example.com/l{}", id)),
            None => Ok("https://go.example.com/search".into()),
        }
    }
}

fn deps(pool: sqlx::SqlitePool, mailer: RecordingMailer, linker: Option<FakeLinker>) -> Deps {
    Deps {
        locks: RunLocks::new(pool.clone()),
        pool,
        config: Arc::new(test_config()),
        mailer: Arc::new(mailer),
        shortlinker: linker.map(|l| Arc::new(l) as Arc<dyn ShortLinker>),
    }
}

async fn insert_listing(pool: &sqlx::SqlitePool, bedrooms: i64, price: Option<i64>) -> i64 {
    let row = sqlx::query(
        "INSERT INTO listings \
         (approved, active, bedrooms, bathrooms, price, property_type, neighborhood, \
          broker_fee, posted_by, updated_at) \
         VALUES (1, 1, ?, 1, ?, 'apartment', 'Bushwick', 0, 'Acme Realty', ?) RETURNING id",
    )
    .bind(bedrooms)
    .bind(price)
    .bind(chrono::Utc::now())
    .fetch_one(pool)
    .await
    .unwrap();
    row.get("id")
}

async fn insert_template(pool: &sqlx::SqlitePool, delivery_hour: u32, config: serde_json::Value) -> i64 {
    let row = sqlx::query(
        "INSERT INTO digest_templates (name, kind, enabled, delivery_hour, config_json) \
         VALUES ('Daily', 'unsent_only', 1, ?, ?) RETURNING id",
    )
    .bind(delivery_hour as i64)
    .bind(config.to_string())
    .fetch_one(pool)
    .await
    .unwrap();
    row.get("id")
}

async fn insert_recipient(pool: &sqlx::SqlitePool, email: &str) {
    sqlx::query("INSERT INTO recipients (email, active) VALUES (?, 1)")
        .bind(email)
        .execute(pool)
        .await
        .unwrap();
}

fn bedroom_template() -> serde_json::Value {
    json!({
        "kind": "unsent_only",
        "filter": {},
        "categories": {
            "group_by": "bedroom_tier",
            "buckets": [
                { "label": "Studio", "max": 3, "match": "bedrooms", "counts": [0] },
                { "label": "1 Bedroom", "max": 5, "match": "bedrooms", "counts": [1] },
                { "label": "2 Bedroom", "max": 5, "match": "bedrooms", "counts": [2] }
            ]
        }
    })
}

async fn seed_bedroom_mix(pool: &sqlx::SqlitePool) {
    for _ in 0..4 {
        insert_listing(pool, 0, Some(1900)).await;
    }
    for _ in 0..6 {
        insert_listing(pool, 1, Some(2400)).await;
    }
    for _ in 0..2 {
        insert_listing(pool, 2, Some(3100)).await;
    }
}

async fn sent_listing_rows(pool: &sqlx::SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM digest_sent_listings")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn send_records(pool: &sqlx::SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM digest_sends")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn category_caps_trim_each_bucket() {
    let pool = setup_pool().await;
    seed_bedroom_mix(&pool).await;
    insert_recipient(&pool, "a@example.com").await;
    insert_recipient(&pool, "b@example.com").await;
    let template_id = insert_template(&pool, 9, bedroom_template()).await;

    let mailer = RecordingMailer::default();
    let deps = deps(pool.clone(), mailer.clone(), None);
    let report = pipeline::run(&deps, template_id, RunMode::automatic())
        .await
        .unwrap();

    assert!(report.success);
    assert!(report.dispatched);
    assert_eq!(report.listing_count, 10);
    assert_eq!(
        report.category_counts,
        vec![
            ("Studio".to_string(), 3),
            ("1 Bedroom".to_string(), 5),
            ("2 Bedroom".to_string(), 2),
        ]
    );
    assert_eq!(report.recipient_count, 2);

    let sent = mailer.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["a@example.com", "b@example.com"]);
    assert_eq!(sent[0].subject, "[Rentals] Daily: 10 new listings");
    // Every dispatched listing lands in the send history exactly once.
    assert_eq!(sent_listing_rows(&pool).await, 10);
}

#[tokio::test]
async fn second_run_has_nothing_left_to_send() {
    let pool = setup_pool().await;
    seed_bedroom_mix(&pool).await;
    insert_recipient(&pool, "a@example.com").await;
    let template_id = insert_template(&pool, 9, bedroom_template()).await;

    let mailer = RecordingMailer::default();
    let deps = deps(pool.clone(), mailer.clone(), None);
    pipeline::run(&deps, template_id, RunMode::automatic())
        .await
        .unwrap();
    let second = pipeline::run(&deps, template_id, RunMode::automatic())
        .await
        .unwrap();

    assert!(second.success);
    assert_eq!(second.listing_count, 0);
    // Default empty behavior skips the dispatch but still records the run.
    assert!(!second.dispatched);
    assert_eq!(mailer.sent().await.len(), 1);
    assert_eq!(send_records(&pool).await, 2);
}

#[tokio::test]
async fn failed_dispatch_never_marks_listings_sent() {
    let pool = setup_pool().await;
    seed_bedroom_mix(&pool).await;
    insert_recipient(&pool, "a@example.com").await;
    let template_id = insert_template(&pool, 9, bedroom_template()).await;

    let failing = RecordingMailer::with_responses(vec![Err(anyhow!("provider down"))]);
    let deps_fail = deps(pool.clone(), failing, None);
    let report = pipeline::run(&deps_fail, template_id, RunMode::automatic())
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.error.as_deref().unwrap().contains("dispatch failed"));
    assert_eq!(send_records(&pool).await, 1);
    assert_eq!(sent_listing_rows(&pool).await, 0);

    // Nothing was marked, so every listing is still eligible next run.
    let mailer = RecordingMailer::default();
    let deps_ok = deps(pool.clone(), mailer.clone(), None);
    let retry = pipeline::run(&deps_ok, template_id, RunMode::automatic())
        .await
        .unwrap();
    assert!(retry.success);
    assert_eq!(retry.listing_count, 10);
    assert_eq!(mailer.sent().await.len(), 1);
}

#[tokio::test]
async fn preview_body_matches_real_send() {
    let pool = setup_pool().await;
    seed_bedroom_mix(&pool).await;
    insert_recipient(&pool, "a@example.com").await;
    let template_id = insert_template(&pool, 9, bedroom_template()).await;

    let mailer = RecordingMailer::default();
    let deps = deps(pool.clone(), mailer.clone(), Some(FakeLinker::default()));

    let preview = pipeline::run(&deps, template_id, RunMode::manual(true, false))
        .await
        .unwrap();
    assert!(preview.dry_run);
    assert!(!preview.dispatched);
    assert_eq!(mailer.sent().await.len(), 0);
    // A preview leaves no trace in the dedup ledger.
    assert_eq!(sent_listing_rows(&pool).await, 0);

    let real = pipeline::run(&deps, template_id, RunMode::manual(false, false))
        .await
        .unwrap();
    assert!(real.dispatched);

    let sent = mailer.sent().await;
    let preview_body = preview.rendered.unwrap();
    assert_eq!(sent[0].text.as_deref(), Some(preview_body.plain.as_str()));
    assert_eq!(sent[0].html, preview_body.html);
}

#[tokio::test]
async fn mint_failure_falls_back_to_long_url() {
    let pool = setup_pool().await;
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(insert_listing(&pool, 1, Some(2400)).await);
    }
    insert_recipient(&pool, "a@example.com").await;
    let template_id = insert_template(
        &pool,
        9,
        json!({
            "kind": "unsent_only",
            "filter": {},
            "categories": {
                "group_by": "bedroom_tier",
                "buckets": [
                    { "label": "1 Bedroom", "max": 20, "match": "bedrooms", "counts": [1] }
                ]
            }
        }),
    )
    .await;

    let unlucky = ids[2];
    let linker = FakeLinker {
        fail_ids: HashSet::from([unlucky]),
    };
    let mailer = RecordingMailer::default();
    let deps = deps(pool.clone(), mailer.clone(), Some(linker));
    let report = pipeline::run(&deps, template_id, RunMode::automatic())
        .await
        .unwrap();

    // One bad mint degrades a single link, never the run.
    assert!(report.success);
    let body = mailer.sent().await[0].text.clone().unwrap();
    assert!(body.contains(&format!("https://rentals.example.com/listing/{}", unlucky)));
    for id in ids.iter().filter(|id| **id != unlucky) {
        assert!(body.contains(&format!("https://go.example.com/l{}", id)));
    }
}

#[tokio::test]
async fn ignore_history_resends_everything() {
    let pool = setup_pool().await;
    seed_bedroom_mix(&pool).await;
    insert_recipient(&pool, "a@example.com").await;
    let template_id = insert_template(&pool, 9, bedroom_template()).await;

    let mailer = RecordingMailer::default();
    let deps = deps(pool.clone(), mailer.clone(), None);
    pipeline::run(&deps, template_id, RunMode::automatic())
        .await
        .unwrap();

    let resend = pipeline::run(&deps, template_id, RunMode::manual(false, true))
        .await
        .unwrap();
    assert!(resend.success);
    assert_eq!(resend.listing_count, 10);
    assert_eq!(resend.excluded_count, 0);
    assert_eq!(mailer.sent().await.len(), 2);
}

#[tokio::test]
async fn collections_render_with_live_counts() {
    let pool = setup_pool().await;
    for _ in 0..3 {
        insert_listing(&pool, 1, Some(2400)).await;
    }
    insert_recipient(&pool, "a@example.com").await;

    let preset_id: i64 = sqlx::query(
        "INSERT INTO filter_presets (label, filter_json, search_url, short_url) \
         VALUES ('One-beds under 2500', ?, 'https://rentals.example.com/search?beds=1', NULL) \
         RETURNING id",
    )
    .bind(json!({ "bedrooms": [1], "price_max": 2500 }).to_string())
    .fetch_one(&pool)
    .await
    .unwrap()
    .get::<i64, _>("id");

    let template_id = insert_template(
        &pool,
        9,
        json!({ "kind": "filter_links", "preset_ids": [preset_id] }),
    )
    .await;

    let mailer = RecordingMailer::default();
    let deps = deps(pool.clone(), mailer.clone(), None);
    let report = pipeline::run(&deps, template_id, RunMode::automatic())
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.listing_count, 0);
    assert_eq!(report.collections.len(), 1);
    assert_eq!(report.collections[0].count, 3);
    // Collections make the digest non-empty, so it still goes out.
    assert!(report.dispatched);
    let body = mailer.sent().await[0].text.clone().unwrap();
    assert!(body.contains("One-beds under 2500"));
    assert!(body.contains("https://rentals.example.com/search?beds=1"));
}

/// Never completes a send, so the run budget is the only way out.
#[derive(Clone, Default)]
struct StallingMailer;

#[async_trait::async_trait]
impl Mailer for StallingMailer {
    async fn send(&self, _email: &OutgoingEmail) -> Result<String> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok("never".into())
    }
}

#[tokio::test]
async fn run_budget_timeout_records_failure_and_releases_lock() {
    let pool = setup_pool().await;
    seed_bedroom_mix(&pool).await;
    insert_recipient(&pool, "a@example.com").await;
    let template_id = insert_template(&pool, 9, bedroom_template()).await;

    let mut cfg = test_config();
    cfg.app.run_timeout_seconds = 1;
    let stalled = Deps {
        locks: RunLocks::new(pool.clone()),
        pool: pool.clone(),
        config: Arc::new(cfg),
        mailer: Arc::new(StallingMailer),
        shortlinker: None,
    };

    let report = pipeline::run(&stalled, template_id, RunMode::automatic())
        .await
        .unwrap();
    assert!(!report.success);
    assert_eq!(report.error.as_deref(), Some("timeout"));
    assert_eq!(sent_listing_rows(&pool).await, 0);

    let error: Option<String> =
        sqlx::query_scalar("SELECT error FROM digest_sends WHERE template_id = ?")
            .bind(template_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(error.as_deref(), Some("timeout"));

    // The claim was released, so a healthy retry goes straight through.
    let mailer = RecordingMailer::default();
    let healthy = deps(pool.clone(), mailer.clone(), None);
    let retry = pipeline::run(&healthy, template_id, RunMode::automatic())
        .await
        .unwrap();
    assert!(retry.success);
    assert_eq!(mailer.sent().await.len(), 1);
}

#[tokio::test]
async fn manual_run_skips_while_another_process_holds_the_claim() {
    let pool = setup_pool().await;
    seed_bedroom_mix(&pool).await;
    insert_recipient(&pool, "a@example.com").await;
    let template_id = insert_template(&pool, 9, bedroom_template()).await;

    // Stands in for the daemon holding the claim in another process; the
    // claim lives in the shared database, not in this lock handle.
    let daemon_locks = RunLocks::new(pool.clone());
    let guard = daemon_locks
        .try_acquire(template_id, std::time::Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();

    let mailer = RecordingMailer::default();
    let manual = deps(pool.clone(), mailer.clone(), None);
    let err = pipeline::run(&manual, template_id, RunMode::manual(false, false))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already in flight"));
    assert_eq!(mailer.sent().await.len(), 0);
    assert_eq!(send_records(&pool).await, 0);

    guard.release().await.unwrap();
    let report = pipeline::run(&manual, template_id, RunMode::manual(false, false))
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(mailer.sent().await.len(), 1);
}

#[tokio::test]
async fn hourly_tick_sends_once_per_day() {
    let pool = setup_pool().await;
    seed_bedroom_mix(&pool).await;
    insert_recipient(&pool, "a@example.com").await;

    let mailer = RecordingMailer::default();
    let deps = deps(pool.clone(), mailer.clone(), None);
    let now_local = scheduler::local_now(&deps.config);
    insert_template(&pool, chrono::Timelike::hour(&now_local), bedroom_template()).await;

    scheduler::tick(&deps, now_local).await.unwrap();
    assert_eq!(mailer.sent().await.len(), 1);

    // Same hour, same day: the daily gate holds.
    scheduler::tick(&deps, now_local).await.unwrap();
    assert_eq!(mailer.sent().await.len(), 1);
    assert_eq!(send_records(&pool).await, 1);

    // A different hour never matches the delivery hour.
    let off_hour = now_local + chrono::Duration::hours(1);
    scheduler::tick(&deps, off_hour).await.unwrap();
    assert_eq!(mailer.sent().await.len(), 1);
}
