use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use sar_watchbot::alert::AlertSink;
use sar_watchbot::archive::Archive;
use sar_watchbot::classifier::DisabledClassifier;
use sar_watchbot::db::{self, InstanceState};
use sar_watchbot::delay::DelayPolicy;
use sar_watchbot::feed::Feed;
use sar_watchbot::model::{Cursor, ItemId, ProcessingRecord, RawItem};
use sar_watchbot::pipeline::Pipeline;
use sar_watchbot::scheduler::{ensure_running, process_next_due, StartOutcome};
use sar_watchbot::scorer::LexicalScorer;
use sar_watchbot::settings::{Settings, Tunables};
use sar_watchbot::workflow::Controller;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn item(id: u64, text: &str) -> RawItem {
    RawItem {
        id: ItemId(id),
        created_at: Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
        full_text: text.to_string(),
        hashtags: vec![],
        reply_to: None,
        permalink: format!("https://twitter.com/politivest/status/{id}"),
    }
}

#[derive(Clone, Default)]
struct RecordingFeed {
    responses: Arc<Mutex<VecDeque<Result<Vec<RawItem>>>>>,
    calls: Arc<Mutex<Vec<Cursor>>>,
}

impl RecordingFeed {
    fn with_responses(responses: Vec<Result<Vec<RawItem>>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<Cursor> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Feed for RecordingFeed {
    async fn fetch(&self, after: Cursor) -> Result<Vec<RawItem>> {
        self.calls.lock().await.push(after);
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Clone, Default)]
struct RecordingArchive {
    batches: Arc<Mutex<Vec<Vec<ItemId>>>>,
}

impl RecordingArchive {
    async fn batches(&self) -> Vec<Vec<ItemId>> {
        self.batches.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Archive for RecordingArchive {
    async fn store(&self, records: &[ProcessingRecord]) -> Result<usize> {
        self.batches
            .lock()
            .await
            .push(records.iter().map(|r| r.id()).collect());
        Ok(records.len())
    }
}

#[derive(Clone, Default)]
struct RecordingAlerts {
    batches: Arc<Mutex<Vec<(Vec<ItemId>, f64)>>>,
}

impl RecordingAlerts {
    async fn batches(&self) -> Vec<(Vec<ItemId>, f64)> {
        self.batches.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl AlertSink for RecordingAlerts {
    async fn publish(&self, records: &[ProcessingRecord], alert_threshold: f64) -> Result<usize> {
        self.batches
            .lock()
            .await
            .push((records.iter().map(|r| r.id()).collect(), alert_threshold));
        Ok(records.len())
    }
}

struct Harness {
    feed: RecordingFeed,
    archive: RecordingArchive,
    alerts: RecordingAlerts,
    controller: Controller,
}

fn harness(feed: RecordingFeed, active: bool) -> Harness {
    let settings = Arc::new(Settings::with_lookup(
        Tunables {
            active,
            ..Tunables::default()
        },
        |_| None,
    ));
    let archive = RecordingArchive::default();
    let alerts = RecordingAlerts::default();
    let pipeline = Pipeline::new(
        Arc::new(LexicalScorer::new(Default::default())),
        Arc::new(DisabledClassifier),
        settings.clone(),
    );
    let controller = Controller::new(
        Arc::new(feed.clone()),
        Arc::new(archive.clone()),
        Arc::new(alerts.clone()),
        pipeline,
        settings,
        DelayPolicy::default(),
    );
    Harness {
        feed,
        archive,
        alerts,
        controller,
    }
}

async fn fail_effect_inserts(pool: &sqlx::SqlitePool, trigger: &str, condition: &str) {
    sqlx::query(&format!(
        "CREATE TRIGGER {trigger} BEFORE INSERT ON effects WHEN {condition} \
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END"
    ))
    .execute(pool)
    .await
    .unwrap();
}

async fn drop_trigger(pool: &sqlx::SqlitePool, trigger: &str) {
    sqlx::query(&format!("DROP TRIGGER {trigger}"))
        .execute(pool)
        .await
        .unwrap();
}

async fn make_due_now(pool: &sqlx::SqlitePool) {
    sqlx::query("UPDATE instances SET due_at = ?")
        .bind(Utc::now() - chrono::Duration::seconds(1))
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_fetch_keeps_cursor_and_reschedules() {
    let pool = setup_pool().await;
    let h = harness(RecordingFeed::default(), true);
    ensure_running(&pool, "politivest", Cursor(500)).await.unwrap();

    assert!(process_next_due(&pool, &h.controller, 60).await.unwrap());

    assert_eq!(h.feed.calls().await, vec![Cursor(500)]);
    assert!(h.archive.batches().await.is_empty());
    assert!(h.alerts.batches().await.is_empty());

    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.cursor, Cursor(500));
    assert_eq!(inst.generation, 1);
    assert_eq!(inst.state, InstanceState::Scheduled);
    assert!(inst.due_at >= Utc::now() + chrono::Duration::seconds(29));

    // Not due yet.
    assert!(!process_next_due(&pool, &h.controller, 60).await.unwrap());
}

#[tokio::test]
async fn batch_is_archived_in_id_order_and_cursor_advances() {
    let pool = setup_pool().await;
    let feed = RecordingFeed::with_responses(vec![Ok(vec![
        item(1000, "Savnet mann i Bergen"),
        item(99, "Savnet kvinne ved Os"),
        item(500, "Stengt vei ved Os"),
        item(50, "Savnet hund"),
    ])]);
    let h = harness(feed, true);
    ensure_running(&pool, "politivest", Cursor(60)).await.unwrap();

    assert!(process_next_due(&pool, &h.controller, 60).await.unwrap());

    // Item 50 is at or below the cursor and is dropped before fan-out.
    assert_eq!(
        h.archive.batches().await,
        vec![vec![ItemId(99), ItemId(500), ItemId(1000)]]
    );
    let alerts = h.alerts.batches().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, vec![ItemId(99), ItemId(1000)]);
    assert!((alerts[0].1 - 0.1).abs() < f64::EPSILON);

    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.cursor, Cursor(1000));
    assert_eq!(db::count_effects(&pool, "politivest", 0).await.unwrap(), 0);
}

#[tokio::test]
async fn nothing_to_publish_skips_alerts() {
    let pool = setup_pool().await;
    let feed = RecordingFeed::with_responses(vec![Ok(vec![item(7, "Stengt vei ved Os")])]);
    let h = harness(feed, true);
    ensure_running(&pool, "politivest", Cursor(0)).await.unwrap();

    process_next_due(&pool, &h.controller, 60).await.unwrap();

    assert_eq!(h.archive.batches().await, vec![vec![ItemId(7)]]);
    assert!(h.alerts.batches().await.is_empty());
    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.cursor, Cursor(7));
}

#[tokio::test]
async fn fetch_failure_is_an_empty_batch() {
    let pool = setup_pool().await;
    let feed = RecordingFeed::with_responses(vec![Err(anyhow!("received 429 from feed"))]);
    let h = harness(feed, true);
    ensure_running(&pool, "politivest", Cursor(42)).await.unwrap();

    assert!(process_next_due(&pool, &h.controller, 60).await.unwrap());

    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.cursor, Cursor(42));
    assert_eq!(inst.attempt, 0);
    assert_eq!(inst.generation, 1);
    assert!(h.archive.batches().await.is_empty());
}

#[tokio::test]
async fn inactive_switch_completes_the_loop() {
    let pool = setup_pool().await;
    let feed = RecordingFeed::with_responses(vec![Ok(vec![item(3, "Savnet turgåer")])]);
    let h = harness(feed, false);
    ensure_running(&pool, "politivest", Cursor(1)).await.unwrap();

    process_next_due(&pool, &h.controller, 60).await.unwrap();

    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.state, InstanceState::Completed);
    assert_eq!(inst.cursor, Cursor(3));
    assert_eq!(h.alerts.batches().await.len(), 1);

    // A completed loop can be started again.
    let outcome = ensure_running(&pool, "politivest", Cursor(3)).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
}

#[tokio::test]
async fn replay_reuses_recorded_steps() {
    let pool = setup_pool().await;
    let h = harness(RecordingFeed::default(), true);
    ensure_running(&pool, "politivest", Cursor(10)).await.unwrap();

    // A previous attempt of generation 0 fetched two items and archived them
    // before crashing.
    let fetched = vec![item(12, "Savnet mann"), item(11, "Stengt vei")];
    db::record_effect(
        &pool,
        "politivest",
        0,
        "fetch",
        &serde_json::to_string(&fetched).unwrap(),
    )
    .await
    .unwrap();
    db::record_effect(&pool, "politivest", 0, "archive:11-12", "2")
        .await
        .unwrap();

    process_next_due(&pool, &h.controller, 60).await.unwrap();

    assert!(h.feed.calls().await.is_empty());
    assert!(h.archive.batches().await.is_empty());
    assert_eq!(h.alerts.batches().await.len(), 1);
    assert_eq!(h.alerts.batches().await[0].0, vec![ItemId(12)]);
    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.cursor, Cursor(12));
    assert_eq!(inst.generation, 1);
}

#[tokio::test]
async fn failed_generation_backs_off_and_keeps_cursor() {
    let pool = setup_pool().await;
    let h = harness(RecordingFeed::default(), true);
    ensure_running(&pool, "politivest", Cursor(10)).await.unwrap();
    sqlx::query("DROP TABLE effects").execute(&pool).await.unwrap();

    assert!(process_next_due(&pool, &h.controller, 60).await.unwrap());

    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.generation, 0);
    assert_eq!(inst.cursor, Cursor(10));
    assert_eq!(inst.attempt, 1);
    assert!(inst.last_error.is_some());
    assert!(!process_next_due(&pool, &h.controller, 60).await.unwrap());
}

#[tokio::test]
async fn ensure_running_is_single_instance() {
    let pool = setup_pool().await;
    assert_eq!(
        ensure_running(&pool, "politivest", Cursor(5)).await.unwrap(),
        StartOutcome::Started
    );
    assert_eq!(
        ensure_running(&pool, "politivest", Cursor(900)).await.unwrap(),
        StartOutcome::AlreadyRunning
    );
    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.cursor, Cursor(5));

    assert!(ensure_running(&pool, "bad id", Cursor(0)).await.is_err());
}

#[tokio::test]
async fn failed_item_holds_back_cursor_until_next_generation() {
    let pool = setup_pool().await;
    let batch = vec![item(30, "Savnet turgåer"), item(20, "Savnet mann")];
    let feed = RecordingFeed::with_responses(vec![Ok(batch.clone()), Ok(batch)]);
    let h = harness(feed, true);
    ensure_running(&pool, "politivest", Cursor(10)).await.unwrap();
    fail_effect_inserts(&pool, "fail_item_20", "NEW.step = 'item:20'").await;

    assert!(process_next_due(&pool, &h.controller, 60).await.unwrap());

    // Every item is at or above the failed one: nothing is archived or sent.
    assert!(h.archive.batches().await.is_empty());
    assert!(h.alerts.batches().await.is_empty());
    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.cursor, Cursor(10));
    assert_eq!(inst.generation, 1);
    assert_eq!(inst.attempt, 0);

    drop_trigger(&pool, "fail_item_20").await;
    make_due_now(&pool).await;
    assert!(process_next_due(&pool, &h.controller, 60).await.unwrap());

    assert_eq!(h.feed.calls().await, vec![Cursor(10), Cursor(10)]);
    assert_eq!(h.archive.batches().await, vec![vec![ItemId(20), ItemId(30)]]);
    assert_eq!(h.alerts.batches().await[0].0, vec![ItemId(20), ItemId(30)]);
    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.cursor, Cursor(30));
}

#[tokio::test]
async fn retried_generation_alerts_items_recovered_on_retry() {
    let pool = setup_pool().await;
    let feed = RecordingFeed::with_responses(vec![Ok(vec![
        item(30, "Savnet turgåer"),
        item(10, "Savnet mann"),
        item(20, "Savnet kvinne"),
    ])]);
    let h = harness(feed, true);
    ensure_running(&pool, "politivest", Cursor(1)).await.unwrap();

    // First attempt: item 20 cannot be recorded, and neither can the archive
    // step, so the generation fails after alerting item 10.
    fail_effect_inserts(&pool, "fail_item_20", "NEW.step = 'item:20'").await;
    fail_effect_inserts(&pool, "fail_archive", "NEW.step LIKE 'archive:%'").await;
    assert!(process_next_due(&pool, &h.controller, 60).await.unwrap());

    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.generation, 0);
    assert_eq!(inst.attempt, 1);
    assert_eq!(inst.cursor, Cursor(1));
    assert_eq!(h.alerts.batches().await.len(), 1);
    assert_eq!(h.alerts.batches().await[0].0, vec![ItemId(10)]);

    drop_trigger(&pool, "fail_item_20").await;
    drop_trigger(&pool, "fail_archive").await;
    make_due_now(&pool).await;
    assert!(process_next_due(&pool, &h.controller, 60).await.unwrap());

    assert_eq!(h.feed.calls().await.len(), 1);
    assert_eq!(
        h.archive.batches().await,
        vec![vec![ItemId(10)], vec![ItemId(10), ItemId(20), ItemId(30)]]
    );
    let alerts = h.alerts.batches().await;
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[1].0, vec![ItemId(10), ItemId(20), ItemId(30)]);
    let inst = db::find_instance(&pool, "politivest").await.unwrap().unwrap();
    assert_eq!(inst.cursor, Cursor(30));
    assert_eq!(inst.generation, 1);
}

#[tokio::test]
async fn repeated_feed_items_are_processed_once() {
    let pool = setup_pool().await;
    let feed = RecordingFeed::with_responses(vec![Ok(vec![
        item(5, "Savnet mann"),
        item(6, "Savnet kvinne"),
        item(5, "Savnet mann"),
    ])]);
    let h = harness(feed, true);
    ensure_running(&pool, "politivest", Cursor(0)).await.unwrap();

    process_next_due(&pool, &h.controller, 60).await.unwrap();

    assert_eq!(h.archive.batches().await, vec![vec![ItemId(5), ItemId(6)]]);
    let alerts = h.alerts.batches().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, vec![ItemId(5), ItemId(6)]);
}
