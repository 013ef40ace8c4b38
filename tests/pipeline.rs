use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use viewtally::clock::{Clock, Timezone};
use viewtally::config::{BufferBackendKind, Config};
use viewtally::event::browser::UserAgentClassifier;
use viewtally::event::RequestEvent;
use viewtally::policy::ErrorPolicy;
use viewtally::queue::buffer::CounterBuffer;
use viewtally::queue::dimension::EventKind;
use viewtally::queue::flush::{FlushCoordinator, FlushSummary};
use viewtally::queue::writer::QueueWriter;
use viewtally::recorder::EventRecorder;
use viewtally::report;
use viewtally::store::sqlite::SqliteStore;
use viewtally::store::AggregateStore;

const FIREFOX_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 15).expect("valid date")
}

struct Pipeline {
    buffer: Arc<CounterBuffer>,
    store: Arc<AggregateStore>,
    writer: QueueWriter,
    flusher: FlushCoordinator,
}

async fn pipeline() -> Pipeline {
    let buffer = Arc::new(CounterBuffer::memory());
    let store = Arc::new(AggregateStore::Sqlite(
        SqliteStore::in_memory().expect("open sqlite"),
    ));
    store.start().await.expect("start store");

    let writer = QueueWriter::new(
        Arc::clone(&buffer),
        "page_views",
        "browser_views",
        Arc::new(UserAgentClassifier),
        ErrorPolicy::Strict,
        None,
    );
    let flusher = FlushCoordinator::new(
        Arc::clone(&buffer),
        Arc::clone(&store),
        "page_views",
        "browser_views",
        500,
        None,
    );

    Pipeline {
        buffer,
        store,
        writer,
        flusher,
    }
}

fn campaign_event() -> RequestEvent {
    RequestEvent::new("example.com", "/products")
        .with_referrer("https://google.com/search?q=widgets")
        .with_query_param("utm_source", "google")
        .with_query_param("utm_medium", "cpc")
        .with_user_agent(FIREFOX_UA)
}

#[tokio::test]
async fn test_three_enqueues_flush_into_one_row() {
    let p = pipeline().await;

    for _ in 0..3 {
        p.writer.enqueue(&campaign_event()).await.expect("enqueue");
    }

    let summary = p.flusher.flush_all(date()).await.expect("flush");
    assert_eq!(summary.page.total, 3);
    assert_eq!(summary.browser.total, 3);

    let rows = p.store.page_rows(date()).await.expect("rows");
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.date, date());
    assert_eq!(row.total, 3);
    assert_eq!(row.dimension.site.as_deref(), Some("example.com"));
    assert_eq!(row.dimension.page.as_deref(), Some("/products"));
    assert_eq!(row.dimension.referrer_host.as_deref(), Some("google.com"));
    assert_eq!(row.dimension.referrer_path.as_deref(), Some("/search"));
    assert_eq!(row.dimension.utm.source.as_deref(), Some("google"));
    assert_eq!(row.dimension.utm.medium.as_deref(), Some("cpc"));
    assert_eq!(row.dimension.utm.campaign, None);

    let browsers = p.store.browser_rows(date()).await.expect("rows");
    assert_eq!(browsers.len(), 1);
    assert_eq!(browsers[0].dimension.name.as_deref(), Some("Firefox"));
    assert_eq!(browsers[0].dimension.version.as_deref(), Some("128"));
    assert_eq!(browsers[0].total, 3);
}

#[tokio::test]
async fn test_empty_flush_changes_nothing() {
    let p = pipeline().await;

    let summary = p.flusher.flush_all(date()).await.expect("flush");
    assert_eq!(summary, FlushSummary::default());
    assert!(p.store.page_rows(date()).await.expect("rows").is_empty());
    assert!(p.store.browser_rows(date()).await.expect("rows").is_empty());
}

#[tokio::test]
async fn test_many_events_aggregate_per_tuple() {
    let p = pipeline().await;

    for i in 0..100 {
        let path = if i % 4 == 0 { "/a" } else { "/b" };
        p.writer
            .enqueue(&RequestEvent::new("example.com", path))
            .await
            .expect("enqueue");
    }

    p.flusher.flush_all(date()).await.expect("flush");

    let rows = p.store.page_rows(date()).await.expect("rows");
    assert_eq!(rows.len(), 2);
    // Highest total first.
    assert_eq!(rows[0].dimension.page.as_deref(), Some("/b"));
    assert_eq!(rows[0].total, 75);
    assert_eq!(rows[1].total, 25);
}

#[tokio::test]
async fn test_malformed_buffer_keys_are_tolerated() {
    let p = pipeline().await;

    p.writer.enqueue(&campaign_event()).await.expect("enqueue");
    p.buffer
        .increment("page_views", "not-a-key", 4)
        .await
        .expect("increment");

    let report = p.flusher.flush(EventKind::Page, date()).await.expect("flush");
    assert_eq!(report.entries, 2);
    assert_eq!(report.total, 5);
    assert!(report.anomalies >= 1);

    let rows = p.store.page_rows(date()).await.expect("rows");
    assert_eq!(rows.iter().map(|r| r.total).sum::<i64>(), 5);
}

#[tokio::test]
async fn test_case_differing_sources_stay_distinct() {
    let store = Arc::new(AggregateStore::Sqlite(
        SqliteStore::in_memory().expect("open sqlite"),
    ));
    store.start().await.expect("start store");
    let recorder = EventRecorder::new(
        Arc::clone(&store),
        Arc::new(UserAgentClassifier),
        Clock::Fixed(date()),
        ErrorPolicy::Strict,
        None,
    );

    for source in ["Google", "google"] {
        let event = RequestEvent::new("example.com", "/").with_query_param("utm_source", source);
        recorder.record(&event).await.expect("record");
    }

    let rows = store.page_rows(date()).await.expect("rows");
    assert_eq!(rows.len(), 2);

    let shares = report::utm_breakdown(&rows, report::UtmField::Source);
    assert_eq!(shares.len(), 2);
    assert!(shares.iter().all(|s| s.percentage == 50.0));
}

#[test]
fn test_percentage_of_nothing_is_zero() {
    assert_eq!(report::percentage(3, 0), 0.0);
    assert_eq!(report::utm_overview(&[]).utm_percentage, 0.0);
}

#[tokio::test]
async fn test_agent_flush_once_for_date() {
    let mut cfg = Config::default();
    cfg.timezone = Timezone::Utc;
    cfg.error_policy = ErrorPolicy::Strict;
    cfg.buffer.backend = BufferBackendKind::Memory;
    cfg.store.sqlite.path = PathBuf::from(":memory:");
    cfg.health.addr = "127.0.0.1:0".to_string();

    let agent = viewtally::agent::Agent::new(cfg).expect("agent");
    agent.connect().await.expect("connect");

    agent
        .writer()
        .enqueue(&campaign_event())
        .await
        .expect("enqueue");
    let summary = agent.flush_once_for(date()).await.expect("flush");
    assert_eq!(summary.page.total, 1);

    let rows = agent.store().page_rows(date()).await.expect("rows");
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_referrer_without_path_stores_null_path() {
    let p = pipeline().await;

    for referrer in ["https://google.com", "https://google.com/"] {
        p.writer
            .enqueue(&RequestEvent::new("example.com", "/").with_referrer(referrer))
            .await
            .expect("enqueue");
    }
    p.flusher.flush(EventKind::Page, date()).await.expect("flush");

    let rows = p.store.page_rows(date()).await.expect("rows");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r.dimension.referrer_path.is_none()));
    assert!(rows.iter().any(|r| r.dimension.referrer_path.as_deref() == Some("/")));
}
