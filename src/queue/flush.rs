use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::buffer::{CounterBuffer, DrainHandle};
use super::codec;
use super::dimension::{DimensionRecord, EventKind};
use crate::export::health::HealthMetrics;
use crate::store::AggregateStore;

/// Outcome of one flush cycle for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Buffer entries merged.
    pub entries: u64,
    /// Sum of merged counts.
    pub total: i64,
    /// Entries whose key decoded with an anomaly.
    pub anomalies: u64,
    /// Whether a drain left by an aborted cycle was merged first.
    pub recovered: bool,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn absorb(&mut self, other: FlushReport) {
        self.entries += other.entries;
        self.total = self.total.saturating_add(other.total);
        self.anomalies += other.anomalies;
        self.recovered |= other.recovered;
    }
}

/// Reports for both queues of a [`FlushCoordinator::flush_all`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub page: FlushReport,
    pub browser: FlushReport,
}

/// Moves buffered counts into the aggregate store.
///
/// A cycle drains the live buffer by renaming it to a private claim name,
/// merges every entry page by page, and deletes the drained table only
/// once every page has been merged. A failure hands the drained table
/// back (or keeps it here when another leftover is already waiting); the
/// next cycle merges it before draining again. Entries merged before the
/// failure are merged again then, so delivery is at least once.
///
/// Every drain and every reclaim is a single rename, so any number of
/// coordinators, in this process or others, can flush the same queue
/// concurrently without counting an entry twice.
pub struct FlushCoordinator {
    buffer: Arc<CounterBuffer>,
    store: Arc<AggregateStore>,
    page_queue: String,
    browser_queue: String,
    scan_count: usize,
    health: Option<Arc<HealthMetrics>>,
    /// Claims that could not be handed back after a failure.
    held: Mutex<Vec<DrainHandle>>,
}

impl FlushCoordinator {
    pub fn new(
        buffer: Arc<CounterBuffer>,
        store: Arc<AggregateStore>,
        page_queue: impl Into<String>,
        browser_queue: impl Into<String>,
        scan_count: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            buffer,
            store,
            page_queue: page_queue.into(),
            browser_queue: browser_queue.into(),
            scan_count: scan_count.max(1),
            health,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Live queue name for `kind`.
    pub fn queue_for(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Page => &self.page_queue,
            EventKind::Browser => &self.browser_queue,
        }
    }

    /// Flushes the page queue, then the browser queue, attributing every
    /// entry to `date`.
    ///
    /// Both queues are attempted even if the first fails; the first error
    /// is returned.
    pub async fn flush_all(&self, date: NaiveDate) -> Result<FlushSummary> {
        let page = self.flush(EventKind::Page, date).await;
        let browser = self.flush(EventKind::Browser, date).await;

        Ok(FlushSummary {
            page: page?,
            browser: browser?,
        })
    }

    /// Runs one flush cycle for the queue of `kind`.
    ///
    /// Returns an empty report when nothing was buffered.
    pub async fn flush(&self, kind: EventKind, date: NaiveDate) -> Result<FlushReport> {
        let queue = self.queue_for(kind);
        let started = Instant::now();

        let result = self.cycle(kind, queue, date).await;

        let outcome = match &result {
            Ok(report) if report.is_empty() => "empty",
            Ok(_) => "ok",
            Err(_) => "error",
        };

        if let Some(ref health) = self.health {
            health.flushes.with_label_values(&[queue, outcome]).inc();
            health
                .flush_duration
                .with_label_values(&[queue])
                .observe(started.elapsed().as_secs_f64());
        }

        match &result {
            Ok(report) if report.is_empty() => {
                debug!(queue, "nothing to flush");
            }
            Ok(report) => {
                info!(
                    queue,
                    %date,
                    entries = report.entries,
                    total = report.total,
                    anomalies = report.anomalies,
                    recovered = report.recovered,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "flushed buffer"
                );
            }
            Err(_) => {}
        }

        result.with_context(|| format!("flushing {queue}"))
    }

    async fn cycle(&self, kind: EventKind, queue: &str, date: NaiveDate) -> Result<FlushReport> {
        let mut report = FlushReport::default();

        let mut held = self.take_held(queue);
        while let Some(handle) = held.pop() {
            warn!(queue, drained = handle.name(), "retrying drain kept by a failed flush");
            if let Err(e) = self.finish(kind, handle, date, &mut report).await {
                self.held.lock().extend(held);
                return Err(e);
            }
            report.recovered = true;
        }

        if let Some(handle) = self.buffer.reclaim(queue).await? {
            warn!(queue, drained = handle.name(), "resuming drain left by a failed flush");
            self.finish(kind, handle, date, &mut report).await?;
            report.recovered = true;
        }

        let live = self.buffer.len(queue).await?;
        if let Some(ref health) = self.health {
            health
                .buffer_entries
                .with_label_values(&[queue])
                .set(live as f64);
        }
        if live == 0 {
            return Ok(report);
        }

        let Some(handle) = self.buffer.drain(queue).await? else {
            debug!(queue, "queue already drained by another flush");
            return Ok(report);
        };

        self.finish(kind, handle, date, &mut report).await?;

        Ok(report)
    }

    /// Merges and discards one claimed drain. On failure the claim is
    /// handed back for the next cycle.
    async fn finish(
        &self,
        kind: EventKind,
        handle: DrainHandle,
        date: NaiveDate,
        report: &mut FlushReport,
    ) -> Result<()> {
        let merged = match self.merge_drained(kind, &handle, date).await {
            Ok(merged) => merged,
            Err(e) => {
                self.hand_back(handle).await;
                return Err(e);
            }
        };
        report.absorb(merged);

        // Every entry is persisted; a drain that cannot be deleted is merged
        // again later.
        if let Err(e) = self.buffer.discard(&handle).await {
            let name = handle.name().to_string();
            self.hand_back(handle).await;
            return Err(e).with_context(|| format!("discarding {name}"));
        }

        Ok(())
    }

    async fn hand_back(&self, handle: DrainHandle) {
        let released = self.buffer.release(&handle).await;
        match released {
            Ok(true) => {
                debug!(queue = handle.queue(), drained = handle.name(), "drain handed back");
            }
            Ok(false) => {
                warn!(
                    queue = handle.queue(),
                    drained = handle.name(),
                    "another drain is already waiting, keeping claim"
                );
                self.held.lock().push(handle);
            }
            Err(e) => {
                warn!(
                    queue = handle.queue(),
                    drained = handle.name(),
                    error = %format!("{e:#}"),
                    "failed to hand drain back, keeping claim"
                );
                self.held.lock().push(handle);
            }
        }
    }

    fn take_held(&self, queue: &str) -> Vec<DrainHandle> {
        let mut held = self.held.lock();
        let (mine, rest): (Vec<DrainHandle>, Vec<DrainHandle>) = std::mem::take(&mut *held)
            .into_iter()
            .partition(|h| h.queue() == queue);
        *held = rest;
        mine
    }

    /// Merges every entry of a drained table, one scan page per batch.
    async fn merge_drained(
        &self,
        kind: EventKind,
        handle: &DrainHandle,
        date: NaiveDate,
    ) -> Result<FlushReport> {
        let queue = handle.queue();
        let mut report = FlushReport::default();
        let mut cursor = 0;

        loop {
            let page = self
                .buffer
                .scan(handle, cursor, self.scan_count)
                .await
                .with_context(|| format!("scanning {}", handle.name()))?;

            let mut batch: Vec<(DimensionRecord, i64)> = Vec::with_capacity(page.entries.len());
            let mut batch_total = 0i64;
            let mut batch_anomalies = 0u64;

            for (key, count) in page.entries {
                let decoded = codec::decode(kind, &key);
                if !decoded.anomalies.is_empty() {
                    batch_anomalies += 1;
                    for anomaly in &decoded.anomalies {
                        warn!(queue, key = %key, %anomaly, "malformed buffer key");
                    }
                }
                batch_total = batch_total.saturating_add(count);
                batch.push((decoded.record, count));
            }

            if let Err(e) = self.store.merge(date, &batch).await {
                if let Some(ref health) = self.health {
                    health
                        .store_merge_errors
                        .with_label_values(&[self.store.backend_name()])
                        .inc();
                }
                return Err(e).with_context(|| {
                    format!("merging {} entries into {}", batch.len(), self.store.backend_name())
                });
            }

            if let Some(ref health) = self.health {
                health
                    .flushed_entries
                    .with_label_values(&[queue])
                    .inc_by(batch.len() as f64);
                health
                    .flushed_views
                    .with_label_values(&[queue])
                    .inc_by(batch_total as f64);
                if batch_anomalies > 0 {
                    health
                        .malformed_keys
                        .with_label_values(&[queue])
                        .inc_by(batch_anomalies as f64);
                }
            }

            report.absorb(FlushReport {
                entries: batch.len() as u64,
                total: batch_total,
                anomalies: batch_anomalies,
                recovered: false,
            });

            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::browser::UserAgentClassifier;
    use crate::event::RequestEvent;
    use crate::policy::ErrorPolicy;
    use crate::queue::writer::QueueWriter;
    use crate::store::sqlite::SqliteStore;

    struct Fixture {
        buffer: Arc<CounterBuffer>,
        store: Arc<AggregateStore>,
        writer: QueueWriter,
        flusher: FlushCoordinator,
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).expect("valid date")
    }

    async fn fixture(scan_count: usize) -> Fixture {
        let buffer = Arc::new(CounterBuffer::memory());
        let store = Arc::new(AggregateStore::Sqlite(
            SqliteStore::in_memory().expect("open"),
        ));
        store.start().await.expect("start");

        let writer = QueueWriter::new(
            Arc::clone(&buffer),
            "pages",
            "browsers",
            Arc::new(UserAgentClassifier),
            ErrorPolicy::Strict,
            None,
        );
        let flusher = FlushCoordinator::new(
            Arc::clone(&buffer),
            Arc::clone(&store),
            "pages",
            "browsers",
            scan_count,
            None,
        );

        Fixture {
            buffer,
            store,
            writer,
            flusher,
        }
    }

    fn sqlite(store: &AggregateStore) -> &SqliteStore {
        match store {
            AggregateStore::Sqlite(s) => s,
            AggregateStore::ClickHouse(_) => panic!("expected sqlite store"),
        }
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let f = fixture(500).await;

        let summary = f.flusher.flush_all(date()).await.expect("flush");
        assert_eq!(summary, FlushSummary::default());
        assert!(f.store.page_rows(date()).await.expect("rows").is_empty());

        // Repeating is still safe.
        let report = f.flusher.flush(EventKind::Page, date()).await.expect("flush");
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_n_identical_events_become_one_row() {
        let f = fixture(500).await;
        let event = RequestEvent::new("site.test", "/pricing");

        for _ in 0..50 {
            f.writer.enqueue(&event).await.expect("enqueue");
        }

        let summary = f.flusher.flush_all(date()).await.expect("flush");
        assert_eq!(summary.page.entries, 1);
        assert_eq!(summary.page.total, 50);
        assert_eq!(summary.browser.total, 50);

        let rows = f.store.page_rows(date()).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total, 50);

        let browsers = f.store.browser_rows(date()).await.expect("rows");
        assert_eq!(browsers.len(), 1);
        assert_eq!(browsers[0].dimension.name.as_deref(), Some("Unknown Browser"));

        // Drained buffer is gone.
        assert!(!f.buffer.has_leftover("pages").await.expect("leftover"));
        assert_eq!(f.buffer.len("pages").await.expect("len"), 0);
    }

    #[tokio::test]
    async fn test_successive_flushes_accumulate() {
        let f = fixture(500).await;
        let event = RequestEvent::new("site.test", "/");

        f.writer.enqueue(&event).await.expect("enqueue");
        f.flusher.flush_all(date()).await.expect("flush");
        f.writer.enqueue(&event).await.expect("enqueue");
        f.writer.enqueue(&event).await.expect("enqueue");
        f.flusher.flush_all(date()).await.expect("flush");

        let rows = f.store.page_rows(date()).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total, 3);
    }

    #[tokio::test]
    async fn test_scan_pages_cover_every_entry() {
        let f = fixture(2).await;

        for i in 0..7 {
            let event = RequestEvent::new("site.test", format!("/page/{i}"));
            for _ in 0..=i {
                f.writer.enqueue(&event).await.expect("enqueue");
            }
        }

        let report = f.flusher.flush(EventKind::Page, date()).await.expect("flush");
        assert_eq!(report.entries, 7);
        assert_eq!(report.total, (1..=7).sum::<i64>());
        assert_eq!(f.store.page_rows(date()).await.expect("rows").len(), 7);
    }

    #[tokio::test]
    async fn test_malformed_keys_do_not_abort() {
        let f = fixture(500).await;
        for key in ["malformed|key", "v1|site.test||", "v1|site.test|/|~|~|~|~|~|~|~|extra", ""] {
            f.buffer.increment("pages", key, 2).await.expect("increment");
        }

        let report = f.flusher.flush(EventKind::Page, date()).await.expect("flush");
        assert_eq!(report.entries, 4);
        assert_eq!(report.anomalies, 4);

        let rows = f.store.page_rows(date()).await.expect("rows");
        let legacy = rows
            .iter()
            .find(|r| r.dimension.site.as_deref() == Some("malformed"))
            .expect("legacy row");
        assert_eq!(legacy.dimension.page.as_deref(), Some("key"));
        assert!(legacy.dimension.referrer_host.is_none());
        assert_eq!(legacy.total, 2);
    }

    #[tokio::test]
    async fn test_failed_merge_keeps_drain_and_recovers() {
        let f = fixture(500).await;
        let event = RequestEvent::new("site.test", "/");

        for _ in 0..3 {
            f.writer.enqueue(&event).await.expect("enqueue");
        }

        sqlite(&f.store)
            .execute_batch("DROP TABLE views_per_day")
            .await
            .expect("drop");

        let err = f
            .flusher
            .flush(EventKind::Page, date())
            .await
            .expect_err("store is broken");
        assert!(format!("{err:#}").contains("flushing pages"));

        // Nothing discarded; new writes go to a fresh live buffer.
        assert!(f.buffer.has_leftover("pages").await.expect("leftover"));
        f.writer.enqueue(&event).await.expect("enqueue");
        assert_eq!(f.buffer.len("pages").await.expect("len"), 1);

        f.store.start().await.expect("recreate tables");

        let report = f.flusher.flush(EventKind::Page, date()).await.expect("flush");
        assert!(report.recovered);
        assert_eq!(report.total, 4);
        assert!(!f.buffer.has_leftover("pages").await.expect("leftover"));

        let rows = f.store.page_rows(date()).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total, 4);
    }

    fn second_flusher(f: &Fixture, scan_count: usize) -> FlushCoordinator {
        FlushCoordinator::new(
            Arc::clone(&f.buffer),
            Arc::clone(&f.store),
            "pages",
            "browsers",
            scan_count,
            None,
        )
    }

    async fn persisted(f: &Fixture) -> i64 {
        f.store
            .page_rows(date())
            .await
            .expect("rows")
            .iter()
            .map(|r| r.total)
            .sum()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_flushes_do_not_double_count() {
        for _ in 0..20 {
            let f = fixture(1).await;
            let other = second_flusher(&f, 1);
            for i in 0..50 {
                f.writer
                    .enqueue(&RequestEvent::new("site.test", format!("/{i}")))
                    .await
                    .expect("enqueue");
            }

            let (ra, rb) = tokio::join!(
                f.flusher.flush(EventKind::Page, date()),
                other.flush(EventKind::Page, date()),
            );
            let (ra, rb) = (ra.expect("flush"), rb.expect("flush"));

            assert_eq!(ra.total + rb.total, 50);
            assert_eq!(persisted(&f).await, 50);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_leftover_is_recovered_by_one_flusher() {
        let f = fixture(1).await;
        let other = second_flusher(&f, 1);
        for i in 0..10 {
            f.writer
                .enqueue(&RequestEvent::new("site.test", format!("/{i}")))
                .await
                .expect("enqueue");
        }
        let handle = f.buffer.drain("pages").await.expect("drain").expect("handle");
        assert!(f.buffer.release(&handle).await.expect("release"));

        let (ra, rb) = tokio::join!(
            f.flusher.flush(EventKind::Page, date()),
            other.flush(EventKind::Page, date()),
        );
        let (ra, rb) = (ra.expect("flush"), rb.expect("flush"));

        assert!(ra.recovered != rb.recovered);
        assert_eq!(ra.total + rb.total, 10);
        assert_eq!(persisted(&f).await, 10);
    }

    #[tokio::test]
    async fn test_claim_kept_when_leftover_waits() {
        let f = fixture(500).await;

        f.writer
            .enqueue(&RequestEvent::new("site.test", "/b"))
            .await
            .expect("enqueue");
        let waiting = f.buffer.drain("pages").await.expect("drain").expect("handle");
        assert!(f.buffer.release(&waiting).await.expect("release"));

        for _ in 0..2 {
            f.writer
                .enqueue(&RequestEvent::new("site.test", "/a"))
                .await
                .expect("enqueue");
        }
        let failed = f.buffer.drain("pages").await.expect("drain").expect("handle");
        f.flusher.hand_back(failed).await;
        assert_eq!(f.flusher.held.lock().len(), 1);

        let report = f.flusher.flush(EventKind::Page, date()).await.expect("flush");
        assert!(report.recovered);
        assert_eq!(report.total, 3);
        assert!(f.flusher.held.lock().is_empty());
        assert!(!f.buffer.has_leftover("pages").await.expect("leftover"));
        assert_eq!(persisted(&f).await, 3);
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let f = fixture(500).await;
        let flusher = FlushCoordinator::new(
            Arc::clone(&f.buffer),
            Arc::clone(&f.store),
            "pages",
            "browsers",
            500,
            Some(Arc::clone(&health)),
        );

        f.writer
            .enqueue(&RequestEvent::new("site.test", "/"))
            .await
            .expect("enqueue");
        f.buffer
            .increment("pages", "bad", 1)
            .await
            .expect("increment");

        flusher.flush(EventKind::Page, date()).await.expect("flush");
        flusher.flush(EventKind::Page, date()).await.expect("flush");

        assert_eq!(health.flushes.with_label_values(&["pages", "ok"]).get(), 1.0);
        assert_eq!(health.flushes.with_label_values(&["pages", "empty"]).get(), 1.0);
        assert_eq!(health.flushed_entries.with_label_values(&["pages"]).get(), 2.0);
        assert_eq!(health.flushed_views.with_label_values(&["pages"]).get(), 2.0);
        assert_eq!(health.malformed_keys.with_label_values(&["pages"]).get(), 1.0);
    }
}
