use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::Config;
use crate::event::browser::{BrowserClassifier, UserAgentClassifier};
use crate::export::health::HealthMetrics;
use crate::queue::buffer::CounterBuffer;
use crate::queue::flush::{FlushCoordinator, FlushSummary};
use crate::queue::writer::QueueWriter;
use crate::recorder::EventRecorder;
use crate::store::AggregateStore;

/// Agent wires the buffer, store, write paths and flush ticker together.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    buffer: Arc<CounterBuffer>,
    store: Arc<AggregateStore>,
    writer: Arc<QueueWriter>,
    recorder: Arc<EventRecorder>,
    flusher: Arc<FlushCoordinator>,
    clock: Clock,
    cancel: CancellationToken,
    ticker: Option<JoinHandle<()>>,
}

impl Agent {
    /// Creates every component from configuration. Nothing connects yet.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_classifier(cfg, Arc::new(UserAgentClassifier))
    }

    /// Like [`Agent::new`] with a custom browser classifier.
    pub fn with_classifier(cfg: Config, classifier: Arc<dyn BrowserClassifier>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let buffer =
            Arc::new(CounterBuffer::from_config(&cfg.buffer).context("creating counter buffer")?);
        let store =
            Arc::new(AggregateStore::from_config(&cfg.store).context("creating aggregate store")?);
        let clock = Clock::from(cfg.timezone);

        let writer = Arc::new(QueueWriter::new(
            Arc::clone(&buffer),
            cfg.buffer.page_queue.clone(),
            cfg.buffer.browser_queue.clone(),
            Arc::clone(&classifier),
            cfg.error_policy,
            Some(Arc::clone(&health)),
        ));

        let recorder = Arc::new(EventRecorder::new(
            Arc::clone(&store),
            classifier,
            clock,
            cfg.error_policy,
            Some(Arc::clone(&health)),
        ));

        let flusher = Arc::new(FlushCoordinator::new(
            Arc::clone(&buffer),
            Arc::clone(&store),
            cfg.buffer.page_queue.clone(),
            cfg.buffer.browser_queue.clone(),
            cfg.buffer.scan_count,
            Some(Arc::clone(&health)),
        ));

        Ok(Self {
            cfg,
            health,
            buffer,
            store,
            writer,
            recorder,
            flusher,
            clock,
            cancel: CancellationToken::new(),
            ticker: None,
        })
    }

    /// Buffered write path.
    pub fn writer(&self) -> Arc<QueueWriter> {
        Arc::clone(&self.writer)
    }

    /// Direct write path.
    pub fn recorder(&self) -> Arc<EventRecorder> {
        Arc::clone(&self.recorder)
    }

    pub fn store(&self) -> Arc<AggregateStore> {
        Arc::clone(&self.store)
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Connects the aggregate store, creating tables if configured.
    pub async fn connect(&self) -> Result<()> {
        self.store
            .start()
            .await
            .with_context(|| format!("starting {} store", self.store.backend_name()))?;

        info!(
            buffer = self.buffer.backend_name(),
            store = self.store.backend_name(),
            policy = self.cfg.error_policy.as_str(),
            "aggregate pipeline ready"
        );

        Ok(())
    }

    /// Runs one flush of both queues for today.
    pub async fn flush_once(&self) -> Result<FlushSummary> {
        self.flush_once_for(self.clock.today()).await
    }

    /// Runs one flush of both queues, attributing counts to `date`.
    pub async fn flush_once_for(&self, date: chrono::NaiveDate) -> Result<FlushSummary> {
        self.flusher.flush_all(date).await
    }

    /// Starts the health server, connects the store and begins flushing
    /// every `flush.interval`.
    pub async fn start(&mut self) -> Result<()> {
        // Health first so /healthz answers while the store connects.
        let addr = self
            .health
            .start()
            .await
            .context("starting health metrics server")?;
        debug!(%addr, "health metrics server bound");

        self.connect().await?;

        let interval = self.cfg.flush.interval;
        self.ticker = Some(tokio::spawn(run_ticker(
            Arc::clone(&self.flusher),
            self.clock,
            interval,
            self.cancel.clone(),
        )));

        info!(interval = ?interval, "flush ticker started");

        Ok(())
    }

    /// Stops the ticker, runs a final flush and stops the health server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(ticker) = self.ticker.take() {
            if let Err(e) = ticker.await {
                error!(error = %e, "flush ticker task failed");
            }
        }

        match self.flush_once().await {
            Ok(summary) => info!(
                page_views = summary.page.total,
                browser_views = summary.browser.total,
                "final flush complete"
            ),
            Err(e) => error!(error = %format!("{e:#}"), "final flush failed, data stays buffered"),
        }

        self.health.stop().await?;

        Ok(())
    }
}

async fn run_ticker(
    flusher: Arc<FlushCoordinator>,
    clock: Clock,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("flush ticker stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = flusher.flush_all(clock.today()).await {
                    error!(error = %format!("{e:#}"), "flush failed, retrying next interval");
                }
            }
        }
    }
}
