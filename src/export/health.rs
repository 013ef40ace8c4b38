use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "viewtally";

/// Prometheus metrics for the write paths and the flush cycle.
///
/// All metrics use the "viewtally" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Write paths ===
    /// Events buffered by the queue writer, by kind (page/browser).
    pub events_enqueued: CounterVec,
    /// Events merged directly by the recorder, by kind.
    pub events_recorded: CounterVec,
    /// Events dropped under the log-and-continue policy, by path.
    pub events_dropped: CounterVec,

    // === Flush ===
    /// Flush cycles by queue and outcome (ok/empty/error).
    pub flushes: CounterVec,
    /// Flush cycle duration by queue (1ms-30s buckets).
    pub flush_duration: HistogramVec,
    /// Buffer entries merged into the store, by queue.
    pub flushed_entries: CounterVec,
    /// Sum of merged counts, by queue.
    pub flushed_views: CounterVec,
    /// Buffer keys that decoded with an anomaly, by queue.
    pub malformed_keys: CounterVec,
    /// Failed store merges by backend.
    pub store_merge_errors: CounterVec,
    /// Live buffer size sampled before each flush, by queue.
    pub buffer_entries: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_enqueued = CounterVec::new(
            Opts::new(
                "events_enqueued_total",
                "Total events written to the counter buffer by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let events_recorded = CounterVec::new(
            Opts::new(
                "events_recorded_total",
                "Total events merged directly into the aggregate store by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let events_dropped = CounterVec::new(
            Opts::new(
                "events_dropped_total",
                "Total events dropped after a write-path failure.",
            )
            .namespace(NAMESPACE),
            &["path"],
        )?;

        let flushes = CounterVec::new(
            Opts::new("flushes_total", "Total flush cycles by queue and outcome.")
                .namespace(NAMESPACE),
            &["queue", "outcome"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new("flush_duration_seconds", "Duration of one flush cycle.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
            &["queue"],
        )?;
        let flushed_entries = CounterVec::new(
            Opts::new(
                "flushed_entries_total",
                "Total buffer entries merged into the aggregate store.",
            )
            .namespace(NAMESPACE),
            &["queue"],
        )?;
        let flushed_views = CounterVec::new(
            Opts::new(
                "flushed_views_total",
                "Total counts merged into the aggregate store.",
            )
            .namespace(NAMESPACE),
            &["queue"],
        )?;
        let malformed_keys = CounterVec::new(
            Opts::new(
                "malformed_keys_total",
                "Total buffer keys decoded with an anomaly.",
            )
            .namespace(NAMESPACE),
            &["queue"],
        )?;
        let store_merge_errors = CounterVec::new(
            Opts::new(
                "store_merge_errors_total",
                "Total failed merges into the aggregate store.",
            )
            .namespace(NAMESPACE),
            &["backend"],
        )?;
        let buffer_entries = GaugeVec::new(
            Opts::new(
                "buffer_entries",
                "Entries in the live buffer when the last flush started.",
            )
            .namespace(NAMESPACE),
            &["queue"],
        )?;

        registry.register(Box::new(events_enqueued.clone()))?;
        registry.register(Box::new(events_recorded.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(flushed_entries.clone()))?;
        registry.register(Box::new(flushed_views.clone()))?;
        registry.register(Box::new(malformed_keys.clone()))?;
        registry.register(Box::new(store_merge_errors.clone()))?;
        registry.register(Box::new(buffer_entries.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_enqueued,
            events_recorded,
            events_dropped,
            flushes,
            flush_duration,
            flushed_entries,
            flushed_views,
            malformed_keys,
            store_merge_errors,
            buffer_entries,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 is requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn render(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
