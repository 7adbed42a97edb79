use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "sessionpulse";

/// Prometheus metrics for the coalescer, reaper, and session store.
///
/// All metrics use the "sessionpulse" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Coalescer ===
    /// Heartbeats accepted into the buffer.
    pub heartbeats_enqueued: Counter,
    /// Heartbeats lost, by reason (capacity, shutdown, batch).
    pub heartbeats_dropped: CounterVec,
    /// Session rows updated by flushes.
    pub sessions_merged: Counter,
    /// Flush batches by outcome (persisted, retried, dropped).
    pub flush_batches: CounterVec,
    /// Deduplicated records per flush batch.
    pub flush_batch_size: Histogram,
    /// Wall time of a flush including the retry.
    pub flush_duration: Histogram,
    /// Current number of buffered heartbeats.
    pub buffer_size: Gauge,
    /// Whether a flush is running (1=yes, 0=no).
    pub flush_in_progress: Gauge,

    // === Reaper ===
    /// Sessions closed by the reaper.
    pub sessions_reaped: Counter,
    /// Per-session close failures.
    pub reap_close_errors: Counter,
    /// Failed stale-session scans.
    pub reap_scan_errors: Counter,
    /// Duration of a complete reaper pass.
    pub reap_duration: Histogram,

    // === Store ===
    /// Store errors by operation.
    pub store_errors: CounterVec,
    /// Store round-trip duration by operation.
    pub store_query_duration: HistogramVec,
    /// Whether the store pool is connected (1=yes, 0=no).
    pub store_connected: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let heartbeats_enqueued = Counter::with_opts(
            Opts::new(
                "heartbeats_enqueued_total",
                "Total heartbeats accepted into the coalescing buffer.",
            )
            .namespace(NAMESPACE),
        )?;
        let heartbeats_dropped = CounterVec::new(
            Opts::new(
                "heartbeats_dropped_total",
                "Total heartbeats dropped by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let sessions_merged = Counter::with_opts(
            Opts::new(
                "sessions_merged_total",
                "Total session rows updated by heartbeat flushes.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_batches = CounterVec::new(
            Opts::new("flush_batches_total", "Total flush batches by outcome.")
                .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let flush_batch_size = Histogram::with_opts(
            HistogramOpts::new(
                "flush_batch_size",
                "Deduplicated heartbeat records per flush batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to persist a flush batch, including the retry.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let buffer_size = Gauge::with_opts(
            Opts::new("buffer_size", "Current number of buffered heartbeats.")
                .namespace(NAMESPACE),
        )?;
        let flush_in_progress = Gauge::with_opts(
            Opts::new(
                "flush_in_progress",
                "Whether a flush is currently running (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        let sessions_reaped = Counter::with_opts(
            Opts::new(
                "sessions_reaped_total",
                "Total sessions closed by the liveness reaper.",
            )
            .namespace(NAMESPACE),
        )?;
        let reap_close_errors = Counter::with_opts(
            Opts::new(
                "reap_close_errors_total",
                "Total per-session close failures in the reaper.",
            )
            .namespace(NAMESPACE),
        )?;
        let reap_scan_errors = Counter::with_opts(
            Opts::new(
                "reap_scan_errors_total",
                "Total failed stale-session scans.",
            )
            .namespace(NAMESPACE),
        )?;
        let reap_duration = Histogram::with_opts(
            HistogramOpts::new(
                "reap_duration_seconds",
                "Time to complete one reaper pass.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        let store_errors = CounterVec::new(
            Opts::new("store_errors_total", "Total session store errors by operation.")
                .namespace(NAMESPACE),
            &["operation"],
        )?;
        let store_query_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_query_duration_seconds",
                "Session store round-trip duration by operation.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
            &["operation"],
        )?;
        let store_connected = Gauge::with_opts(
            Opts::new(
                "store_connected",
                "Whether the session store pool is connected (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(heartbeats_enqueued.clone()))?;
        registry.register(Box::new(heartbeats_dropped.clone()))?;
        registry.register(Box::new(sessions_merged.clone()))?;
        registry.register(Box::new(flush_batches.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(buffer_size.clone()))?;
        registry.register(Box::new(flush_in_progress.clone()))?;
        registry.register(Box::new(sessions_reaped.clone()))?;
        registry.register(Box::new(reap_close_errors.clone()))?;
        registry.register(Box::new(reap_scan_errors.clone()))?;
        registry.register(Box::new(reap_duration.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(store_query_duration.clone()))?;
        registry.register(Box::new(store_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            heartbeats_enqueued,
            heartbeats_dropped,
            sessions_merged,
            flush_batches,
            flush_batch_size,
            flush_duration,
            buffer_size,
            flush_in_progress,
            sessions_reaped,
            reap_close_errors,
            reap_scan_errors,
            reap_duration,
            store_errors,
            store_query_duration,
            store_connected,
        })
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr);

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

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to an all-interfaces bind address.
fn bind_address(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn render_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
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
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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
