//! Prometheus metrics for receiver health and observability.
//!
//! Served over HTTP at `/metrics` with a trivial `/healthz` probe. Receive
//! counters are incremented by the driver as events arrive; build-side
//! values are published by the periodic reporter from engine snapshots so
//! the shard hot path carries no registry references.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total reassembled fragments received.
    pub fragments_received: IntCounter,
    /// Fragments rejected by the validator.
    pub validation_errors: IntCounter,
    /// Fragments decoded via byte swap (diagnostic; still processed).
    pub wrong_endian: IntCounter,
    /// Receive-side transport errors.
    pub receive_errors: IntCounter,

    /// Records built across all shards.
    pub frames_built: IntGauge,
    /// Build and sink-write errors across all shards.
    pub build_errors: IntGauge,
    /// Aggregates released with the timestamp error flag set.
    pub timestamp_errors: IntGauge,
    /// Bytes published across all sinks.
    pub bytes_written: IntGauge,
    /// Output files created.
    pub files_created: IntGauge,
    /// Configured shard worker count.
    pub shards: IntGauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let fragments_received = IntCounter::with_opts(
            Opts::new("fragments_received_total", "Total reassembled fragments received.")
                .namespace("frameagg"),
        )?;
        let validation_errors = IntCounter::with_opts(
            Opts::new("validation_errors_total", "Fragments rejected by the validator.")
                .namespace("frameagg"),
        )?;
        let wrong_endian = IntCounter::with_opts(
            Opts::new("wrong_endian_total", "Fragments decoded via byte swap.")
                .namespace("frameagg"),
        )?;
        let receive_errors = IntCounter::with_opts(
            Opts::new("receive_errors_total", "Receive-side transport errors.")
                .namespace("frameagg"),
        )?;
        let frames_built = IntGauge::with_opts(
            Opts::new("frames_built", "Records built across all shards.").namespace("frameagg"),
        )?;
        let build_errors = IntGauge::with_opts(
            Opts::new("build_errors", "Build and sink-write errors.").namespace("frameagg"),
        )?;
        let timestamp_errors = IntGauge::with_opts(
            Opts::new(
                "timestamp_errors",
                "Aggregates released with the timestamp error flag set.",
            )
            .namespace("frameagg"),
        )?;
        let bytes_written = IntGauge::with_opts(
            Opts::new("bytes_written", "Bytes published across all sinks.").namespace("frameagg"),
        )?;
        let files_created = IntGauge::with_opts(
            Opts::new("files_created", "Output files created.").namespace("frameagg"),
        )?;
        let shards = IntGauge::with_opts(
            Opts::new("shards", "Configured shard worker count.").namespace("frameagg"),
        )?;

        registry.register(Box::new(fragments_received.clone()))?;
        registry.register(Box::new(validation_errors.clone()))?;
        registry.register(Box::new(wrong_endian.clone()))?;
        registry.register(Box::new(receive_errors.clone()))?;
        registry.register(Box::new(frames_built.clone()))?;
        registry.register(Box::new(build_errors.clone()))?;
        registry.register(Box::new(timestamp_errors.clone()))?;
        registry.register(Box::new(bytes_written.clone()))?;
        registry.register(Box::new(files_created.clone()))?;
        registry.register(Box::new(shards.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            fragments_received,
            validation_errors,
            wrong_endian,
            receive_errors,
            frames_built,
            build_errors,
            timestamp_errors,
            bytes_written,
            files_created,
            shards,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Accept the ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let state = Arc::new(AppState {
            registry: self.registry.clone(),
        });
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
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

    /// Publish an engine snapshot into the build-side gauges.
    pub fn set_build_stats(&self, stats: &crate::stats::BuildStats) {
        self.frames_built.set(stats.frames_built as i64);
        self.build_errors.set(stats.build_errors as i64);
        self.timestamp_errors.set(stats.timestamp_errors as i64);
        self.bytes_written.set(stats.bytes_written as i64);
        self.files_created.set(stats.files_created as i64);
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
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
