//! Metrics collection for observability
//!
//! Prometheus metrics for one node. Each node owns its registry so several
//! nodes can run in one process (tests, simulations).
//!
//! # Metrics
//!
//! - `quantum_processed_total` - Quanta applied
//! - `quantum_rejected_total` - Quanta rejected by validation
//! - `quantum_current_apex` - Last applied apex
//! - `quantum_effects_total` - Committed effects
//! - `quantum_snapshots_finalized_total` - Snapshots that reached quorum
//! - `quantum_snapshot_duration_seconds` - Time from snapshot trigger to quorum
//!
//! [`router`] serves the registry at `GET /metrics` in the Prometheus text format.

use crate::{Error, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Quanta applied
    pub quanta_processed: IntCounter,

    /// Quanta rejected
    pub quanta_rejected: IntCounter,

    /// Last applied apex
    pub current_apex: IntGauge,

    /// Committed effects
    pub effects_total: IntCounter,

    /// Confirmed snapshots
    pub snapshots_finalized: IntCounter,

    /// Snapshot confirmation latency
    pub snapshot_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("quanta_processed", &self.quanta_processed.get())
            .field("current_apex", &self.current_apex.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let quanta_processed =
            IntCounter::new("quantum_processed_total", "Total number of quanta applied")?;
        registry.register(Box::new(quanta_processed.clone()))?;

        let quanta_rejected = IntCounter::new(
            "quantum_rejected_total",
            "Total number of quanta rejected by validation",
        )?;
        registry.register(Box::new(quanta_rejected.clone()))?;

        let current_apex = IntGauge::new("quantum_current_apex", "Last applied apex")?;
        registry.register(Box::new(current_apex.clone()))?;

        let effects_total =
            IntCounter::new("quantum_effects_total", "Total number of committed effects")?;
        registry.register(Box::new(effects_total.clone()))?;

        let snapshots_finalized = IntCounter::new(
            "quantum_snapshots_finalized_total",
            "Total number of snapshots confirmed by quorum",
        )?;
        registry.register(Box::new(snapshots_finalized.clone()))?;

        let snapshot_duration = Histogram::with_opts(
            HistogramOpts::new(
                "quantum_snapshot_duration_seconds",
                "Time from snapshot trigger to quorum",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(snapshot_duration.clone()))?;

        Ok(Self {
            quanta_processed,
            quanta_rejected,
            current_apex,
            effects_total,
            snapshots_finalized,
            snapshot_duration,
            registry,
        })
    }

    /// Record an applied quantum
    pub fn record_quantum(&self, apex: u64, effects: usize) {
        self.quanta_processed.inc();
        self.effects_total.inc_by(effects as u64);
        self.current_apex.set(apex as i64);
    }

    /// Record a rejected quantum
    pub fn record_rejection(&self) {
        self.quanta_rejected.inc();
    }

    /// Record a confirmed snapshot
    pub fn record_snapshot_finalized(&self, duration_seconds: f64) {
        self.snapshots_finalized.inc();
        self.snapshot_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode the registry in the Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Other(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Other(format!("Invalid metrics text: {}", e)))
    }
}

async fn metrics_handler(
    State(metrics): State<Metrics>,
) -> std::result::Result<String, (StatusCode, String)> {
    metrics.export().map_err(|e| {
        tracing::warn!(error = %e, "Metrics export failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// HTTP routes exposing `metrics`
pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.quanta_processed.get(), 0);
        assert_eq!(metrics.registry().gather().len(), 6);
    }

    #[test]
    fn test_record_quantum() {
        let metrics = Metrics::new().unwrap();
        metrics.record_quantum(5, 3);
        metrics.record_quantum(6, 2);
        assert_eq!(metrics.quanta_processed.get(), 2);
        assert_eq!(metrics.effects_total.get(), 5);
        assert_eq!(metrics.current_apex.get(), 6);

        metrics.record_rejection();
        assert_eq!(metrics.quanta_rejected.get(), 1);
    }

    #[test]
    fn test_export_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.record_quantum(7, 1);
        let text = metrics.export().unwrap();
        assert!(text.contains("# TYPE quantum_current_apex gauge"));
        assert!(text.contains("quantum_current_apex 7"));
        assert!(text.contains("quantum_processed_total 1"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejection();
        let response = metrics_handler(State(metrics)).await.unwrap();
        assert!(response.contains("quantum_rejected_total 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_snapshot_finalized(0.2);
        assert_eq!(a.snapshots_finalized.get(), 1);
        assert_eq!(b.snapshots_finalized.get(), 0);
    }
}
