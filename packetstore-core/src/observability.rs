/*!
Observability infrastructure for packetstore.

This module provides:
- Structured logging setup via `tracing-subscriber`
- Prometheus metrics for store reads, writes, cache use and snapshot ticks
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, StoreError};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<StoreMetrics> = OnceLock::new();

/// Metrics collection for store operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct StoreMetrics {
    pub writes_total: Counter,
    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,
    pub query_latency_seconds: Histogram,
    pub snapshots_total: Counter,
    pub snapshot_failures_total: Counter,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl StoreMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help)
                .map_err(|e| StoreError::validation(format!("Failed to create {name} metric: {e}")))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| StoreError::validation(format!("Failed to register {name}: {e}")))?;
            Ok(counter)
        };

        let writes_total = counter("packetstore_writes_total", "Full-replace saves committed")?;
        let cache_hits_total = counter("packetstore_cache_hits_total", "Loads served from the read cache")?;
        let cache_misses_total =
            counter("packetstore_cache_misses_total", "Loads that queried the database")?;
        let snapshots_total = counter("packetstore_snapshots_total", "Successful snapshot ticks")?;
        let snapshot_failures_total =
            counter("packetstore_snapshot_failures_total", "Abandoned snapshot ticks")?;

        let query_latency_seconds = Histogram::with_opts(prometheus::HistogramOpts::new(
            "packetstore_query_latency_seconds",
            "Duration of database loads in seconds",
        ))
        .map_err(|e| StoreError::validation(format!("Failed to create query latency metric: {e}")))?;
        registry
            .register(Box::new(query_latency_seconds.clone()))
            .map_err(|e| StoreError::validation(format!("Failed to register query latency: {e}")))?;

        Ok(Self {
            writes_total,
            cache_hits_total,
            cache_misses_total,
            query_latency_seconds,
            snapshots_total,
            snapshot_failures_total,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static StoreMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize packetstore metrics"))
    }

    pub fn record_write(&self) {
        self.writes_total.inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    pub fn record_query_latency(&self, duration: std::time::Duration) {
        self.query_latency_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_snapshot(&self, success: bool) {
        if success {
            self.snapshots_total.inc();
        } else {
            self.snapshot_failures_total.inc();
        }
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| StoreError::validation(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| StoreError::validation(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` overrides the default `packetstore=info` filter (`debug` when
/// `verbose`). With `json` set, events are emitted as one JSON object per line.
pub fn init_observability(verbose: bool, json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    StoreMetrics::global();

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("packetstore_core={level},packetstore={level}"))
    });

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        StoreError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("packetstore observability initialized");
    Ok(())
}

/// Initialize observability with default settings
pub fn init_default_observability() -> Result<()> {
    init_observability(false, false)
}
