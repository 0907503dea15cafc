//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the ledger. Each ledger instance owns its
//! registry, so several ledgers can live in one process.
//!
//! # Metrics
//!
//! - `custody_operations_total{operation,outcome}` - Operations by result
//! - `custody_transfer_failures_total` - Failed provider pulls and pushes
//! - `custody_total_deposits` - Committed sum of balances
//! - `custody_operation_duration_seconds{operation}` - Operation latency

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Operations by name and outcome
    pub operations_total: IntCounterVec,

    /// Failed transfers
    pub transfer_failures: IntCounter,

    /// Committed total deposits
    pub total_deposits: IntGauge,

    /// Operation duration histogram
    pub operation_duration: HistogramVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("transfer_failures", &self.transfer_failures.get())
            .field("total_deposits", &self.total_deposits.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let operations_total = IntCounterVec::new(
            Opts::new("custody_operations_total", "Ledger operations by outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let transfer_failures = IntCounter::new(
            "custody_transfer_failures_total",
            "Failed asset transfer provider calls",
        )?;
        registry.register(Box::new(transfer_failures.clone()))?;

        let total_deposits =
            IntGauge::new("custody_total_deposits", "Committed sum of account balances")?;
        registry.register(Box::new(total_deposits.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "custody_operation_duration_seconds",
                "Histogram of operation latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            operations_total,
            transfer_failures,
            total_deposits,
            operation_duration,
            registry,
        })
    }

    /// Record a finished operation; `outcome` is "ok" or an error kind label
    pub fn record_operation(&self, operation: &str, outcome: &str, duration_seconds: f64) {
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Record a failed pull or push
    pub fn record_transfer_failure(&self) {
        self.transfer_failures.inc();
    }

    /// Update the total deposits gauge (saturating at `i64::MAX`)
    pub fn set_total_deposits(&self, total: u64) {
        self.total_deposits
            .set(i64::try_from(total).unwrap_or(i64::MAX));
    }

    /// Count of `operation` finished with `outcome`
    pub fn operation_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations_total
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
    pub fn render(&self) -> crate::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| crate::Error::Config(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| crate::Error::Config(format!("Metrics are not UTF-8: {}", e)))
    }
}
