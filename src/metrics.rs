use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use std::time::Duration;

/// Repository metrics collector
pub struct AvmMetrics {
    /// Total repository operations
    pub operations_total: CounterVec,
    /// Operation duration in seconds
    pub operation_duration: HistogramVec,
    /// Failed operations by error kind
    pub operation_errors: CounterVec,
    /// Snapshots taken
    pub snapshots_total: Counter,
    /// Completed reaper sweeps
    pub reaper_sweeps_total: Counter,
    /// Nodes reclaimed by the reaper
    pub reaper_reclaimed_total: Counter,
    /// Nodes currently held in the arena
    pub nodes: Gauge,
}

impl AvmMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let operations_total = CounterVec::new(
            Opts::new("strata_operations_total", "Total repository operations"),
            &["operation"],
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "strata_operation_duration_seconds",
                "Repository operation duration in seconds",
            ),
            &["operation"],
        )?;

        let operation_errors = CounterVec::new(
            Opts::new("strata_operation_errors_total", "Repository operation errors"),
            &["operation", "kind"],
        )?;

        let snapshots_total = Counter::new("strata_snapshots_total", "Snapshots taken")?;

        let reaper_sweeps_total =
            Counter::new("strata_reaper_sweeps_total", "Completed orphan reaper sweeps")?;

        let reaper_reclaimed_total = Counter::new(
            "strata_reaper_reclaimed_nodes_total",
            "Nodes reclaimed by the orphan reaper",
        )?;

        let nodes = Gauge::new("strata_nodes", "Nodes held in the arena")?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(operation_errors.clone()))?;
        registry.register(Box::new(snapshots_total.clone()))?;
        registry.register(Box::new(reaper_sweeps_total.clone()))?;
        registry.register(Box::new(reaper_reclaimed_total.clone()))?;
        registry.register(Box::new(nodes.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration,
            operation_errors,
            snapshots_total,
            reaper_sweeps_total,
            reaper_reclaimed_total,
            nodes,
        })
    }

    pub fn record_operation(&self, operation: &str, duration: Duration, error: Option<&str>) {
        self.operations_total.with_label_values(&[operation]).inc();
        self.operation_duration.with_label_values(&[operation]).observe(duration.as_secs_f64());
        if let Some(kind) = error {
            self.operation_errors.with_label_values(&[operation, kind]).inc();
        }
    }
}
