//! Observability (C9): Prometheus metrics export.
//!
//! - Agent counts by status (a live gauge, rebuilt from C2 on every scrape)
//! - Agent execution duration histogram
//! - Cumulative per-execution counters (findings posted, API calls/errors, ...)
//! - Queue depth
//! - HTTP request counters/latency
//! - Error counters by class

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use reviewbot_core::Database;

pub struct MetricsCollector {
    registry: Registry,

    agents_total: GaugeVec,
    agent_execution_seconds: HistogramVec,
    execution_counters: GaugeVec,

    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,

    queue_depth: GaugeVec,

    errors_total: CounterVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let agents_total = GaugeVec::new(
            Opts::new("reviewbot_agents_total", "Number of agent executions by status"),
            &["status"],
        )?;

        let agent_execution_seconds = HistogramVec::new(
            HistogramOpts::new(
                "reviewbot_agent_execution_seconds",
                "Review agent execution duration in seconds",
            )
            .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["status"],
        )?;

        let execution_counters = GaugeVec::new(
            Opts::new(
                "reviewbot_execution_counter_total",
                "Cumulative per-execution counters, summed across all agent runs",
            ),
            &["counter"],
        )?;

        let http_requests_total = CounterVec::new(
            Opts::new("reviewbot_http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "reviewbot_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["method", "path"],
        )?;

        let queue_depth = GaugeVec::new(
            Opts::new("reviewbot_queue_depth", "Current number of unclaimed jobs in the queue"),
            &["queue"],
        )?;

        let errors_total = CounterVec::new(
            Opts::new("reviewbot_errors_total", "Total errors by class"),
            &["error_type"],
        )?;

        registry.register(Box::new(agents_total.clone()))?;
        registry.register(Box::new(agent_execution_seconds.clone()))?;
        registry.register(Box::new(execution_counters.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            agents_total,
            agent_execution_seconds,
            execution_counters,
            http_requests_total,
            http_request_duration_seconds,
            queue_depth,
            errors_total,
        })
    }

    /// Rebuilds the agent-status gauge and execution duration histogram from
    /// the store. Safe to call on every scrape: cheap aggregate queries,
    /// not per-row replay.
    async fn update_agent_metrics(&self, db: &Database) -> Result<(), Box<dyn std::error::Error>> {
        self.agents_total.reset();
        for (status, count) in db.count_agents_by_status().await? {
            self.agents_total.with_label_values(&[status.as_str()]).set(count as f64);
        }

        for duration_secs in db.agent_execution_seconds().await? {
            self.agent_execution_seconds.with_label_values(&["completed"]).observe(duration_secs);
        }

        let totals = db.total_execution_metrics().await?;
        self.execution_counters.with_label_values(&["files_analyzed"]).set(totals.files_analyzed as f64);
        self.execution_counters.with_label_values(&["findings_posted"]).set(totals.findings_posted as f64);
        self.execution_counters
            .with_label_values(&["duplicates_skipped"])
            .set(totals.duplicates_skipped as f64);
        self.execution_counters
            .with_label_values(&["resolutions_marked"])
            .set(totals.resolutions_marked as f64);
        self.execution_counters.with_label_values(&["api_calls"]).set(totals.api_calls as f64);
        self.execution_counters.with_label_values(&["api_errors"]).set(totals.api_errors as f64);

        Ok(())
    }

    async fn update_queue_metrics(&self, db: &Database) -> Result<(), Box<dyn std::error::Error>> {
        let depth = db.queue_depth().await?;
        self.queue_depth.with_label_values(&["review_jobs"]).set(depth as f64);
        Ok(())
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_seconds: f64) {
        self.http_requests_total
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_seconds);
    }

    pub fn record_error(&self, error_type: &str) {
        self.errors_total.with_label_values(&[error_type]).inc();
    }

    pub async fn gather(&self, db: &Database) -> Result<String, Box<dyn std::error::Error>> {
        self.update_agent_metrics(db).await?;
        self.update_queue_metrics(db).await?;

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("failed to construct metrics collector")
    }
}
