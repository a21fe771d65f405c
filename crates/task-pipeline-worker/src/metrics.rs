use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Prometheus metrics for a pipeline run
pub struct PipelineMetrics {
    pub registry: Registry,

    // Final task outcomes: succeeded / quarantined
    pub tasks_total: IntCounterVec,

    // Individual handler invocations: ok / error
    pub attempts_total: IntCounterVec,

    pub backoff_seconds: Histogram,
    pub task_duration: Histogram,

    pub workers_active: IntGauge,
}

impl PipelineMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(
            Opts::new("tp_tasks_total", "Total number of tasks by final outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let attempts_total = IntCounterVec::new(
            Opts::new("tp_attempts_total", "Handler invocations by result"),
            &["result"],
        )?;
        registry.register(Box::new(attempts_total.clone()))?;

        let backoff_seconds = Histogram::with_opts(HistogramOpts::new(
            "tp_backoff_seconds",
            "Backoff slept after a failed attempt, in seconds",
        ))?;
        registry.register(Box::new(backoff_seconds.clone()))?;

        let task_duration = Histogram::with_opts(HistogramOpts::new(
            "tp_task_duration_seconds",
            "Time from dequeue to success or quarantine, including backoff",
        ))?;
        registry.register(Box::new(task_duration.clone()))?;

        let workers_active = IntGauge::new("tp_workers_active", "Number of running workers")?;
        registry.register(Box::new(workers_active.clone()))?;

        Ok(PipelineMetrics {
            registry,
            tasks_total,
            attempts_total,
            backoff_seconds,
            task_duration,
            workers_active,
        })
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.tasks_total.with_label_values(&["succeeded"]).inc();
        self.task_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_quarantine(&self, elapsed: Duration) {
        self.tasks_total.with_label_values(&["quarantined"]).inc();
        self.task_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_attempt(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.attempts_total.with_label_values(&[result]).inc();
    }

    pub fn record_backoff(&self, delay: Duration) {
        self.backoff_seconds.observe(delay.as_secs_f64());
    }

    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.tasks_total.with_label_values(&[outcome]).get()
    }

    pub fn attempt_count(&self, result: &str) -> u64 {
        self.attempts_total.with_label_values(&[result]).get()
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn encode_text(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
