//! Prometheus metrics for rounds, worker results, commands and supervised processes.
//!
//! Everything lives in one process-local registry, served at `/metrics` by the health server and the control API.

use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub struct FederatedLearningMetrics {
    pub rounds_completed_total: IntCounter,
    pub rounds_abandoned_total: IntCounter,
    pub results_accepted_total: IntCounter,
    pub results_rejected_total: IntCounter,
    pub retries_total: IntCounter,
    pub aggregation_latency_ms: Histogram,
}

pub struct ControlMetrics {
    pub commands_received_total: IntCounter,
    pub broadcast_failures_total: IntCounter,
    pub process_spawns_total: IntCounter,
    pub process_restarts_total: IntCounter,
    pub stale_terminations_total: IntCounter,
}

pub static FL_METRICS: Lazy<FederatedLearningMetrics> = Lazy::new(|| FederatedLearningMetrics {
    rounds_completed_total: counter("fl_rounds_completed_total", "Rounds aggregated, evaluated and persisted"),
    rounds_abandoned_total: counter("fl_rounds_abandoned_total", "Rounds abandoned after a failed evaluation"),
    results_accepted_total: counter("fl_worker_results_accepted_total", "Worker results included in aggregation"),
    results_rejected_total: counter("fl_worker_results_rejected_total", "Worker results rejected (late, duplicate, bad layout, failure)"),
    retries_total: counter("fl_round_retries_total", "Round attempts retried after a participant stall"),
    aggregation_latency_ms: histogram("fl_aggregation_latency_ms", "Parameter aggregation latency ms", vec![0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0]),
});

pub static CONTROL_METRICS: Lazy<ControlMetrics> = Lazy::new(|| ControlMetrics {
    commands_received_total: counter("fl_commands_received_total", "Lifecycle commands received by agents"),
    broadcast_failures_total: counter("fl_broadcast_failures_total", "Per-target broadcast sends that failed"),
    process_spawns_total: counter("fl_process_spawns_total", "Supervised processes spawned"),
    process_restarts_total: counter("fl_process_restarts_total", "Supervised process restarts"),
    stale_terminations_total: counter("fl_stale_terminations_total", "Terminations that exceeded the kill timeout"),
});

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("static metric definition is valid");
    if let Err(e) = REGISTRY.register(Box::new(c.clone())) { tracing::warn!(metric = name, error=%e, "metric_register_failed"); }
    c
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let h = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets)).expect("static metric definition is valid");
    if let Err(e) = REGISTRY.register(Box::new(h.clone())) { tracing::warn!(metric = name, error=%e, "metric_register_failed"); }
    h
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String, prometheus::Error> {
    Lazy::force(&FL_METRICS);
    Lazy::force(&CONTROL_METRICS);
    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_counters() {
        FL_METRICS.rounds_completed_total.inc();
        let text = render().unwrap();
        assert!(text.contains("fl_rounds_completed_total"));
        assert!(text.contains("fl_process_spawns_total"));
    }
}
