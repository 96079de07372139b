//! Prometheus metrics for the relay
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    // Intake
    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_events_observed_total",
        "Chain-native events seen by listeners, before parsing",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_REJECTED: CounterVec = register_counter_vec!(
        "relayer_events_rejected_total",
        "Events that failed to parse or normalize",
        &["chain"]
    ).unwrap();

    // Routing
    pub static ref MESSAGES_ROUTED: CounterVec = register_counter_vec!(
        "relayer_messages_routed_total",
        "Messages dispatched to a destination queue",
        &["src_chain", "dest_chain"]
    ).unwrap();

    pub static ref MESSAGES_DROPPED: CounterVec = register_counter_vec!(
        "relayer_messages_dropped_total",
        "Messages dropped by the router",
        &["reason"]
    ).unwrap();

    // Execution
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "relayer_submissions_total",
        "Executor outcomes per destination chain",
        &["chain", "status"]
    ).unwrap();

    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "relayer_retries_total",
        "Retried submissions after a retryable failure",
        &["chain"]
    ).unwrap();

    pub static ref EXECUTION_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_execution_latency_seconds",
        "Time from dequeue to confirmed or failed",
        &["chain"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "relayer_queue_depth",
        "Messages waiting in a destination execution queue",
        &["chain"]
    ).unwrap();

    pub static ref EXECUTOR_HALTED: GaugeVec = register_gauge_vec!(
        "relayer_executor_halted",
        "1 when an executor stopped after a credential failure",
        &["chain"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "relayer_consecutive_failures",
        "Number of consecutive failures (circuit breaker)",
        &["chain"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

pub fn record_event_observed(chain: &str) {
    EVENTS_OBSERVED.with_label_values(&[chain]).inc();
}

pub fn record_event_rejected(chain: &str) {
    EVENTS_REJECTED.with_label_values(&[chain]).inc();
}

pub fn record_routed(src_chain: &str, dest_chain: &str) {
    MESSAGES_ROUTED
        .with_label_values(&[src_chain, dest_chain])
        .inc();
}

pub fn record_dropped(reason: &str) {
    MESSAGES_DROPPED.with_label_values(&[reason]).inc();
}

/// Record a terminal executor outcome
pub fn record_submission(chain: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    SUBMISSIONS.with_label_values(&[chain, status]).inc();
}

pub fn record_retry(chain: &str) {
    RETRIES.with_label_values(&[chain]).inc();
}

pub fn record_latency(chain: &str, seconds: f64) {
    EXECUTION_LATENCY.with_label_values(&[chain]).observe(seconds);
}

pub fn set_queue_depth(chain: &str, depth: usize) {
    QUEUE_DEPTH.with_label_values(&[chain]).set(depth as f64);
}

pub fn set_executor_halted(chain: &str, halted: bool) {
    EXECUTOR_HALTED
        .with_label_values(&[chain])
        .set(if halted { 1.0 } else { 0.0 });
}

/// Record an error
pub fn record_error(chain: &str, error_type: &str) {
    ERRORS.with_label_values(&[chain, error_type]).inc();
}

/// Update consecutive failures (circuit breaker)
pub fn set_consecutive_failures(chain: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[chain])
        .set(count as f64);
}
