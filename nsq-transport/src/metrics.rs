//! Prometheus metrics for the NSQ transport

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

lazy_static! {
    /// Messages by topic and outcome
    /// (published, deferred, requeued, received, acknowledged, rejected, poison, abandoned, skipped)
    pub static ref MESSAGES_TOTAL: CounterVec = register_counter_vec!(
        "nsq_transport_messages_total",
        "Messages handled by the NSQ transport",
        &["topic", "outcome"]
    )
    .unwrap();

    /// Send duration
    pub static ref SEND_DURATION: HistogramVec = register_histogram_vec!(
        "nsq_transport_send_duration_seconds",
        "Time spent in send, including connection setup",
        &["topic"]
    )
    .unwrap();

    /// Failed keepalive round trips
    pub static ref HEARTBEAT_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "nsq_transport_heartbeat_failures_total",
        "Consumer heartbeats that failed",
        &["topic"]
    )
    .unwrap();
}

/// Count one message outcome
pub(crate) fn record(topic: &str, outcome: &str) {
    MESSAGES_TOTAL.with_label_values(&[topic, outcome]).inc();
}
