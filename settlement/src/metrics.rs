//! Prometheus metrics for settlement

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static! {
    /// Settlement writes by operation and outcome
    pub static ref SETTLEMENT_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "settlement_operations_total",
        "Settlement writes by operation and outcome",
        &["operation", "outcome"]
    )
    .unwrap();

    /// Settlement write duration, submission to confirmation
    pub static ref SETTLEMENT_DURATION: HistogramVec = register_histogram_vec!(
        "settlement_duration_seconds",
        "Settlement write duration in seconds",
        &["operation"]
    )
    .unwrap();
}
