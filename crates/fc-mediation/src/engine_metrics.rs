//! Metrics infrastructure for the mediation engine
//!
//! Provides Prometheus-compatible metrics for:
//! - Redelivery attempts and exhaustion outcomes
//! - Dead-letter deliveries
//! - Aggregation lock conflicts and recovery
//! - Thread pool statistics
//! - Inflight exchanges and shutdown duration

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a redelivery attempt about to be made
pub fn record_redelivery_attempt(route_id: &str, attempt: u32) {
    counter!(
        "fc_redelivery_attempts_total",
        "route" => route_id.to_string()
    )
    .increment(1);
    histogram!(
        "fc_redelivery_attempt_number",
        "route" => route_id.to_string()
    )
    .record(attempt as f64);
}

/// Record an exchange whose redelivery was exhausted
pub fn record_exhausted(route_id: &str, outcome: &str) {
    counter!(
        "fc_redelivery_exhausted_total",
        "route" => route_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a send to the dead-letter destination
pub fn record_dead_letter(route_id: &str, success: bool) {
    counter!(
        "fc_dead_letter_total",
        "route" => route_id.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

/// Record an optimistic locking conflict on an aggregation repository
pub fn record_lock_conflict(aggregator: &str) {
    counter!(
        "fc_aggregation_lock_conflicts_total",
        "aggregator" => aggregator.to_string()
    )
    .increment(1);
}

/// Record exchanges restored by a recovery scan
pub fn record_recovered(aggregator: &str, count: usize) {
    counter!(
        "fc_aggregation_recovered_total",
        "aggregator" => aggregator.to_string()
    )
    .increment(count as u64);
}

/// Record an aggregation group completing
pub fn record_completion(aggregator: &str, reason: &str) {
    counter!(
        "fc_aggregation_completed_total",
        "aggregator" => aggregator.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a task rejected by a pool
pub fn record_task_rejected(pool: &str, policy: &str) {
    counter!(
        "fc_pool_tasks_rejected_total",
        "pool" => pool.to_string(),
        "policy" => policy.to_string()
    )
    .increment(1);
}

/// Update pool queue size gauge
pub fn set_pool_queue_size(pool: &str, size: usize) {
    gauge!(
        "fc_pool_queue_size",
        "pool" => pool.to_string()
    )
    .set(size as f64);
}

/// Update pool active workers gauge
pub fn set_pool_active_workers(pool: &str, count: usize) {
    gauge!(
        "fc_pool_active_workers",
        "pool" => pool.to_string()
    )
    .set(count as f64);
}

/// Update inflight exchange count
pub fn set_inflight_count(count: usize) {
    gauge!("fc_inflight_exchanges").set(count as f64);
}

/// Record how long a shutdown took
pub fn record_shutdown(duration: Duration, timed_out: bool) {
    histogram!(
        "fc_shutdown_duration_seconds",
        "timed_out" => timed_out.to_string()
    )
    .record(duration.as_secs_f64());
}
