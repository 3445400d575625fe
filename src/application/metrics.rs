//! Operational counters
//!
//! Recorded through the `metrics` facade; whichever recorder the host
//! application installs receives them. Nothing is exported by this crate.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Describe every metric the agent records
pub fn describe_metrics() {
    describe_counter!(
        "sipua_events_dispatched_total",
        "Total number of events delivered to listeners"
    );
    describe_counter!(
        "sipua_auth_retries_total",
        "Total number of authenticated re-sends after a digest challenge"
    );
    describe_counter!(
        "sipua_auth_challenges_dropped_total",
        "Total number of digest challenges ignored after the retry limit"
    );
    describe_counter!(
        "sipua_send_failures_total",
        "Total number of outbound sends that failed"
    );
    describe_counter!(
        "sipua_calls_total",
        "Total number of calls placed or received"
    );
    describe_gauge!("sipua_listeners", "Number of registered event listeners");
}

/// Record one event fan-out
pub fn record_event_dispatched(event_type: &'static str) {
    counter!("sipua_events_dispatched_total", "type" => event_type).increment(1);
}

/// Record an authenticated re-send
pub fn record_auth_retry(method: &'static str) {
    counter!("sipua_auth_retries_total", "method" => method).increment(1);
}

/// Record a challenge ignored because the retry limit was reached
pub fn record_auth_challenge_dropped() {
    counter!("sipua_auth_challenges_dropped_total").increment(1);
}

/// Record a failed outbound send
pub fn record_send_failure(action: &'static str) {
    counter!("sipua_send_failures_total", "action" => action).increment(1);
}

/// Record a call placed or offered
pub fn record_call(direction: &'static str) {
    counter!("sipua_calls_total", "direction" => direction).increment(1);
}

/// Update listener gauge
pub fn update_listeners(count: usize) {
    gauge!("sipua_listeners").set(count as f64);
}
