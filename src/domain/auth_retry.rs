//! Bounded retry counter for digest challenges

use std::collections::HashMap;

/// Total attempts allowed per call identifier, the first unauthenticated
/// request included.
pub const MAX_REGISTER_ATTEMPTS: u32 = 3;

/// Counts authenticated re-sends per Call-ID.
///
/// Keyed by Call-ID rather than by transaction because every retry opens a
/// new transaction for the same logical registration or call.
#[derive(Debug, Default)]
pub struct AuthRetryTracker {
    attempts: HashMap<String, u32>,
}

impl AuthRetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries already sent for `call_id`
    pub fn attempts(&self, call_id: &str) -> u32 {
        self.attempts.get(call_id).copied().unwrap_or(0)
    }

    /// Whether another challenge for `call_id` may be answered
    pub fn may_retry(&self, call_id: &str) -> bool {
        // the original request already counts as one attempt
        self.attempts(call_id) < MAX_REGISTER_ATTEMPTS - 1
    }

    /// Record one authenticated re-send, returning the new count
    pub fn record_attempt(&mut self, call_id: &str) -> u32 {
        let count = self.attempts.entry(call_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget every call identifier
    pub fn clear(&mut self) {
        self.attempts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
