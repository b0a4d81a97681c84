//! Retry policy and payload simplification for step invocations.
//!
//! Backoff is linear: the wait before retry `n` (1-based) is
//! `backoff_base_ms * n`. Waits are cut short by run cancellation.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use weft_types::config::SimplifyConfig;
use weft_types::flow::Policy;

/// Resolved retry settings for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(policy: Policy, backoff_base_ms: u64) -> Self {
        Self {
            max_retries: policy.max_retries,
            timeout: Duration::from_millis(policy.timeout_ms),
            backoff_base: Duration::from_millis(backoff_base_ms),
        }
    }

    /// `retries_done` retries have happened so far.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff_base.saturating_mul(retry)
    }
}

/// Sleep for `delay` unless the token fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Shrink a payload for the simplified fallback attempt: long strings are
/// truncated (on a char boundary) and arrays capped, recursively.
pub fn simplify_payload(value: &Value, limits: &SimplifyConfig) -> Value {
    match value {
        Value::String(s) => {
            if s.chars().count() > limits.max_string_len {
                Value::String(s.chars().take(limits.max_string_len).collect())
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(limits.max_array_len)
                .map(|v| simplify_payload(v, limits))
                .collect(),
        ),
        Value::Object(map) => Value::Object(simplify_map(map, limits)),
        other => other.clone(),
    }
}

pub fn simplify_map(map: &Map<String, Value>, limits: &SimplifyConfig) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), simplify_payload(v, limits)))
        .collect()
}
