//! Per-host token buckets.
//!
//! Buckets are mutated only from the wrapper invocation path; the runtime is
//! a single-threaded cooperative loop, so a plain mutex-wrapped map suffices.

use std::collections::HashMap;

use crate::policy::NetworkPolicy;
use crate::policy::QuotaSpec;
use crate::policy::matches_wildcard_domain;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_ms: f64,
    last: i64,
}

#[derive(Debug, Default)]
pub struct TokenBuckets {
    buckets: HashMap<String, Bucket>,
}

impl TokenBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refills the host's bucket for the elapsed time, then takes one token.
    /// Returns false when the bucket is empty, which the guard maps to a
    /// `rate_limited` block.
    pub fn try_acquire(&mut self, host: &str, now_ms: i64, network: &NetworkPolicy) -> bool {
        let spec = resolve_quota(host, network);
        let refill_per_ms = spec.refill_per_sec / 1000.0;

        let bucket = self.buckets.entry(host.to_string()).or_insert(Bucket {
            tokens: spec.capacity,
            capacity: spec.capacity,
            refill_per_ms,
            last: now_ms,
        });

        // Policy may have changed between invocations; re-derive the shape
        // but never grant more than the new capacity.
        bucket.capacity = spec.capacity;
        bucket.refill_per_ms = refill_per_ms;

        let elapsed = (now_ms - bucket.last).max(0) as f64;
        bucket.tokens = (bucket.tokens + elapsed * bucket.refill_per_ms).min(bucket.capacity);
        bucket.last = now_ms;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.buckets.clear();
    }
}

/// Per-domain override beats the default; among overrides the most specific
/// (longest) matching pattern wins.
fn resolve_quota(host: &str, network: &NetworkPolicy) -> QuotaSpec {
    let mut best: Option<(&String, &QuotaSpec)> = None;
    for (pattern, spec) in &network.quotas.per_domain {
        let matched = pattern.eq_ignore_ascii_case(host) || matches_wildcard_domain(host, pattern);
        if matched
            && best
                .map(|(current, _)| pattern.len() > current.len())
                .unwrap_or(true)
        {
            best = Some((pattern, spec));
        }
    }
    best.map(|(_, spec)| *spec).unwrap_or(network.quotas.default)
}
