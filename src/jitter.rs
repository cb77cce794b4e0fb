//! Jitter helpers for probe intervals and resubscribe backoff.
//!
//! `Duration` has no `SampleUniform` impl, so we sample nanosecond counts
//! on the thread-local RNG and rebuild a `Duration` from the result.

use std::time::Duration;

use rand::Rng;

/// Returns `base` plus a uniformly random amount in `[0, max_jitter]`.
pub fn jitter_duration(base: Duration, max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return base;
    }
    let extra_nanos = rand::thread_rng().gen_range(0..=max_jitter.as_nanos());
    base + Duration::from_nanos(extra_nanos as u64)
}

/// Returns a uniformly random duration in `[lower, upper]`. Falls back to
/// `lower` if the range is degenerate (`upper <= lower`).
pub fn uniform_duration(lower: Duration, upper: Duration) -> Duration {
    if upper <= lower {
        return lower;
    }
    let lo = lower.as_nanos();
    let hi = upper.as_nanos();
    let nanos = rand::thread_rng().gen_range(lo..=hi);
    Duration::from_nanos(nanos as u64)
}
