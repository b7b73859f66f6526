//! Retry policy engine.
//!
//! Pure functions over [`RetryConfig`]: given the attempt number and the
//! failure tag, decide whether to retry and how long to wait. The attempt
//! number is 1-based (the first retry computes `delay_for_attempt(cfg, 1)`).

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;

use warden_store::models::{ErrorTag, RetryConfig, RetryStrategy};

/// Fibonacci multipliers for [`RetryStrategy::FibonacciBackoff`],
/// Fib(1) = Fib(2) = 1. Attempts beyond the table reuse the last entry;
/// the max-delay clamp dominates long before that.
const FIB: [u64; 16] = [1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610, 987];

/// Raw (unjittered) delay in seconds for the given 1-based attempt.
///
/// `hour_of_day` feeds the adaptive strategy: quiet night hours retry
/// quickly, business hours back off hard.
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32, hour_of_day: u32) -> f64 {
    let attempt = attempt.max(1);
    let initial = config.initial_delay_secs as f64;
    let max = config.max_delay_secs as f64;

    let delay = match config.strategy {
        RetryStrategy::Immediate => 0.0,
        RetryStrategy::LinearBackoff => initial * attempt as f64,
        RetryStrategy::ExpBackoff => initial * config.backoff_factor.powi(attempt as i32 - 1),
        RetryStrategy::FibonacciBackoff => {
            let idx = (attempt as usize).min(FIB.len()) - 1;
            initial * FIB[idx] as f64
        }
        RetryStrategy::Adaptive => {
            let base = match hour_of_day {
                0..=5 => 30.0,
                9..=16 => 300.0,
                _ => 120.0,
            };
            base * 1.5_f64.powi((attempt - 1).min(5) as i32)
        }
    };

    delay.min(max).max(0.0)
}

/// Delay with configured jitter applied: uniform noise in ±25 % when the
/// strategy produced a non-zero delay.
pub fn jittered_delay(config: &RetryConfig, attempt: u32, hour_of_day: u32) -> f64 {
    let delay = delay_for_attempt(config, attempt, hour_of_day);
    if !config.jitter || delay <= 0.0 {
        return delay;
    }
    let spread = delay * 0.25;
    let noise = rand::rng().random_range(-spread..=spread);
    (delay + noise).max(0.0)
}

/// Absolute next-attempt time: `now + jittered delay`, using `now`'s UTC
/// hour for the adaptive strategy.
pub fn next_attempt_at(config: &RetryConfig, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = jittered_delay(config, attempt, now.hour());
    now + chrono::Duration::milliseconds((delay * 1000.0) as i64)
}

/// Retry eligibility for a failed attempt.
///
/// `retry_count` is the number of attempts already consumed. The decision
/// order: attempt budget, skip-on deny-list, retry-on allow-list; with no
/// explicit tag policy, the tag's default retriability applies and a
/// worker-supplied `retry_recommended = false` hint can veto it.
pub fn should_retry(
    config: &RetryConfig,
    retry_count: u32,
    tag: ErrorTag,
    retry_recommended: Option<bool>,
) -> bool {
    if retry_count >= config.max_attempts {
        return false;
    }
    if config.skip_on.contains(&tag) {
        return false;
    }
    if !config.retry_on.is_empty() {
        return config.retry_on.contains(&tag);
    }
    if !tag.retriable_by_default() {
        return false;
    }
    retry_recommended.unwrap_or(true)
}
