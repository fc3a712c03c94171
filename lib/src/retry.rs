// Copyright 2024 The GitStage Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry with exponential backoff.
//!
//! [`retry_with_backoff`] is a higher-order wrapper over an operation
//! and a pure classification function; it knows nothing about HTTP.
//! Timeouts are expressed as retry budgets, not hard deadlines: the
//! wrapper always lets the in-flight attempt complete.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// What to do with an attempt's outcome.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RetryClass {
    /// Return the outcome to the caller, success or not.
    Halt,
    /// Try again. `after` carries a server-requested delay that
    /// overrides the computed backoff.
    Retry { after: Option<Duration> },
}

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt after.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Fractional jitter applied to each delay, e.g. 0.2 for +/-20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            cap: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// The un-jittered delay after the given 1-based attempt:
    /// `min(cap, base * 2^(attempt-1))`.
    pub fn backoff_base(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.cap)
    }

    /// The jittered delay after the given attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_base(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let scale = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(scale)
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping between
/// attempts per the policy and the classification.
///
/// A retryable outcome on the final attempt is returned to the caller
/// as-is rather than escalated, so the caller decides what a spent
/// retry budget means.
pub async fn retry_with_backoff<T, F, Fut, C>(policy: &RetryPolicy, classify: C, mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    C: Fn(&T) -> RetryClass,
{
    let mut attempt = 1;
    loop {
        let outcome = op().await;
        if attempt >= policy.max_attempts {
            return outcome;
        }
        match classify(&outcome) {
            RetryClass::Halt => return outcome,
            RetryClass::Retry { after } => {
                let delay = after.unwrap_or_else(|| policy.backoff(attempt));
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn classify_err(outcome: &Result<u32, &'static str>) -> RetryClass {
        match outcome {
            Ok(_) => RetryClass::Halt,
            Err(_) => RetryClass::Retry { after: None },
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = no_jitter(5);
        assert_eq!(policy.backoff_base(1), Duration::from_millis(250));
        assert_eq!(policy.backoff_base(2), Duration::from_millis(500));
        assert_eq!(policy.backoff_base(3), Duration::from_millis(1000));
        assert_eq!(policy.backoff_base(7), Duration::from_secs(10));
        assert_eq!(policy.backoff_base(60), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            let base = policy.backoff_base(attempt);
            let jittered = policy.backoff(attempt);
            assert!(jittered >= base.mul_f64(0.8), "{jittered:?} < 80% of {base:?}");
            assert!(jittered <= base.mul_f64(1.2), "{jittered:?} > 120% of {base:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_without_retry() {
        let calls = Cell::new(0);
        let result: Result<u32, &str> = retry_with_backoff(&no_jitter(5), classify_err, || {
            calls.set(calls.get() + 1);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Cell::new(0);
        let result: Result<u32, &str> = retry_with_backoff(&no_jitter(5), classify_err, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { if n < 3 { Err("transient") } else { Ok(n) } }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_outcome_halts() {
        let calls = Cell::new(0);
        let result: Result<u32, &str> = retry_with_backoff(
            &no_jitter(5),
            |_| RetryClass::Halt,
            || {
                calls.set(calls.get() + 1);
                async { Err("terminal") }
            },
        )
        .await;
        assert_eq!(result, Err("terminal"));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_returns_last_outcome() {
        let calls = Cell::new(0);
        let result: Result<u32, &str> = retry_with_backoff(&no_jitter(3), classify_err, || {
            calls.set(calls.get() + 1);
            async { Err("still down") }
        })
        .await;
        // The retryable failure on the last attempt is returned, not
        // escalated.
        assert_eq!(result, Err("still down"));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_delay_overrides_backoff() {
        let start = tokio::time::Instant::now();
        let calls = Cell::new(0);
        let _: Result<u32, &str> = retry_with_backoff(
            &no_jitter(2),
            |_| RetryClass::Retry {
                after: Some(Duration::from_secs(42)),
            },
            || {
                calls.set(calls.get() + 1);
                async { Err("rate limited") }
            },
        )
        .await;
        assert_eq!(calls.get(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_accumulate() {
        let start = tokio::time::Instant::now();
        let _: Result<u32, &str> = retry_with_backoff(&no_jitter(3), classify_err, || async {
            Err("transient")
        })
        .await;
        // 250ms + 500ms between the three attempts.
        assert_eq!(start.elapsed(), Duration::from_millis(750));
    }
}
