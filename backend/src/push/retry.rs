// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Retry bookkeeping for provider sends: exponential backoff with uniform
//! jitter, bounded by both an accumulated-delay budget and a retry count.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::ProviderError;

const JITTER_RANGE_MILLIS: i64 = 100;

/// Retry budget parameters.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial_delay_millis: i64,
    pub multiplier: f64,
    pub max_delay_millis: i64,
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_millis: 100,
            multiplier: 2.0,
            max_delay_millis: 4_000,
            max_retries: 10,
        }
    }
}

/// Mutable state of one retried operation.
#[derive(Clone, Copy, Debug)]
pub struct RetryContext {
    max_delay_millis: i64,
    max_retries: i32,
    delay_millis: i64,
    retries: i32,
}

impl RetryContext {
    pub fn new(max_delay_millis: i64, max_retries: i32) -> Self {
        Self {
            max_delay_millis,
            max_retries,
            delay_millis: 0,
            retries: 0,
        }
    }

    /// A retry happens only while both the accumulated delay and the retry
    /// count are under budget.
    pub fn will_retry(&self) -> bool {
        if self.max_delay_millis == 0 && self.delay_millis == 0 {
            false
        } else if self.max_delay_millis > 0 && self.delay_millis >= self.max_delay_millis {
            false
        } else {
            !(self.max_retries > 0 && self.retries >= self.max_retries)
        }
    }

    pub fn retry_count(&self) -> i32 {
        self.retries
    }

    pub fn add_delay_millis(&mut self, delay_millis: i64) {
        self.delay_millis += delay_millis;
    }

    pub fn increase_retry_count(&mut self) {
        self.retries += 1;
    }
}

/// `initial * multiplier^(retries-1)`.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialDelayBackoff {
    initial_delay_millis: i64,
    multiplier: f64,
}

impl ExponentialDelayBackoff {
    pub fn new(initial_delay_millis: i64, multiplier: f64) -> Self {
        Self {
            initial_delay_millis,
            multiplier,
        }
    }

    pub fn delay_millis(&self, context: &RetryContext) -> i64 {
        (self.initial_delay_millis as f64
            * self.multiplier.powi(context.retry_count() - 1)) as i64
    }
}

/// Uniform jitter in `[-100 ms, +100 ms]`, clamped to >= 0.
pub fn uniform_jitter(delay_millis: i64) -> i64 {
    let jitter = rand::thread_rng().gen_range(-JITTER_RANGE_MILLIS..=JITTER_RANGE_MILLIS);
    (delay_millis + jitter).max(0)
}

/// Drive an operation through the retry policy. Terminal errors and
/// cancellation end the loop immediately; transient errors back off and
/// retry while the budget lasts.
pub async fn run_with_retry<F, Fut, T>(
    policy: RetryPolicy,
    stop: &CancellationToken,
    mut attempt: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let backoff = ExponentialDelayBackoff::new(policy.initial_delay_millis, policy.multiplier);
    let mut context = RetryContext::new(policy.max_delay_millis, policy.max_retries);

    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e @ (ProviderError::Terminal(_) | ProviderError::Unsupported)) => return Err(e),
            Err(transient) => {
                context.increase_retry_count();
                if !context.will_retry() {
                    return Err(transient);
                }
                let nominal = backoff.delay_millis(&context);
                context.add_delay_millis(nominal);
                if stop.is_cancelled() {
                    return Err(transient);
                }
                let actual = uniform_jitter(nominal);
                tokio::time::sleep(Duration::from_millis(actual as u64)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    /// Nominal delay schedule for a policy, as produced by the retry loop.
    fn nominal_schedule(policy: RetryPolicy) -> Vec<i64> {
        let backoff =
            ExponentialDelayBackoff::new(policy.initial_delay_millis, policy.multiplier);
        let mut context = RetryContext::new(policy.max_delay_millis, policy.max_retries);
        let mut delays = Vec::new();
        loop {
            context.increase_retry_count();
            if !context.will_retry() {
                break;
            }
            let nominal = backoff.delay_millis(&context);
            context.add_delay_millis(nominal);
            delays.push(nominal);
        }
        delays
    }

    #[test]
    fn default_schedule_is_monotone_and_bounded() {
        let delays = nominal_schedule(RetryPolicy::default());
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200]);
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        // the budget stops the schedule once accumulated delay passes max
        assert!(delays.iter().sum::<i64>() >= 4_000);
    }

    #[test]
    fn retry_count_budget_applies() {
        let delays = nominal_schedule(RetryPolicy {
            initial_delay_millis: 1,
            multiplier: 1.0,
            max_delay_millis: 1_000_000,
            max_retries: 3,
        });
        assert_eq!(delays.len(), 2, "retry 3 hits the count budget");
    }

    #[test]
    fn jitter_never_goes_negative() {
        for _ in 0..1000 {
            assert!(uniform_jitter(0) >= 0);
            let jittered = uniform_jitter(100);
            assert!((0..=200).contains(&jittered));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_k_attempts_issues_k_plus_one() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result: Result<(), _> = run_with_retry(
            RetryPolicy::default(),
            &CancellationToken::new(),
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(ProviderError::Transient("boom".into()))
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_never_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result: Result<(), _> = run_with_retry(
            RetryPolicy::default(),
            &CancellationToken::new(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Terminal("gone".into()))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_surfaces_last_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result: Result<(), _> = run_with_retry(
            RetryPolicy::default(),
            &CancellationToken::new(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Transient("still down".into()))
                }
            },
        )
        .await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
        // 6 nominal delays fit the 4000 ms budget -> 7 attempts in total
        assert_eq!(attempts.load(Ordering::SeqCst), 7);
    }
}
