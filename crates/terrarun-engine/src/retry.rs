// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capped exponential backoff.
//!
//! Long retry sequences use a [`Backoff`] tracker in a loop instead of
//! recursion: the delay doubles on every failure, never exceeds the
//! configured ceiling and resets after a success.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay bounds for a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Ceiling the delay never exceeds.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Start a fresh tracker.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }
}

/// Bounded-growth delay tracker.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    /// Create a tracker with no recorded failures.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.policy
            .initial
            .saturating_mul(multiplier)
            .min(self.policy.max)
    }

    /// Record a failure and sleep for the resulting delay.
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }

    /// Forget recorded failures after a success.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Run `op` until it succeeds, sleeping with backoff between failures.
pub async fn retry_forever<T, E, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut backoff = policy.backoff();
    loop {
        match op().await {
            Ok(value) => return value,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    operation,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Like [`retry_forever`], but gives up on errors `is_terminal` accepts.
pub async fn retry_unless<T, E, F, Fut, P>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
    is_terminal: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = policy.backoff();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_terminal(&e) => return Err(e),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    operation,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
