//! Platboot retry: backoff policies and a cancellable retry loop.
//!
//! A [`Backoff`] is a lazy, possibly bounded sequence of wait durations. The
//! loop in [`retry_notify`] asks it for the next wait after every retryable
//! failure and stops when the sequence is exhausted, the error is permanent,
//! or the cancellation token fires.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use platboot_core::{BootError, BootResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const INITIAL_INTERVAL: Duration = Duration::from_millis(500);

/// Stop/delay strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Doubling interval capped at `max_interval`; exhausted once `max_wait` has elapsed.
    Exponential { max_wait: Duration, max_interval: Duration },
    /// Same interval every time; exhausted once `timeout` has elapsed.
    ConstantInterval { interval: Duration, timeout: Duration },
    /// Same interval every time; exhausted after `count` retries.
    MaxRetries { count: u32, interval: Duration },
}

/// Stateful instance of a [`Policy`]. Never share one between calls.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: Policy,
    started: Instant,
    current: Duration,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: Policy) -> Self {
        let current = match policy {
            Policy::Exponential { max_interval, .. } => INITIAL_INTERVAL.min(max_interval),
            Policy::ConstantInterval { interval, .. } | Policy::MaxRetries { interval, .. } => interval,
        };
        Self { policy, started: Instant::now(), current, retries: 0 }
    }

    pub fn exponential(max_wait: Duration, max_interval: Duration) -> Self {
        Self::new(Policy::Exponential { max_wait, max_interval })
    }

    pub fn constant(timeout: Duration, interval: Duration) -> Self {
        Self::new(Policy::ConstantInterval { interval, timeout })
    }

    pub fn max_retries(count: u32, interval: Duration) -> Self {
        Self::new(Policy::MaxRetries { count, interval })
    }

    /// Exponential, 2 min budget, 5 s cap.
    pub fn short() -> Self { Self::exponential(Duration::from_secs(120), Duration::from_secs(5)) }
    /// Exponential, 10 min budget, 30 s cap.
    pub fn medium() -> Self { Self::exponential(Duration::from_secs(600), Duration::from_secs(30)) }

    pub fn elapsed(&self) -> Duration { self.started.elapsed() }

    /// Start the sequence over, including the elapsed-time budget.
    pub fn reset(&mut self) { *self = Self::new(self.policy); }

    /// End of the elapsed-time budget; `MaxRetries` has none.
    fn deadline(&self) -> Option<Instant> {
        match self.policy {
            Policy::Exponential { max_wait, .. } => Some(self.started + max_wait),
            Policy::ConstantInterval { timeout, .. } => Some(self.started + timeout),
            Policy::MaxRetries { .. } => None,
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match self.policy {
            Policy::Exponential { max_wait, max_interval } => {
                if self.elapsed() >= max_wait {
                    return None;
                }
                let wait = self.current;
                self.current = self.current.saturating_mul(2).min(max_interval);
                Some(wait)
            }
            Policy::ConstantInterval { interval, timeout } => {
                if self.elapsed() >= timeout { None } else { Some(interval) }
            }
            Policy::MaxRetries { count, interval } => {
                if self.retries >= count {
                    return None;
                }
                self.retries += 1;
                Some(interval)
            }
        }
    }
}

/// Run `op` until it succeeds, fails permanently, the backoff is exhausted or
/// `cancel` fires. On exhaustion the last error is returned as-is; callers
/// decide how to wrap it.
pub async fn retry<T, F, Fut>(backoff: &mut Backoff, cancel: &CancellationToken, op: F) -> BootResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BootResult<T>>,
{
    retry_notify(backoff, cancel, op, |_, _| {}).await
}

/// Like [`retry`], calling `notify(error, next_wait)` after every failed
/// attempt. The last failure before giving up is reported with a zero wait.
///
/// Time-bounded policies also bound each attempt: an attempt still running
/// when the budget ends is abandoned and the previous failure (or a transient
/// timeout when there was none) is returned.
pub async fn retry_notify<T, F, Fut, N>(
    backoff: &mut Backoff,
    cancel: &CancellationToken,
    mut op: F,
    mut notify: N,
) -> BootResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BootResult<T>>,
    N: FnMut(&BootError, Duration),
{
    let mut attempt = 0u32;
    let mut last: Option<BootError> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(BootError::Canceled);
        }
        attempt += 1;
        counter!("retry_attempts_total", 1u64);
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BootError::Canceled),
            r = op() => r,
            _ = sleep_until_or_never(backoff.deadline()) => {
                debug!(attempt, budget = ?backoff.elapsed(), "attempt outlived the retry budget");
                counter!("retry_exhausted_total", 1u64);
                let err = last.take().unwrap_or_else(|| {
                    BootError::transient(format!("attempt {} still running after {:?}", attempt, backoff.elapsed()))
                });
                notify(&err, Duration::ZERO);
                return Err(err);
            }
        };
        let err = match res {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !err.is_retryable() {
            debug!(attempt, error = %err, "permanent failure; not retrying");
            return Err(err);
        }
        let Some(wait) = backoff.next() else {
            debug!(attempt, error = %err, "backoff exhausted");
            counter!("retry_exhausted_total", 1u64);
            notify(&err, Duration::ZERO);
            return Err(err);
        };
        notify(&err, wait);
        last = Some(err.clone());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BootError::Canceled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
