//! Bounded polling and deadline helpers
//!
//! Every wait in the harness goes through [`poll_until`] or [`within`]. A
//! budget that cannot fit a single attempt fails immediately as a timeout
//! instead of racing the page.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// Timeout and interval for a polled wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn from_millis(timeout_ms: u64, interval_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }

    /// Number of attempts that fit the budget: `interval * attempts <= timeout`.
    pub fn attempts(&self) -> u32 {
        let interval = self.interval.as_millis();
        if interval == 0 {
            return 0;
        }
        (self.timeout.as_millis() / interval).min(u128::from(u32::MAX)) as u32
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// Result of a polled wait
#[derive(Debug)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut {
        /// Attempts actually made (zero when the budget was too small)
        attempts: u32,
        /// Last value observed before giving up
        last: Option<T>,
        /// Last recoverable error raised by the probe
        last_error: Option<HarnessError>,
    },
}

/// What a single probe attempt saw
#[derive(Debug)]
pub enum Probe<T> {
    /// Condition met, stop polling
    Done(T),
    /// Not yet; keep the observation for reporting
    Pending(T),
}

/// Poll `probe` until it returns [`Probe::Done`] or the budget is spent.
///
/// Fatal errors from the probe are returned immediately; any other error
/// is remembered and polling continues.
pub async fn poll_until<T, F, Fut>(policy: PollPolicy, mut probe: F) -> HarnessResult<PollOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HarnessResult<Probe<T>>>,
{
    let attempts = policy.attempts();
    let deadline = Instant::now() + policy.timeout;
    let mut last = None;
    let mut last_error = None;
    let mut made = 0;

    while made < attempts {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        made += 1;

        match tokio::time::timeout(deadline - now, probe()).await {
            Ok(Ok(Probe::Done(value))) => return Ok(PollOutcome::Ready(value)),
            Ok(Ok(Probe::Pending(value))) => {
                last = Some(value);
                last_error = None;
            }
            Ok(Err(err)) if err.is_fatal() => return Err(err),
            Ok(Err(err)) => {
                debug!("poll attempt {} failed: {}", made, err);
                last_error = Some(err);
            }
            Err(_) => break,
        }

        if made < attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(policy.interval.min(remaining)).await;
        }
    }

    Ok(PollOutcome::TimedOut {
        attempts: made,
        last,
        last_error,
    })
}

/// Run a single-shot operation under a deadline.
pub async fn within<T, Fut>(what: &str, timeout: Duration, fut: Fut) -> HarnessResult<T>
where
    Fut: Future<Output = HarnessResult<T>>,
{
    let timeout_err = || HarnessError::Timeout {
        what: what.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    };

    if timeout.is_zero() {
        return Err(timeout_err());
    }

    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(timeout_err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_case::test_case;

    #[test_case(5000, 100, 50; "even split")]
    #[test_case(250, 100, 2; "rounds down")]
    #[test_case(0, 100, 0; "zero timeout")]
    #[test_case(5, 100, 0; "shorter than interval")]
    #[test_case(1000, 0, 0; "zero interval")]
    fn test_attempts(timeout_ms: u64, interval_ms: u64, expected: u32) {
        let policy = PollPolicy::from_millis(timeout_ms, interval_ms);
        assert_eq!(policy.attempts(), expected);
        assert!(policy.interval * policy.attempts() <= policy.timeout);
    }

    #[tokio::test]
    async fn test_zero_budget_never_probes() {
        let calls = AtomicU32::new(0);
        let outcome = poll_until(PollPolicy::from_millis(0, 10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Probe::Done(())) }
        })
        .await
        .unwrap();

        assert!(matches!(outcome, PollOutcome::TimedOut { attempts: 0, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ready_after_retries() {
        let calls = AtomicU32::new(0);
        let outcome = poll_until(PollPolicy::from_millis(1000, 5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n >= 2 {
                    Ok(Probe::Done(n))
                } else {
                    Ok(Probe::Pending(n))
                }
            }
        })
        .await
        .unwrap();

        assert!(matches!(outcome, PollOutcome::Ready(2)));
    }

    #[tokio::test]
    async fn test_fatal_error_short_circuits() {
        let result: HarnessResult<PollOutcome<()>> =
            poll_until(PollPolicy::from_millis(1000, 5), || async {
                Err(HarnessError::DriverClosed)
            })
            .await;
        assert!(matches!(result, Err(HarnessError::DriverClosed)));
    }

    #[tokio::test]
    async fn test_recoverable_error_is_kept() {
        let outcome: PollOutcome<()> = poll_until(PollPolicy::from_millis(30, 10), || async {
            Err(HarnessError::TargetNotFound {
                target: "#x".into(),
                reason: "0 matches".into(),
            })
        })
        .await
        .unwrap();

        match outcome {
            PollOutcome::TimedOut { attempts, last_error, .. } => {
                assert!(attempts >= 1 && attempts <= 3);
                assert!(matches!(last_error, Some(HarnessError::TargetNotFound { .. })));
            }
            PollOutcome::Ready(_) => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn test_within_zero_is_timeout() {
        let result = within("noop", Duration::ZERO, async { Ok(()) }).await;
        assert!(matches!(result, Err(HarnessError::Timeout { timeout_ms: 0, .. })));
    }

    #[tokio::test]
    async fn test_within_bounds_pending_future() {
        let result: HarnessResult<()> =
            within("stall", Duration::from_millis(20), std::future::pending()).await;
        assert!(matches!(result, Err(HarnessError::Timeout { .. })));
    }
}
