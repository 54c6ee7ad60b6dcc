//! Bounded retry with exponential backoff for remote calls.
//!
//! Every OCR, cleaning, structuring and mutation request goes through
//! [`call_with_retry`]. The operation reports failures as a [`RemoteError`]
//! whose [`ErrorKind`] decides what happens next:
//!
//! * rate-limit / overload / timeout → wait `base_delay * 2^(retry-1)`
//!   (capped at `max_delay`) and try again, up to `max_attempts` in total;
//! * anything else → give up immediately.
//!
//! With the defaults (2 s base, 4 attempts) a call that keeps hitting quota
//! waits 2 s → 4 s → 8 s before reporting failure for its page or chunk.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, warn};

/// Whether a remote failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 429 / quota exhausted.
    RateLimited,
    /// 5xx, overloaded, connection reset.
    Transient,
    /// The attempt exceeded its timeout.
    Timeout,
    /// Auth, bad request, content filter … retrying will not help.
    Permanent,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

/// A single failed remote attempt.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error from a provider message, classifying it on the way.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_message(&message),
            message,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }
}

/// The retry budget ran out, or a permanent error stopped it early.
#[derive(Debug, Clone, Error)]
#[error("{last} (after {attempts} attempt(s))")]
pub struct RetryError {
    pub attempts: u32,
    pub last: RemoteError,
}

/// A successful value together with the number of attempts it took.
#[derive(Debug, Clone)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always treated as ≥ 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt timeout; expiry counts as [`ErrorKind::Timeout`].
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based). Non-decreasing in `retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget is spent.
///
/// `op` receives the 1-based attempt number. `label` only feeds the logs.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<Attempted<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if attempt > 1 {
            let backoff = policy.delay_for(attempt - 1);
            warn!(
                "{}: retry {}/{} after {}ms",
                label,
                attempt - 1,
                max_attempts - 1,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }

        let outcome = match policy.attempt_timeout {
            Some(limit) => match timeout(limit, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::new(
                    ErrorKind::Timeout,
                    format!("timed out after {}s", limit.as_secs()),
                )),
            },
            None => op(attempt).await,
        };

        match outcome {
            Ok(value) => {
                debug!("{}: succeeded on attempt {}", label, attempt);
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) if err.kind.is_retryable() && attempt < max_attempts => {
                warn!(
                    "{}: attempt {} failed ({:?}) — {}",
                    label, attempt, err.kind, err.message
                );
            }
            Err(err) => {
                warn!(
                    "{}: giving up after {} attempt(s) ({:?}) — {}",
                    label, attempt, err.kind, err.message
                );
                return Err(RetryError {
                    attempts: attempt,
                    last: err,
                });
            }
        }
    }
}

/// Classify a provider error message.
///
/// Provider crates surface HTTP failures as text, so the decision is made on
/// well-known status codes and phrases.
pub fn classify_message(message: &str) -> ErrorKind {
    let m = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if has(&[
        "429",
        "rate limit",
        "rate_limit",
        "ratelimit",
        "too many requests",
        "quota",
        "resource exhausted",
        "resource_exhausted",
        "resourceexhausted",
    ]) {
        ErrorKind::RateLimited
    } else if has(&["timed out", "timeout", "deadline exceeded"]) {
        ErrorKind::Timeout
    } else if has(&[
        "500",
        "502",
        "503",
        "504",
        "overloaded",
        "unavailable",
        "internal server error",
        "bad gateway",
        "connection reset",
        "connection closed",
        "temporarily",
    ]) {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

/// Enforces a minimum interval between the *starts* of remote calls.
///
/// Cheap to clone; clones share the same schedule, so an ordered worker pool
/// can hold one pacer across all of its workers.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    next_slot: Arc<Mutex<Option<Instant>>>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait for the next free slot and reserve it.
    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        let start = match *next {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        *next = Some(start + self.interval);
        drop(next);
        sleep_until(start).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(60),
            attempt_timeout: None,
        }
    }

    #[test]
    fn classify_rate_limit_messages() {
        assert_eq!(classify_message("HTTP 429 Too Many Requests"), ErrorKind::RateLimited);
        assert_eq!(classify_message("RESOURCE_EXHAUSTED: quota"), ErrorKind::RateLimited);
        assert_eq!(classify_message("503 Service Unavailable"), ErrorKind::Transient);
        assert_eq!(classify_message("request timed out"), ErrorKind::Timeout);
        assert_eq!(classify_message("401 invalid api key"), ErrorKind::Permanent);
        assert_eq!(classify_message("400 bad request"), ErrorKind::Permanent);
    }

    #[test]
    fn delays_double_and_cap() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            attempt_timeout: None,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1000));
        assert_eq!(p.delay_for(3), Duration::from_millis(2000));
        assert_eq!(p.delay_for(4), Duration::from_secs(3));
        assert_eq!(p.delay_for(40), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures_with_exact_attempt_count() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = call_with_retry(&policy(5, 1000), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(RemoteError::from_message("429 rate limit"))
                } else {
                    Ok(format!("attempt {n}"))
                }
            }
        })
        .await
        .expect("third attempt succeeds");

        assert_eq!(result.value, "attempt 3");
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // d + 2d of virtual time
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = call_with_retry(&policy(5, 1000), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RemoteError::from_message("401 unauthorized")) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(err.last.kind, ErrorKind::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_error() {
        let err = call_with_retry(&policy(3, 10), "test", |n| async move {
            Err::<(), _>(RemoteError::from_message(format!("503 overloaded #{n}")))
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert!(err.last.message.contains("#3"));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_retryable() {
        let p = RetryPolicy {
            attempt_timeout: Some(Duration::from_secs(1)),
            ..policy(2, 10)
        };
        let result = call_with_retry(&p, "test", |n| async move {
            if n == 1 {
                sleep(Duration::from_secs(5)).await;
            }
            Ok::<_, RemoteError>(n)
        })
        .await
        .unwrap();
        assert_eq!(result.value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_call_starts() {
        let pacer = Pacer::new(Duration::from_millis(1000));
        let t0 = Instant::now();
        pacer.wait().await;
        assert_eq!(t0.elapsed(), Duration::ZERO);
        pacer.wait().await;
        assert_eq!(t0.elapsed(), Duration::from_millis(1000));
        pacer.clone().wait().await;
        assert_eq!(t0.elapsed(), Duration::from_millis(2000));
    }
}
