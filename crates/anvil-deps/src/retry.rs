use crate::error::Result;
use rand::Rng;
use std::time::Duration;

/// Backoff schedule for transient failures.
///
/// The defaults give roughly seventeen minutes of cumulative waiting across
/// ten attempts, with every sleep jittered so parallel build invocations
/// hammering the same flaky endpoint spread out instead of retrying in
/// lockstep.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    /// Symmetric relative jitter applied to every sleep, e.g. `0.3` for ±30%.
    pub jitter: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2,
            jitter: 0.3,
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

/// Run `op` until it succeeds, fails non-transiently, or exhausts the attempt
/// budget. The last failure is re-raised as-is.
///
/// The sleep between attempts is a plain blocking `thread::sleep`; once
/// entered it cannot be cancelled short of process termination.
pub(crate) fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut delay = policy.initial_delay;
    let mut attempt = 1u32;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= policy.max_attempts.max(1) => return Err(err),
            Err(err) => {
                let sleep = jittered(delay, policy);
                tracing::debug!(
                    target = "anvil.deps",
                    what,
                    attempt,
                    sleep_ms = sleep.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                std::thread::sleep(sleep);
                delay = (delay * policy.backoff_factor).min(policy.max_delay);
                attempt += 1;
            }
        }
    }
}

fn jittered(delay: Duration, policy: &RetryPolicy) -> Duration {
    let jitter = policy.jitter.clamp(0.0, 1.0);
    let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0)).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DepsError;
    use std::path::PathBuf;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 2,
            jitter: 0.0,
            max_delay: Duration::from_millis(4),
        }
    }

    fn transient() -> DepsError {
        DepsError::HttpTransport {
            url: "https://example.org/a".to_string(),
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() -> Result<()> {
        let mut calls = 0u32;
        let value = retry_with_backoff(&fast_policy(5), "test", |attempt| {
            calls += 1;
            assert_eq!(attempt, calls);
            if calls < 3 {
                Err(transient())
            } else {
                Ok(42)
            }
        })?;
        assert_eq!(value, 42);
        assert_eq!(calls, 3);
        Ok(())
    }

    #[test]
    fn exhausting_the_budget_reraises_the_last_failure() {
        let mut calls = 0u32;
        let result: Result<()> = retry_with_backoff(&fast_policy(4), "test", |_attempt| {
            calls += 1;
            Err(transient())
        });
        assert_eq!(calls, 4);
        assert!(matches!(result, Err(DepsError::HttpTransport { .. })));
    }

    #[test]
    fn non_transient_failures_are_not_retried() {
        let mut calls = 0u32;
        let result: Result<()> = retry_with_backoff(&fast_policy(10), "test", |_attempt| {
            calls += 1;
            Err(DepsError::UnknownArchiveFormat {
                path: PathBuf::from("/tmp/a.bin"),
                magic: 0,
            })
        });
        assert_eq!(calls, 1);
        assert!(matches!(
            result,
            Err(DepsError::UnknownArchiveFormat { .. })
        ));
    }

    #[test]
    fn jitter_stays_within_bounds_and_under_the_cap() {
        let policy = RetryPolicy {
            jitter: 0.3,
            max_delay: Duration::from_millis(1200),
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let sleep = jittered(Duration::from_secs(1), &policy);
            assert!(sleep >= Duration::from_millis(700), "sleep {sleep:?}");
            assert!(sleep <= Duration::from_millis(1200), "sleep {sleep:?}");
        }
    }
}
