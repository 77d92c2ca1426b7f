//! Async driver for [`RetryPolicy`].

use std::fmt::Display;
use std::future::Future;

use factory_core::retry::{FailureClass, RetryDecision, RetryPolicy};
use tracing::{debug, warn};

/// Runs `op` until it succeeds, `classify` calls an error permanent, or the
/// policy's attempts are used up. Returns the last error.
pub async fn retry_if<F, Fut, T, E, C>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
    mut classify: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> FailureClass,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => {
                if attempt > 1 {
                    debug!(what, attempt, "succeeded after retries");
                }
                return Ok(v);
            }
            Err(e) => {
                let class = classify(&e);
                let decision = {
                    let mut rng = rand::thread_rng();
                    policy.decide(class, attempt, &mut rng)
                };
                match decision {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            what,
                            attempt,
                            max = policy.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "attempt failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => {
                        warn!(what, attempt, ?class, error = %e, "giving up");
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> = retry_if(
            &fast(6),
            "flaky",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("fail {n}"))
                } else {
                    Ok(n)
                }
            },
            |_| FailureClass::Transient,
        )
        .await;
        assert_eq!(out, Ok(3));
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = retry_if(
            &fast(4),
            "down",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("fail {n}"))
            },
            |_| FailureClass::Transient,
        )
        .await;
        assert_eq!(out, Err("fail 4".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), &str> = retry_if(
            &fast(6),
            "gone",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("404")
            },
            |_| FailureClass::Permanent,
        )
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
