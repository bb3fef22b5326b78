//! Connection supervision: drives fallible connect/subscribe operations with
//! a fixed-delay retry loop. Bootstrap gets a bounded budget so a broken
//! deployment fails fast; steady-state reconnection retries indefinitely,
//! since a consumer must outlast broker hiccups.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Startup policy: 5 attempts, 2 s apart.
    pub fn bootstrap() -> Self {
        Self {
            max_attempts: Some(5),
            delay: Duration::from_secs(2),
        }
    }

    /// Steady-state reconnection policy: indefinite, 5 s apart.
    pub fn steady() -> Self {
        Self {
            max_attempts: None,
            delay: Duration::from_secs(5),
        }
    }
}

/// Run `op` until it succeeds or the policy's attempt budget is exhausted,
/// in which case the last error is returned and the caller is expected to
/// treat it as fatal.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(what, attempt, error = %e, "giving up after final attempt");
                        return Err(e);
                    }
                }
                warn!(what, attempt, error = %e, "connection attempt failed, retrying");
                time::sleep(policy.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn quick(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(quick(Some(3)), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(quick(Some(5)), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bounded_policy_gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry(quick(Some(3)), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("still down") }
        })
        .await;
        assert_eq!(result.unwrap_err(), "still down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unbounded_policy_keeps_trying() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(quick(None), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 20 {
                    Err("down")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 20);
    }
}
