//! Retry of whole units of work on store contention.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::KeyError;

const BASE_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 400;

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `attempts` is exhausted. Each attempt must be a complete transaction.
pub(crate) async fn retry_transient<T, F, Fut>(attempts: u32, op_name: &'static str, mut op: F) -> Result<T, KeyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KeyError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff(attempt);
                tracing::warn!(op = op_name, attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient store failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(6));
    let capped = exp.min(MAX_BACKOFF_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped / 2 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = retry_transient(5, "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(KeyError::from(sqlx::Error::PoolTimedOut))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = retry_transient(5, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(KeyError::AuthenticationFailed)
        })
        .await;
        assert!(matches!(out, Err(KeyError::AuthenticationFailed)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = retry_transient(3, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(KeyError::from(sqlx::Error::PoolTimedOut))
        })
        .await;
        assert!(out.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
