//! Reusable retry/backoff primitive (spec §9 design note).
//!
//! Only `SandboxError::Transient` failures are supposed to go through this
//! (spec §4.1); callers decide what counts as retryable by mapping their
//! error type before calling [`retry`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retries `op` up to `max_attempts` times with exponential backoff
/// (`base_delay * 2^attempt`) plus up to 25% jitter. Returns the last error
/// if every attempt fails.
pub async fn retry<F, Fut, T, E>(mut op: F, max_attempts: u32, base_delay: Duration) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(backoff_delay(base_delay, attempt)).await;
            }
        }
    }
}

fn backoff_delay(base_delay: Duration, attempt: u32) -> Duration {
    let exp = base_delay.saturating_mul(1u32 << attempt.min(16));
    let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.25);
    exp.mul_f64(1.0 + jitter_frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, &'static str> = retry(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
            3,
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let result: Result<u32, &'static str> =
            retry(|| async { Err("still broken") }, 3, Duration::from_millis(1)).await;

        assert_eq!(result, Err("still broken"));
    }
}
