//! Retry-with-backoff around calls to unreliable external services.

use std::future::Future;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::Result;
use crate::domain::RetryPolicy;

/// Run `op` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// After the failed attempt `i` (0-indexed) the helper sleeps
/// `policy.delay_for_attempt(i)` before trying again. When every attempt
/// fails, the error of the last attempt is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    op_name: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = op_name,
                        attempts = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt + 1 >= max_attempts {
                    warn!(
                        operation = op_name,
                        attempts = max_attempts,
                        error = %err,
                        "Operation failed, retries exhausted"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = op_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
