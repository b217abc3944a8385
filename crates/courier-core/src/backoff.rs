use crate::error::{CoreError, TransportError};
use crate::policy::RetryPolicy;
use log::warn;
use std::future::Future;
use tokio::time::{sleep, timeout};

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// policy's retries are spent. Each attempt gets the policy's timeout.
pub async fn retry_with_backoff<T, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, CoreError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
    P: Fn(&CoreError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        let result = match policy.attempt_timeout() {
            Some(limit) => match timeout(limit, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Transport(TransportError::Timeout)),
            },
            None => op(attempt).await,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= policy.retries || !should_retry(&err) {
            return Err(err);
        }
        attempt += 1;
        let delay = policy.delay_for(attempt);
        warn!(
            "{} failed ({}), retry {}/{} in {:?}",
            label, err, attempt, policy.retries, delay
        );
        sleep(delay).await;
    }
}

/// Transient transport failures only; 406 and cancellations never qualify.
pub fn is_retryable(err: &CoreError) -> bool {
    err.is_transient()
}
