/// Timeout wrappers for async operations
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
}

/// Execute a future with timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed(duration))
}

/// Execute a future with an optional bound; `None` waits for as long as it takes.
pub async fn with_optional_timeout<F, T>(
    duration: Option<Duration>,
    future: F,
) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    match duration {
        Some(limit) => with_timeout(limit, future).await,
        None => Ok(future.await),
    }
}
