/// Retry policy with fixed or exponential backoff, optionally cancellable
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (`None` = retry forever)
    pub max_retries: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier (1.0 gives a fixed interval)
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Unbounded retry with a constant wait between attempts.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            max_retries: None,
            initial_backoff: interval,
            max_backoff: interval,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Bound the number of retries after the first attempt.
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn exhausted(&self, failed_attempts: u32) -> bool {
        matches!(self.max_retries, Some(max) if failed_attempts > max)
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        Duration::from_millis(
            ((current.as_millis() as f64 * self.backoff_multiplier)
                .min(self.max_backoff.as_millis() as f64)) as u64,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Gave up after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: E },
    #[error("Retry loop cancelled")]
    Cancelled,
}

/// Execute a future with retry logic
pub async fn with_retry<F, Fut, T, E>(config: RetryConfig, f: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_loop(config, None, f).await
}

/// Like [`with_retry`], but gives up with [`RetryError::Cancelled`] as soon as
/// `shutdown` carries `true`, including while waiting out a backoff.
pub async fn with_retry_until<F, Fut, T, E>(
    config: RetryConfig,
    mut shutdown: watch::Receiver<bool>,
    f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_loop(config, Some(&mut shutdown), f).await
}

async fn retry_loop<F, Fut, T, E>(
    config: RetryConfig,
    mut shutdown: Option<&mut watch::Receiver<bool>>,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        if let Some(rx) = shutdown.as_deref() {
            if *rx.borrow() {
                return Err(RetryError::Cancelled);
            }
        }

        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;

                if config.exhausted(attempt) {
                    warn!("Giving up after {} attempts: {}", attempt, e);
                    return Err(RetryError::MaxRetriesExceeded {
                        attempts: attempt,
                        last_error: e,
                    });
                }

                let delay = calculate_backoff(backoff, config.jitter);

                match config.max_retries {
                    Some(max) => warn!(
                        "Attempt {} failed ({}), retry {}/{} in {:?}",
                        attempt, e, attempt, max, delay
                    ),
                    None => warn!("Attempt {} failed ({}), retrying in {:?}", attempt, e, delay),
                }

                match shutdown.as_deref_mut() {
                    Some(rx) => {
                        if !sleep_unless_cancelled(delay, rx).await {
                            debug!("Shutdown observed during backoff");
                            return Err(RetryError::Cancelled);
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }

                backoff = config.next_backoff(backoff);
            }
        }
    }
}

/// Sleep for `delay`; returns `false` if the shutdown flag was raised first.
async fn sleep_unless_cancelled(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone: nobody can cancel any more.
                    (&mut sleep).await;
                    return true;
                }
                if *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

fn calculate_backoff(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3); // ±30%
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}
