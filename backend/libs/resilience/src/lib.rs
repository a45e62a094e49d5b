//! Resilience primitives shared by the ingestion services
//!
//! - **Retry**: fixed or exponential backoff with jitter, bounded or unbounded,
//!   optionally cancelled through a `watch` shutdown flag
//! - **Timeout**: time limits on external calls, including an optional bound
//!   for calls that are allowed to wait indefinitely
//!
//! # Example: reconnect until shutdown
//!
//! ```rust,no_run
//! use resilience::{with_retry_until, RetryConfig};
//! use std::time::Duration;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     let config = RetryConfig::fixed(Duration::from_secs(2));
//!
//!     let result = with_retry_until(config, shutdown_rx, || async {
//!         // Your connection attempt here
//!         Ok::<_, String>(())
//!     }).await;
//! }
//! ```

pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use retry::{with_retry, with_retry_until, RetryConfig, RetryError};
pub use timeout::{with_optional_timeout, with_timeout, TimeoutError};
