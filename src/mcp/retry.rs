//! Retry Logic and Error Resilience
//!
//! This module provides retry with exponential backoff and jitter for
//! establishing MCP connections.
//!
//! # Features
//!
//! - **Exponential Backoff**: Retry delay grows exponentially with each attempt
//! - **Jitter**: Random delay variation to prevent thundering herd
//! - **Configurable**: Max attempts, base delay, max delay, jitter factor
//! - **Smart Retry**: Only retry on transient transport errors
//!
//! Retry applies to connection establishment only. Tool invocations are never
//! replayed.
//!
//! # Example
//!
//! ```ignore
//! use toolwire::mcp::retry::RetryConfig;
//!
//! let config = RetryConfig::default()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(5));
//! ```

use std::time::Duration;
use tokio::time::sleep;

use super::error::{McpClientError, McpResult};

/// Backoff policy for connection establishment
///
/// Defaults: 3 attempts, 100ms base delay, 5s ceiling, 10% jitter. The same
/// values are exposed per server in the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (including initial attempt)
    pub max_attempts: usize,

    /// Base delay before first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Random variation factor, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of retry attempts
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base delay between retries
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay between retries
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor, clamped to 0.0..=1.0
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given retry attempt
    ///
    /// Uses exponential backoff: delay = base_delay * 2^attempt
    /// Then applies jitter and caps at max_delay.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponential_delay = u32::try_from(attempt)
            .ok()
            .and_then(|exp| 2_u32.checked_pow(exp))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);

        // Apply jitter: add up to `jitter` of the delay
        let jitter_range = exponential_delay.mul_f64(self.jitter);
        let jitter_offset = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range.as_secs_f64();
        let jittered_delay =
            exponential_delay.saturating_add(Duration::from_secs_f64(jitter_offset.abs()));

        // Cap at max delay
        jittered_delay.min(self.max_delay)
    }
}

/// Retry connection establishment with exponential backoff
///
/// Runs `operation` up to `max_attempts` times (at least once). Only
/// transient errors (see [`McpClientError::is_transient`]) are retried; any
/// other error is returned immediately. Exhausting every attempt yields
/// `ServerUnavailable`.
///
/// # Arguments
///
/// * `config` - Retry configuration
/// * `server` - Server name, for errors and logs
/// * `operation` - Async operation, given the zero-based attempt number
///
/// # Example
///
/// ```ignore
/// let session = retry_with_backoff(&config, "files", |attempt| async move {
///     open_session(attempt).await
/// }).await?;
/// ```
pub async fn retry_with_backoff<F, T, Fut>(
    config: &RetryConfig,
    server: &str,
    mut operation: F,
) -> McpResult<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = McpResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(
                        server,
                        "Connected on attempt {} after {} retries",
                        attempt + 1,
                        attempt
                    );
                }
                return Ok(result);
            }
            Err(e) if !e.is_transient() => {
                tracing::error!(server, "Attempt {} failed permanently: {}", attempt + 1, e);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(server, "Attempt {}/{} failed: {}", attempt + 1, max_attempts, e);
                last_error = Some(e);

                if attempt + 1 < max_attempts {
                    let delay = config.calculate_delay(attempt);
                    tracing::debug!(server, "Waiting {:?} before retry", delay);
                    sleep(delay).await;
                }
            }
        }
    }

    Err(McpClientError::ServerUnavailable {
        server: server.to_string(),
        attempts: max_attempts,
        last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// Check if an HTTP status code should be retried
///
/// Retryable status codes:
/// - 408 Request Timeout
/// - 429 Too Many Requests
/// - 5xx Server Error (except 501 Not Implemented, 505 HTTP Version Not Supported)
///
/// Non-retryable status codes:
/// - 4xx Client Errors (except 408, 429)
/// - 501 Not Implemented
/// - 505 HTTP Version Not Supported
pub fn should_retry_status(status: u16) -> bool {
    match status {
        // 408 Request Timeout - retry
        408 => true,
        // 429 Too Many Requests - retry (rate limit)
        429 => true,
        // 5xx server errors - retry with exceptions
        500..=599 => {
            // Don't retry 501 Not Implemented or 505 HTTP Version Not Supported
            status != 501 && status != 505
        }
        // All other status codes - don't retry
        _ => false,
    }
}
