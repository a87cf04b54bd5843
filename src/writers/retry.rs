//! Retry and error classification for store writes and broadcasts
//!
//! Store writes get a bounded exponential backoff; exhausting it returns the
//! last error so callers surface it instead of looping forever.

use eyre::{eyre, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues, lock contention)
    Transient,
    /// The chain already has this transaction
    AlreadyKnown,
    /// Permanent failure - do not retry
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("deadlock")
        || error_lower.contains("pool timed out")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("already known")
        || error_lower.contains("already in block chain")
        || error_lower.contains("txn-already-known")
        || error_lower.contains("already been processed")
    {
        return ErrorClass::AlreadyKnown;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("missing inputs")
        || error_lower.contains("bad-txns")
        || error_lower.contains("out of gas")
        || error_lower.contains("violates")
        || error_lower.contains("disk full")
        || error_lower.contains("no space left")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Execute `operation` with bounded exponential backoff.
///
/// Permanent errors return immediately; transient and unknown ones are
/// retried up to `config.max_retries` times.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let error_str = format!("{:#}", e);
                match classify_error(&error_str) {
                    ErrorClass::Permanent | ErrorClass::AlreadyKnown => {
                        warn!(operation = what, error = %error_str, "Permanent error, not retrying");
                        return Err(e);
                    }
                    ErrorClass::Transient | ErrorClass::Unknown => {
                        if !config.should_retry(attempt) {
                            warn!(
                                operation = what,
                                attempts = attempt + 1,
                                error = %error_str,
                                "Retries exhausted"
                            );
                            return Err(eyre!("{} failed after {} attempts: {}", what, attempt + 1, error_str));
                        }
                        let backoff = config.backoff_for_attempt(attempt);
                        debug!(operation = what, attempt, ?backoff, error = %error_str, "Retrying after backoff");
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                }
            }
        }
    }
}
