//! Retry policy and error classification for destination submissions
//!
//! Provides exponential backoff and the mapping from raw chain/agent error
//! text to retryable, permanent, or credential failures.

use std::time::Duration;

use crate::error::RelayError;

/// Submission retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
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
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Self::default()
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let backoff_secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before the next attempt, or None when the error is final
    pub fn next_delay(&self, attempt: u32, error: &RelayError) -> Option<Duration> {
        if error.is_retryable() && self.should_retry(attempt) {
            Some(self.backoff_for_attempt(attempt))
        } else {
            None
        }
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Transaction underpriced - retry, fillers re-estimate fees
    Underpriced,
    /// Nonce already used or tx already in the pool - an earlier attempt
    /// may have landed, never resend
    NonceTooLow,
    /// Nonce ahead of the chain - retry, the nonce is refilled per submission
    NonceTooHigh,
    /// Credential rejected - halt the executor
    Unauthorized,
    /// Permanent failure - do not retry (revert, invalid params)
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Credential errors win over everything else
    if error_lower.contains("unauthorized")
        || error_lower.contains("forbidden")
        || error_lower.contains("invalid key")
        || error_lower.contains("invalid private key")
        || error_lower.contains("caller is not")
        || error_lower.contains("not authorized")
    {
        return ErrorClass::Unauthorized;
    }

    // Transient errors
    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("internal server error")
        || error_lower.contains("gateway timeout")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("canister is stopping")
        || error_lower.contains("queue full")
    {
        return ErrorClass::Transient;
    }

    // Gas price errors
    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
    {
        return ErrorClass::Underpriced;
    }

    // Nonce errors
    if error_lower.contains("nonce too low")
        || error_lower.contains("already known")
        || error_lower.contains("already been processed")
    {
        return ErrorClass::NonceTooLow;
    }
    if error_lower.contains("nonce too high") {
        return ErrorClass::NonceTooHigh;
    }

    // Permanent errors
    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("rejected")
        || error_lower.contains("message not executed")
        || error_lower.contains("already executed")
        || error_lower.contains("trapped")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Turn raw submission error text into a classified `RelayError`
pub fn submission_error(error: &str) -> RelayError {
    match classify_error(error) {
        ErrorClass::Unauthorized => RelayError::Auth(error.to_string()),
        ErrorClass::Permanent => RelayError::permanent(error),
        ErrorClass::NonceTooLow => RelayError::in_doubt("pending transaction", error),
        ErrorClass::Transient
        | ErrorClass::Underpriced
        | ErrorClass::NonceTooHigh
        | ErrorClass::Unknown => RelayError::transient(error),
    }
}
