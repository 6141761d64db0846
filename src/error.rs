//! Error types for the rate limiter.

use thiserror::Error;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// Invalid rule list or combination logic. Raised at construction time only.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The bucket store could not complete an atomic consume within its retry budget.
    ///
    /// This is never a rate limit decision; callers must not treat it as "allowed"
    /// or "denied".
    #[error("Bucket store unavailable for {key} after {attempts} attempt(s): {reason}")]
    StoreUnavailable {
        /// The bucket the operation targeted
        key: String,
        /// How many attempts were made before giving up
        attempts: u32,
        /// The last failure observed
        reason: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimiterError {
    /// Whether this error means the limiter failed to decide, as opposed to
    /// being unusable from the start.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, RateLimiterError::StoreUnavailable { .. })
    }
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimiterError>;
