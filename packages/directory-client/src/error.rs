use thiserror::Error;

/// Error taxonomy shared by both directory transports.
///
/// Callers branch on the variant, never on message text: `RateLimited`
/// opens the circuit breaker, `NotFound` is a terminal negative result,
/// everything else is retried.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("rate limited by the directory")]
    RateLimited,

    #[error("invite not found or expired")]
    NotFound,

    #[error("unexpected directory status {0}")]
    Status(u16),

    #[error("directory request failed: {0}")]
    Network(String),

    #[error("malformed directory response: {0}")]
    Parse(String),

    #[error("browser transport failed: {0}")]
    Browser(String),
}

impl DirectoryError {
    /// True for errors the envelope should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DirectoryError::Status(_)
                | DirectoryError::Network(_)
                | DirectoryError::Parse(_)
                | DirectoryError::Browser(_)
        )
    }
}
