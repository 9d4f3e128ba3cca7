use std::time::Duration;
use thiserror::Error;

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Failures reported by a model provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Connection refused, reset, DNS failure or a 5xx from the server
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The request did not finish within its bound
    #[error("Provider timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The server answered, but not with something we can use
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Map a transport error, using `bound` as the reported timeout.
    pub fn from_reqwest(err: reqwest::Error, bound: Duration) -> Self {
        if err.is_timeout() {
            return Self::Timeout(bound);
        }
        if err.is_decode() {
            return Self::InvalidResponse(err.to_string());
        }
        Self::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_reports_seconds() {
        let err = ProviderError::Timeout(Duration::from_secs(120));
        assert_eq!(err.to_string(), "Provider timed out after 120s");
        assert!(err.is_timeout());
        assert!(!ProviderError::unavailable("refused").is_timeout());
    }
}
