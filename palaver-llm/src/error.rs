//! Generation and synthesis error types.

use thiserror::Error;

/// Errors that can occur talking to a dialogue or speech backend.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed before a response arrived.
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    /// Backend answered with a non-success status.
    #[error("backend returned HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
    },

    /// Response body could not be interpreted.
    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    /// Request timed out.
    #[error("LLM request timed out after {0}ms")]
    Timeout(u64),

    /// Provider is unavailable or not configured.
    #[error("LLM provider unavailable: {0}")]
    Unavailable(String),

    /// All retry attempts exhausted.
    #[error("All LLM retry attempts exhausted after {attempts} tries: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: String,
    },

    /// Configuration error.
    #[error("LLM configuration error: {0}")]
    ConfigError(String),

    /// The speech service rejected the API key.
    #[error("speech service rejected the API key")]
    Unauthorized,

    /// Speech synthesis was switched off for this session.
    #[error("speech synthesis is disabled")]
    SynthesisDisabled,
}

impl LlmError {
    /// Whether the failure is worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(_) | Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(0)
        } else if err.is_connect() {
            LlmError::Unavailable(err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LlmError::Timeout(100).is_transient());
        assert!(LlmError::Http { status: 503, body: String::new() }.is_transient());
        assert!(LlmError::Http { status: 429, body: String::new() }.is_transient());
        assert!(!LlmError::Http { status: 400, body: String::new() }.is_transient());
        assert!(!LlmError::Unauthorized.is_transient());
        assert!(!LlmError::ParseError("x".into()).is_transient());
    }
}
