//! Oracle error types with retry classification.
//!
//! Distinguishes between transient errors (worth one more attempt) and
//! permanent errors (fail the run immediately).

use std::time::Duration;

/// Error from oracle calls.
#[derive(Debug, Clone)]
pub struct OracleError {
    /// The kind of error
    pub kind: OracleErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
}

impl OracleError {
    /// Create a rate limit error.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: OracleErrorKind::RateLimited,
            status_code: Some(429),
            message: message.into(),
        }
    }

    /// Create a server error.
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: OracleErrorKind::ServerError,
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    /// Create a client error (bad request, auth, malformed history, etc.).
    pub fn client_error(message: impl Into<String>) -> Self {
        Self {
            kind: OracleErrorKind::ClientError,
            status_code: Some(400),
            message: message.into(),
        }
    }

    /// Create a network error.
    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            kind: OracleErrorKind::NetworkError,
            status_code: None,
            message: message.into(),
        }
    }

    /// Create a parse error (malformed stream payload).
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            kind: OracleErrorKind::ParseError,
            status_code: None,
            message: message.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: OracleErrorKind::Cancelled,
            status_code: None,
            message: message.into(),
        }
    }

    /// Whether retrying this call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl std::fmt::Display for OracleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{:?} ({}): {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for OracleError {}

/// Classification of oracle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleErrorKind {
    /// 429 - back off and retry
    RateLimited,
    /// 5xx - upstream fault, retry once
    ServerError,
    /// 4xx - request is wrong, do not retry
    ClientError,
    /// Connection-level failure, retry once
    NetworkError,
    /// Response could not be decoded
    ParseError,
    /// Call was cancelled cooperatively
    Cancelled,
}

impl OracleErrorKind {
    /// Whether this kind of error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleErrorKind::RateLimited
                | OracleErrorKind::ServerError
                | OracleErrorKind::NetworkError
        )
    }
}

/// Retry policy for transient oracle failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial call.
    pub max_retries: u32,
    /// Delay before each retry.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
        }
    }
}
