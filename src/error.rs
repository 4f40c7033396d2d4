//! Error taxonomy for the client engine.
//!
//! # Categories
//! - Configuration errors: malformed option arguments, detected eagerly
//!   before any network activity, never retried
//! - Timeout errors: a socket operation exceeded its budget; tagged with
//!   the operation so callers can tell a slow connect from a slow read
//! - Transport/protocol errors: resets, malformed framing, TLS failures
//! - Redirect errors: the hop limit was exceeded
//!
//! Proxy 407 challenges and 3xx redirects are *not* errors; they surface
//! as ordinary `Response` values the caller can branch on.

use thiserror::Error;

/// The socket operation a timeout budget applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOp {
    Connect,
    Read,
    Write,
}

impl std::fmt::Display for TimeoutOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutOp::Connect => write!(f, "connect"),
            TimeoutOp::Read => write!(f, "read"),
            TimeoutOp::Write => write!(f, "write"),
        }
    }
}

/// Errors that can occur while configuring a client or performing a request.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or incomplete option arguments (missing proxy port,
    /// unknown timeout policy name, incomplete basic-auth credentials).
    /// Raised synchronously, before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A socket operation exceeded its timeout budget.
    #[error("{op} operation timed out")]
    Timeout { op: TimeoutOp },

    /// Transport-level failure (connection reset, refused, early close).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that do not parse as HTTP/1.1.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS handshake or certificate failure.
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// Redirect following exceeded the configured hop limit.
    #[error("too many redirects (limit {limit})")]
    TooManyRedirects { limit: usize },

    /// The request target is not a parseable URL.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// True when this error category is a timeout expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// True when this error was raised before any network activity.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

/// Result type for all client operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_tagged_with_operation() {
        let err = Error::Timeout {
            op: TimeoutOp::Read,
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "read operation timed out");
    }

    #[test]
    fn timeout_distinct_from_reset() {
        let reset = Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(!reset.is_timeout());
    }
}
