//! Typed exchange failures.
//!
//! The gateway never retries; callers decide from the error kind whether to
//! retry in place, skip the user, or defer to the next cycle.

/// Main error enum for exchange calls.
#[derive(thiserror::Error, Debug)]
pub enum ExchangeError {
    /// HTTP layer returned a non-2xx status.
    #[error("http status {status}")]
    Http { status: u16 },
    /// The exchange returned a business error code.
    #[error("exchange error {code}: {message}")]
    Api { code: String, message: String },
    /// The request deadline elapsed.
    #[error("request timed out")]
    Timeout,
    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
    /// Credentials are missing or were rejected outright.
    #[error("not authorized: {0}")]
    Unauthorized(String),
}

impl ExchangeError {
    /// Worth an in-place retry (reads only): timeouts, transport hiccups,
    /// rate limits, and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Timeout | ExchangeError::Transport(_) => true,
            ExchangeError::Http { status } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ExchangeError::Http {
                status: status.as_u16(),
            }
        } else {
            ExchangeError::Transport(err.to_string())
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ExchangeError::Timeout.is_transient());
        assert!(ExchangeError::Http { status: 503 }.is_transient());
        assert!(ExchangeError::Http { status: 429 }.is_transient());
        assert!(!ExchangeError::Http { status: 400 }.is_transient());
        assert!(!ExchangeError::Api {
            code: "40762".into(),
            message: "insufficient balance".into()
        }
        .is_transient());
    }
}
