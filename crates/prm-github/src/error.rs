//! Remote API error taxonomy.

use std::fmt;

use chrono::{DateTime, Utc};

/// Errors a remote call may produce. Callers map these onto the collected
/// discovery error taxonomy; this enum stays close to the wire.
#[derive(Debug, Clone)]
pub enum GithubError {
    /// 404 for the addressed resource.
    NotFound,
    /// 401, or 403 that is not a rate-limit rejection.
    Authentication { status: u16 },
    /// 429, or 403 with an exhausted rate-limit header.
    RateLimited {
        reset_at: Option<DateTime<Utc>>,
        remaining: Option<u32>,
    },
    /// Any other non-success status.
    Api { status: u16, message: String },
    /// Network or transport failure.
    Transport(String),
    /// A response payload could not be decoded.
    Decode(String),
}

impl fmt::Display for GithubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GithubError::NotFound => write!(f, "remote resource not found"),
            GithubError::Authentication { status } => {
                write!(f, "authentication rejected (status={status})")
            }
            GithubError::RateLimited { reset_at, remaining } => {
                write!(f, "rate limit exceeded")?;
                if let Some(r) = remaining {
                    write!(f, " remaining={r}")?;
                }
                if let Some(t) = reset_at {
                    write!(f, " reset_at={}", t.to_rfc3339())?;
                }
                Ok(())
            }
            GithubError::Api { status, message } => {
                write!(f, "remote api error status={status}: {message}")
            }
            GithubError::Transport(msg) => write!(f, "transport error: {msg}"),
            GithubError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for GithubError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(GithubError::NotFound.to_string(), "remote resource not found");
        assert_eq!(
            GithubError::Api {
                status: 500,
                message: "boom".into()
            }
            .to_string(),
            "remote api error status=500: boom"
        );
        let limited = GithubError::RateLimited {
            reset_at: None,
            remaining: Some(0),
        };
        assert_eq!(limited.to_string(), "rate limit exceeded remaining=0");
    }
}
