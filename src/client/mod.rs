//! Caller side of the execution boundary (and of any HTTP dependency).
//!
//! Failures are classified once, here, into transient (connect error,
//! timeout, 5xx) and permanent (everything else). The retry strategy only
//! ever looks at `ClientError::is_retriable`.

pub mod retry;
pub mod runner;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

pub use retry::RetryPolicy;
pub use runner::RunnerClient;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("server error {status}: {body}")]
    Server { status: StatusCode, body: String },

    /// 4xx from the callee. `code` is the machine-readable code when the
    /// body carried one (e.g. `invalid_input`).
    #[error("request rejected ({status}): {message}")]
    Rejected {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("request could not be built: {0}")]
    Request(String),
}

/// Error body produced by the execution boundary.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: Option<String>,
}

impl ClientError {
    /// Transient failures: connection errors, timeouts and 5xx.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Timeout(_) | Self::Server { .. }
        )
    }

    /// The dependency could not be reached or kept failing; distinct from
    /// the callee rejecting the request.
    pub fn is_dependency_unavailable(&self) -> bool {
        self.is_retriable()
    }

    /// Machine-readable code of a rejection, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Classifies a non-success HTTP status and its body.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        if status.is_server_error() {
            return Self::Server { status, body };
        }
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => Self::Rejected {
                status,
                code: parsed.code,
                message: parsed.error,
            },
            Err(_) => Self::Rejected {
                status,
                code: None,
                message: body,
            },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e)
        } else if e.is_connect() || e.is_request() {
            Self::Connect(e)
        } else if e.is_decode() || e.is_body() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status, e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retriable() {
        for status in [500, 502, 503, 504] {
            let err = ClientError::from_status(StatusCode::from_u16(status).unwrap(), String::new());
            assert!(err.is_retriable(), "{status}");
            assert!(err.is_dependency_unavailable());
        }
    }

    #[test]
    fn test_client_errors_are_permanent() {
        for status in [400, 401, 404, 409, 422] {
            let err = ClientError::from_status(StatusCode::from_u16(status).unwrap(), String::new());
            assert!(!err.is_retriable(), "{status}");
        }
    }

    #[test]
    fn test_rejection_body_is_parsed() {
        let err = ClientError::from_status(
            StatusCode::BAD_REQUEST,
            r#"{"error": "command executable not in allowlist", "code": "invalid_input"}"#.into(),
        );
        assert_eq!(err.code(), Some("invalid_input"));
        assert_eq!(
            err.to_string(),
            "request rejected (400 Bad Request): command executable not in allowlist"
        );
    }

    #[test]
    fn test_rejection_with_plain_body() {
        let err = ClientError::from_status(StatusCode::NOT_FOUND, "nope".into());
        assert_eq!(err.code(), None);
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_decode_and_request_errors_are_permanent() {
        assert!(!ClientError::Decode("bad json".into()).is_retriable());
        assert!(!ClientError::Request("bad url".into()).is_retriable());
    }
}
