use axum::response::IntoResponse;
use serde_json::json;

/// Canonical error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("No available accounts")]
    NoAccounts,
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("WAF challenge from {0}")]
    WafChallenge(String),
    #[error("Browser error: {0}")]
    Browser(String),
    #[error("All upstream sites failed: {0}")]
    Exhausted(String),
}

impl RelayError {
    /// HTTP status the proxy surface reports for this error.
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            RelayError::Auth(_) => http::StatusCode::UNAUTHORIZED,
            RelayError::NoAccounts => http::StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Config(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Upstream { .. }
            | RelayError::Transport(_)
            | RelayError::WafChallenge(_)
            | RelayError::Browser(_)
            | RelayError::Exhausted(_) => http::StatusCode::BAD_GATEWAY,
        }
    }
}

/// Proxy-surface errors are plain HTTP statuses with a `detail` body; the
/// admin surface wraps its results in `{status, message}` envelopes instead
/// (see `api::admin`).
impl IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = json!({ "detail": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RelayError::Auth("missing key".into()).status_code(),
            http::StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RelayError::NoAccounts.status_code(),
            http::StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::Exhausted("connect timeout".into()).status_code(),
            http::StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::Upstream {
                status: 500,
                message: "boom".into()
            }
            .status_code(),
            http::StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_display_carries_context() {
        let err = RelayError::Upstream {
            status: 503,
            message: "overloaded".into(),
        };
        let text = err.to_string();
        assert!(text.contains("503"));
        assert!(text.contains("overloaded"));
    }
}
