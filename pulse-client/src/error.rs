use http::StatusCode;

/// Upstream call failure, classified for the poll engine's retry and
/// health decisions.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// Timeout, connection failure, DNS, or a 5xx answer. Retryable.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// 401/403. Reported, never retried; credentials stay out of the
    /// message.
    #[error("upstream rejected credentials: {0}")]
    Auth(String),

    /// 404. Reported, not retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Body did not have the expected structure.
    #[error("unable to parse upstream response: {0}")]
    Parse(String),

    /// Any other 4xx.
    #[error("upstream error: {0}")]
    Permanent(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth(_))
    }

    /// Classify a non-success HTTP status. The body text is included for
    /// everything except auth failures.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = || {
            let text = body.trim();
            if text.is_empty() {
                status.to_string()
            } else {
                format!("{} - {}", status, text)
            }
        };
        if status.is_server_error() {
            ApiError::Transient(message())
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ApiError::Auth(status.to_string())
        } else if status == StatusCode::NOT_FOUND {
            ApiError::NotFound(message())
        } else {
            ApiError::Permanent(message())
        }
    }
}

impl From<hyper::Error> for ApiError {
    fn from(err: hyper::Error) -> Self {
        ApiError::Transient(err.to_string())
    }
}

impl From<http::Error> for ApiError {
    fn from(err: http::Error) -> Self {
        ApiError::Permanent(err.to_string())
    }
}
