use http::StatusCode;
use serde_json::json;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// Transient failure, the caller may retry
    #[error("Network error: {0}")]
    Network(String),

    /// The post or comment no longer exists
    #[error("Not found")]
    NotFound,

    #[error("Session expired")]
    Auth,

    /// Rejected before or by the server because of the request contents
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Auth => StatusCode::UNAUTHORIZED,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Error::Network(_) => "unavailable",
            Error::NotFound => "not-found",
            Error::Auth => "unauthorized",
            Error::Validation(_) => "validation",
            Error::PermissionDenied => "permission-denied",
            Error::Unknown(_) => "unknown",
        }
    }

    /// Serializes this error as a failed response envelope
    pub fn contents(&self) -> Vec<u8> {
        let message = match self {
            Error::Network(msg) | Error::Validation(msg) | Error::Unknown(msg) => msg.clone(),
            _ => self.to_string(),
        };
        serde_json::to_vec(&json!({
            "success": false,
            "message": message,
            "data": null,
            "errors": [message],
            "statusCode": self.status_code().as_u16(),
            "errorCode": self.error_code(),
        }))
        .expect("serializing error envelope")
    }

    /// Maps a non-success HTTP response onto the error taxonomy
    ///
    /// The status decides the variant, the envelope (if it parses) only
    /// provides the message.
    pub fn from_response(status: StatusCode, body: &[u8]) -> Error {
        let message = envelope_message(body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("no message")
                .to_string()
        });
        match status {
            StatusCode::UNAUTHORIZED => Error::Auth,
            StatusCode::FORBIDDEN => Error::PermissionDenied,
            StatusCode::NOT_FOUND | StatusCode::GONE => Error::NotFound,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Error::Validation(message)
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Error::Network(message),
            s if s.is_server_error() => Error::Network(message),
            s => Error::Unknown(format!("unexpected status {}: {}", s.as_u16(), message)),
        }
    }
}

fn envelope_message(body: &[u8]) -> Option<String> {
    let data: serde_json::Value = serde_json::from_slice(body).ok()?;
    if let Some(msg) = data.get("message").and_then(|m| m.as_str()) {
        if !msg.is_empty() {
            return Some(msg.to_string());
        }
    }
    let errors = data.get("errors")?.as_array()?;
    let joined = errors
        .iter()
        .filter_map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    (!joined.is_empty()).then_some(joined)
}
