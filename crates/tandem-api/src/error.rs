use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tandem_core::protocol::ConflictBody;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// Stale write; answered with the server's copy
    #[error("Version conflict")]
    Conflict(Box<ConflictBody>),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl From<tandem_core::Error> for AppError {
    fn from(error: tandem_core::Error) -> Self {
        use tandem_core::Error;
        match error {
            Error::Validation(message)
            | Error::InvalidInput(message)
            | Error::UnknownEntity(message) => Self::BadRequest(message),
            Error::Serialization(error) => Self::BadRequest(error.to_string()),
            Error::NotFound(message) => Self::NotFound(message),
            Error::Auth(message) => Self::Unauthorized(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(body) => return (StatusCode::CONFLICT, Json(*body)).into_response(),
            Self::Internal(ref message) => {
                tracing::error!(error = %message, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_http_classes() {
        let cases = [
            (tandem_core::Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (tandem_core::Error::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (tandem_core::Error::Auth("nope".into()), StatusCode::UNAUTHORIZED),
            (tandem_core::Error::Server("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(AppError::from(error).into_response().status(), status);
        }
    }
}
