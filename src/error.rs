use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error type shared by the repositories, the chat service and the HTTP layer.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(&'static str),

    /// Document store failure. `action` is the user-facing verb phrase, e.g. "send your message".
    #[error("storage error while trying to {action}: {source}")]
    Storage {
        action: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("session store error: {0}")]
    Session(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn storage(action: &'static str, err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage {
            action,
            source: Box::new(err),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Storage { .. }
            | Self::Session(_)
            | Self::Serialization(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to a visitor or operator.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound(_) | Self::BadRequest(_) | Self::Unauthorized(_) => self.to_string(),
            Self::Storage { action, .. } => format!("Failed to {action}. Please try again."),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage("reach the database", err)
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::storage("run database migrations", err)
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(err: bcrypt::BcryptError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_hide_details_from_callers() {
        let err = AppError::storage(
            "send your message",
            std::io::Error::new(std::io::ErrorKind::Other, "connection reset"),
        );
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            err.public_message(),
            "Failed to send your message. Please try again."
        );
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn client_errors_keep_their_text() {
        let err = AppError::NotFound("conversation");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.public_message(), "conversation not found");
    }
}
