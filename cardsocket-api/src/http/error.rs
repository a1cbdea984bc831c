// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert relay errors to HTTP errors
impl From<cardsocket_cluster::Error> for AppError {
    fn from(err: cardsocket_cluster::Error) -> Self {
        use cardsocket_cluster::Error;

        match err {
            Error::Upgrade(msg) => Self::bad_request(msg),
            Error::QueueFull(_) | Error::QueueClosed => {
                Self::service_unavailable("Relay is not accepting messages")
            }
            Error::BrokerPublish(e) | Error::BrokerSubscribe(e) => {
                tracing::error!("Broker error: {}", e);
                Self::service_unavailable("Service temporarily unavailable")
            }
            other => {
                tracing::error!("Relay error: {}", other);
                Self::internal_server_error("Internal server error")
            }
        }
    }
}
