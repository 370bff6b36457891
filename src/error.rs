use std::time::Duration;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Pin not found: {0}")]
    NotFoundPin(String),
    #[error("{0} has been disposed")]
    Disposed(&'static str),
    #[error("Pin {0} is already open")]
    AlreadyOpen(String),
    #[error("Invalid direction: {0}")]
    InvalidDirection(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Change watcher unavailable: {0}")]
    WatcherUnavailable(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Export error: {0}")]
    Export(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO I/O error: {0}")]
    Io(String),
}

impl ResponseError for GpioError {
    fn status_code(&self) -> StatusCode {
        match self {
            GpioError::NotFoundPin(_) => StatusCode::NOT_FOUND,
            GpioError::AlreadyOpen(_) => StatusCode::CONFLICT,
            GpioError::InvalidDirection(_) | GpioError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            GpioError::Disposed(_) => StatusCode::GONE,
            GpioError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            GpioError::Cancelled | GpioError::WatcherUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GpioError::Export(_) | GpioError::Config(_) | GpioError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
