use error_types::{error_codes, AppError};
use thiserror::Error;

use crate::websocket::transport::TransportError;

pub type AppResult<T> = Result<T, AppError>;

/// Failures of the `TripStore` port.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The named entity (`trip`, `member`, `invitation`, `user`) does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(entity) => {
                let code = match entity {
                    "trip" => error_codes::TRIP_NOT_FOUND,
                    "member" => error_codes::MEMBER_NOT_FOUND,
                    "invitation" => error_codes::INVITATION_NOT_FOUND,
                    "user" => error_codes::USER_NOT_FOUND,
                    _ => error_codes::NOT_FOUND,
                };
                AppError::not_found(code, format!("{entity} not found"))
            }
            StoreError::Conflict(message) => AppError::conflict(message),
            StoreError::Database(message) => AppError::database(message),
        }
    }
}

/// Failures of a WebSocket session operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("client cannot keep up with message rate")]
    Backpressure,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Startup failures surfaced by `main`.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("server start failure: {0}")]
    StartServer(String),
}
