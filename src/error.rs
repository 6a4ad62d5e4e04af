use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Query is empty")]
    EmptyQuery,

    #[error("Invalid regex: {0}")]
    InvalidRegex(String),

    #[error("Unreadable blob for {0}")]
    UnreadableBlob(String),

    #[error("Cache payload is corrupt: {0}")]
    CacheCorrupt(String),

    #[error("Task queue is full")]
    Overloaded,

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl Error {
    /// Stable machine-readable kind tag, independent of the display message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::EmptyQuery => "EmptyQuery",
            Error::InvalidRegex(_) => "InvalidRegex",
            Error::UnreadableBlob(_) => "UnreadableBlob",
            Error::CacheCorrupt(_) => "CacheCorrupt",
            Error::Overloaded => "Overloaded",
            Error::Cancelled => "Cancelled",
            Error::BackendUnavailable(_) => "BackendUnavailable",
            Error::Config(_) => "Config",
            Error::Io(_) => "Io",
            Error::Serde(_) => "Serde",
            Error::Internal(_) => "Internal",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::EmptyQuery => StatusCode::BAD_REQUEST,
            Error::InvalidRegex(_) => StatusCode::BAD_REQUEST,
            Error::UnreadableBlob(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::CacheCorrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Error::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Serde(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            Error::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = json!({
            "error": message,
            "kind": self.kind(),
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
