//! Error types for Driftwood
//!
//! Federation failures are split by kind so callers can tell them apart:
//! - `ParseError`: malformed JSON, signature header or unsupported types
//! - `AuthError`: key resolution and signature verification outcomes
//! - `StateError`: relationship mutations the acting actor may not perform
//! - `SignError`: missing or unusable inputs for outbound signing
//!
//! Everything converts into `AppError`, which implements `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Decoding failures for inbound payloads and signature headers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// An embedded object carried no `id`
    #[error("Embedded object is missing an id")]
    MissingId,

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),
}

/// Authentication failures raised by the inbound verifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The keyId could not be resolved to a public key
    #[error("Unknown actor: {0}")]
    UnknownActor(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Digest mismatch")]
    DigestMismatch,

    /// Date header missing, unparseable or outside the accepted window
    #[error("Date header outside accepted window")]
    BadTimeWindow,

    /// The signing key belongs to a different actor than the activity
    #[error("Signature keyId {key_id} does not belong to actor {actor_id}")]
    KeyActorMismatch { key_id: String, actor_id: String },
}

/// Relationship state errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Actor is not authorized to perform this transition")]
    NotAuthorized,
}

/// Outbound signing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignError {
    #[error("Missing private key")]
    MissingPrivateKey,

    #[error("Missing user agent")]
    MissingUserAgent,

    #[error("Missing host")]
    MissingHost,

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
}

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request carries no credentials (401)
    #[error("Missing Signature header")]
    Unauthorized,

    /// Payload could not be decoded (400)
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Authentication failed (401)
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Relationship transition not permitted (403)
    #[error(transparent)]
    State(#[from] StateError),

    /// Outbound signing failed (500)
    #[error(transparent)]
    Sign(#[from] SignError),

    /// Inbox queue partition is full (503)
    #[error("Inbox queue is full")]
    QueueFull,

    /// Inbox queue has shut down (503)
    #[error("Inbox queue is closed")]
    QueueClosed,

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Short label used for logs and the error counter
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Unauthorized => "unauthorized",
            AppError::Parse(ParseError::MalformedSignature(_)) => "malformed_signature",
            AppError::Parse(ParseError::UnsupportedType(_)) => "unsupported_type",
            AppError::Parse(_) => "parse",
            AppError::Auth(AuthError::UnknownActor(_)) => "unknown_actor",
            AppError::Auth(AuthError::InvalidSignature) => "invalid_signature",
            AppError::Auth(AuthError::DigestMismatch) => "digest_mismatch",
            AppError::Auth(AuthError::BadTimeWindow) => "bad_time_window",
            AppError::Auth(AuthError::KeyActorMismatch { .. }) => "key_actor_mismatch",
            AppError::State(StateError::NotAuthorized) => "not_authorized",
            AppError::Sign(_) => "sign",
            AppError::QueueFull => "queue_full",
            AppError::QueueClosed => "queue_closed",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::Federation(_) => "federation",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::Parse(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized | AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::State(_) => StatusCode::FORBIDDEN,
            AppError::QueueFull | AppError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            AppError::HttpClient(_) | AppError::Federation(_) => StatusCode::BAD_GATEWAY,
            AppError::Sign(_)
            | AppError::Database(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal details stay in the logs
        let error_message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
