// ===============================
// src/error.rs
// ===============================
use std::time::Duration;

use thiserror::Error;

use crate::domain::{Direction, UnbalancedReport};

/// How the retry policy treats a failed venue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Authentication,
    RateLimited,
    Server,
    Network,
    Fatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Authentication => "auth",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Server => "server",
            FailureClass::Network => "network",
            FailureClass::Fatal => "fatal",
        }
    }
}

/// Errors from a single venue REST call.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("authentication failed ({status}): {body}")]
    Authentication { status: u16, body: String },
    #[error("rate limited ({status}): {body}")]
    RateLimited { status: u16, body: String },
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("network failure: {0}")]
    Network(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Maps a non-success HTTP status onto the error taxonomy.
    pub fn from_status(status: u16, body: String) -> ApiError {
        match status {
            401 | 403 => ApiError::Authentication { status, body },
            // 418 is the maker venue's "banned after ignoring 429" status
            429 | 418 => ApiError::RateLimited { status, body },
            500..=599 => ApiError::Server { status, body },
            _ => ApiError::Rejected { status, body },
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ApiError::Authentication { .. } => FailureClass::Authentication,
            ApiError::RateLimited { .. } => FailureClass::RateLimited,
            ApiError::Server { .. } => FailureClass::Server,
            ApiError::Network(_) => FailureClass::Network,
            ApiError::Rejected { .. } | ApiError::Validation(_) | ApiError::Decode(_) => {
                FailureClass::Fatal
            }
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::from_status(status.as_u16(), e.to_string())
        } else {
            // timeouts, connect errors, resets
            ApiError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self { ApiError::Decode(e.to_string()) }
}

/// Errors from an order command (one leg).
#[derive(Debug, Clone, Error)]
pub enum OrderError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("leg timed out after {0:?}")]
    Timeout(Duration),
    #[error("no taker quote available to execute against")]
    MissingQuote,
}

/// Failures the supervisor must observe from a tick or fill.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("UNBALANCED {} position: {} leg {} filled, {} leg failed: {}",
        .0.direction.as_str(), .0.filled_venue.as_str(), .0.filled_order_id,
        .0.failed_venue.as_str(), .0.failure)]
    Unbalanced(UnbalancedReport),
    #[error("{direction:?} placement failed ({action}): {reason}")]
    Placement { direction: Direction, action: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("{name} out of range: {value}")]
    OutOfRange { name: &'static str, value: String },
    #[error("{0} is required for the selected mode")]
    Missing(&'static str),
}
