// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Gateway error types
//!
//! Every error that can cross a crate boundary is a [`GatewayError`].
//! Variants map onto the HTTP statuses the surface returns:
//! - Validation -> 400 (with an optional JSON-pointer location)
//! - Auth -> 401
//! - NotFound -> 404
//! - Engine / Api / Network -> 502
//! - Internal -> 500
//!
//! Upload supersession is modelled as `Aborted` and is never surfaced to a
//! caller as a failure.

use thiserror::Error;

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Typed gateway error
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request or graph validation failure
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        /// JSON pointer to the offending input, when known
        location: Option<String>,
    },

    /// Authentication or authorization failure against a remote store (401/403)
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Resource does not exist
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Transport-level failure (connect, timeout, stream interruption)
    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Remote API answered with a non-success status
    #[error("api error ({status:?}): {message}")]
    Api { message: String, status: Option<u16> },

    /// The engine reported an execution failure or interrupt
    #[error("engine error: {message}")]
    Engine { message: String },

    /// An upload was superseded; silent by contract
    #[error("upload aborted")]
    Aborted,

    /// Anything else
    #[error("{message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Shorthand for a validation error without a location
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            location: None,
        }
    }

    /// Validation error pointing at a specific graph input
    pub fn validation_at(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            location: Some(location.into()),
        }
    }

    /// Shorthand for an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify a remote status + body into Auth / NotFound / Api
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Auth {
                message: format!("remote returned {status}: {body}"),
            },
            404 => Self::NotFound {
                message: body.to_string(),
            },
            _ => Self::Api {
                message: body.to_string(),
                status: Some(status),
            },
        }
    }

    /// HTTP status the surface should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Auth { .. } => 401,
            Self::NotFound { .. } => 404,
            Self::Network { .. } | Self::Api { .. } | Self::Engine { .. } => 502,
            Self::Aborted | Self::Internal { .. } => 500,
        }
    }

    /// True for 401/403-class failures, used by providers to distinguish
    /// credential problems from transient ones
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// JSON pointer carried by validation errors
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::Validation { location, .. } => location.as_deref(),
            _ => None,
        }
    }

    /// Clone the error, dropping any non-clonable source. Used where one
    /// failure fans out to several waiters (shared download futures).
    pub fn shallow_clone(&self) -> Self {
        match self {
            Self::Validation { message, location } => Self::Validation {
                message: message.clone(),
                location: location.clone(),
            },
            Self::Auth { message } => Self::Auth {
                message: message.clone(),
            },
            Self::NotFound { message } => Self::NotFound {
                message: message.clone(),
            },
            Self::Network { message, .. } => Self::Network {
                message: message.clone(),
                source: None,
            },
            Self::Api { message, status } => Self::Api {
                message: message.clone(),
                status: *status,
            },
            Self::Engine { message } => Self::Engine {
                message: message.clone(),
            },
            Self::Aborted => Self::Aborted,
            Self::Internal { message } => Self::Internal {
                message: message.clone(),
            },
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("io error: {err}"),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation {
            message: format!("invalid json: {err}"),
            location: None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), &err.to_string())
        } else {
            Self::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}
