//! DriveSnap Graph - Microsoft Graph adapter
//!
//! Provides the port implementations the backup engine consumes:
//! - Drive listing and root folder lookup
//! - Paged delta enumeration with reset detection
//! - Item records, permissions, and raw content downloads
//!
//! ## Modules
//!
//! - [`client`] - Authenticated HTTP client for Graph endpoints
//! - [`delta`] - Delta DTOs, item conversion, and the delta pager
//! - [`provider`] - `DriveSource` / `ItemStore` implementations

pub mod client;
pub mod delta;
pub mod provider;

use drivesnap_core::domain::StoreError;
use thiserror::Error;

/// Errors that can occur when communicating with the Microsoft Graph API
#[derive(Debug, Error)]
pub enum GraphError {
    /// Authentication credentials are invalid or expired
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Insufficient permissions for the requested operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The delta token is no longer valid (HTTP 410)
    #[error("Delta token expired: {0}")]
    Gone(String),

    /// The service is temporarily unavailable (HTTP 503)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Any other non-success status
    #[error("Request failed with status {status}: {message}")]
    Status {
        /// The HTTP status code
        status: u16,
        /// Response excerpt or reason
        message: String,
    },

    /// A network-level error occurred
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The API response could not be parsed or was malformed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl GraphError {
    /// Maps a non-success HTTP status onto the matching variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            410 => Self::Gone(message),
            503 => Self::ServiceUnavailable(message),
            _ => Self::Status { status, message },
        }
    }
}

impl From<GraphError> for StoreError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Unauthorized(m) => StoreError::Unauthorized(m),
            GraphError::NotFound(m) => StoreError::NotFound(m),
            GraphError::ServiceUnavailable(m) => StoreError::ServiceUnavailable(m),
            GraphError::Forbidden(m) => StoreError::Status {
                status: 403,
                message: m,
            },
            GraphError::Gone(m) => StoreError::Status {
                status: 410,
                message: m,
            },
            GraphError::Status { status, message } => StoreError::Status { status, message },
            GraphError::NetworkError(e) => StoreError::Transport(e.to_string()),
            GraphError::InvalidResponse(m) => StoreError::Transport(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(matches!(GraphError::from_status(401, "x"), GraphError::Unauthorized(_)));
        assert!(matches!(GraphError::from_status(410, "x"), GraphError::Gone(_)));
        assert!(matches!(
            GraphError::from_status(500, "x"),
            GraphError::Status { status: 500, .. }
        ));
    }

    #[test]
    fn test_store_error_mapping() {
        let err: StoreError = GraphError::ServiceUnavailable("busy".to_string()).into();
        assert_eq!(err, StoreError::ServiceUnavailable("busy".to_string()));

        let err: StoreError = GraphError::InvalidResponse("bad json".to_string()).into();
        assert!(matches!(err, StoreError::Transport(_)));
    }
}
