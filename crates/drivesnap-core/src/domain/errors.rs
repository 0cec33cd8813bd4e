//! Domain error types
//!
//! This module defines error types specific to domain operations
//! (validation failures, malformed paths) and the classification used for
//! failures reported by the backing item store.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A path element was empty
    #[error("Empty path element in: {0}")]
    EmptyPathElement(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Classified failure returned by an item store
///
/// The collection fetch cascade and the skip classification match on these
/// variants, so adapters must map their transport errors onto them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The download URL or credentials expired
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The requested item does not exist (anymore)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The service flagged the item as malware
    #[error("Malware detected: {0}")]
    Malware(String),

    /// The service was unavailable (HTTP 503)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The item was deleted while the backup was running
    #[error("Item deleted in flight: {0}")]
    DeletedInFlight(String),

    /// Any other non-success status
    #[error("Request failed with status {status}: {message}")]
    Status {
        /// The HTTP status code
        status: u16,
        /// Response excerpt or reason
        message: String,
    },

    /// The item record carried no download URL
    #[error("Missing download URL for item: {0}")]
    MissingDownloadUrl(String),

    /// A network-level or decoding error
    #[error("Transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Maps a non-success HTTP status onto the matching variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Unauthorized(message),
            404 => Self::NotFound(message),
            503 => Self::ServiceUnavailable(message),
            _ => Self::Status { status, message },
        }
    }

    /// True for an expired download URL or bad token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// True when the item is gone, whether reported as 404 or deleted in flight.
    pub fn is_not_found_or_deleted(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::DeletedInFlight(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidPath("a//b".to_string());
        assert_eq!(err.to_string(), "Invalid path: a//b");

        let err = StoreError::Status {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Request failed with status 500: boom");
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidId("x".to_string());
        let err2 = DomainError::InvalidId("x".to_string());
        let err3 = DomainError::InvalidId("y".to_string());

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }

    #[test]
    fn test_error_clone() {
        let err = StoreError::Malware("virus".to_string());
        let cloned = err.clone();
        assert_eq!(err, cloned);
    }

    #[test]
    fn test_store_error_from_status() {
        assert!(StoreError::from_status(401, "expired").is_unauthorized());
        assert!(StoreError::from_status(404, "gone").is_not_found_or_deleted());
        assert_eq!(
            StoreError::from_status(503, "busy"),
            StoreError::ServiceUnavailable("busy".to_string())
        );
        assert_eq!(
            StoreError::from_status(418, "teapot"),
            StoreError::Status {
                status: 418,
                message: "teapot".to_string()
            }
        );
    }

    #[test]
    fn test_deleted_in_flight_counts_as_gone() {
        let err = StoreError::DeletedInFlight("item-1".to_string());
        assert!(err.is_not_found_or_deleted());
        assert!(!err.is_unauthorized());
    }
}
