//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for identifiers that cross crate boundaries.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// DriveId
// ============================================================================

/// Opaque identifier of a remote drive, unique within a tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DriveId(String);

impl DriveId {
    /// Create a new DriveId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains a path separator
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidId(
                "Drive ID cannot be empty".to_string(),
            ));
        }

        if id.contains('/') {
            return Err(DomainError::InvalidId(format!(
                "Drive ID contains a path separator: {id}"
            )));
        }

        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DriveId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DriveId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for DriveId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DriveId> for String {
    fn from(id: DriveId) -> Self {
        id.0
    }
}

impl AsRef<str> for DriveId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_id_valid() {
        let id = DriveId::new("b!abc-123_XYZ".to_string()).unwrap();
        assert_eq!(id.as_str(), "b!abc-123_XYZ");
        assert_eq!(id.to_string(), "b!abc-123_XYZ");
    }

    #[test]
    fn test_drive_id_empty() {
        assert!(DriveId::new(String::new()).is_err());
    }

    #[test]
    fn test_drive_id_rejects_separator() {
        assert!(DriveId::new("a/b".to_string()).is_err());
    }

    #[test]
    fn test_drive_id_from_str() {
        let id: DriveId = "drive-1".parse().unwrap();
        assert_eq!(String::from(id), "drive-1");
    }

    #[test]
    fn test_drive_id_serde_roundtrip() {
        let id = DriveId::new("drive-1".to_string()).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"drive-1\"");

        let back: DriveId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let bad: Result<DriveId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }
}
