//! Item store port (driven/secondary port)
//!
//! Gives the collection streamer access to item records, permissions, and
//! raw content. Unlike the delta port, failures are classified with
//! [`StoreError`] because the fetch cascade branches on them.

use std::collections::HashMap;

use crate::domain::drive_item::DriveItem;
use crate::domain::errors::StoreError;
use crate::domain::newtypes::DriveId;
use crate::domain::permissions::RemotePermission;

/// Header set by the service on responses for infected files
const VIRUS_HEADER: &str = "x-virus-infected";

/// Error code in the body of malware responses
const MALWARE_CODE: &str = "malwareDetected";

/// A raw HTTP response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Classifies a content download response.
///
/// # Errors
/// Returns [`StoreError::Malware`] for infected-file responses, otherwise the
/// status-based classification of [`StoreError::from_status`]
pub fn classify_download(url: &str, response: RawResponse) -> Result<Vec<u8>, StoreError> {
    if response.is_success() {
        return Ok(response.body);
    }

    let infected = response
        .headers
        .get(VIRUS_HEADER)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let body = String::from_utf8_lossy(&response.body);

    if infected || body.contains(MALWARE_CODE) {
        return Err(StoreError::Malware(url.to_string()));
    }

    Err(StoreError::from_status(response.status, url))
}

/// Backing store holding item records and content
#[async_trait::async_trait]
pub trait ItemStore: Send + Sync {
    /// Fetches the current record of an item (with a fresh download URL)
    async fn get_item(&self, drive_id: &DriveId, item_id: &str) -> Result<DriveItem, StoreError>;

    /// Fetches the raw permission list of an item
    async fn get_item_permissions(
        &self,
        drive_id: &DriveId,
        item_id: &str,
    ) -> Result<Vec<RemotePermission>, StoreError>;

    /// Issues a raw GET against an absolute URL
    ///
    /// Only transport failures are errors; any HTTP status is returned as-is.
    async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RawResponse, StoreError>;

    /// Downloads content from a pre-authenticated URL
    async fn download(&self, url: &str) -> Result<Vec<u8>, StoreError> {
        let response = self.get(url, &HashMap::new()).await?;
        classify_download(url, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        let body = classify_download("u", RawResponse::ok(b"abc".to_vec())).unwrap();
        assert_eq!(body, b"abc");
    }

    #[test]
    fn test_classify_malware_header() {
        let mut resp = RawResponse::with_status(403);
        resp.headers
            .insert(VIRUS_HEADER.to_string(), "True".to_string());
        assert_eq!(
            classify_download("u", resp),
            Err(StoreError::Malware("u".to_string()))
        );
    }

    #[test]
    fn test_classify_malware_body() {
        let mut resp = RawResponse::with_status(403);
        resp.body = br#"{"error":{"code":"malwareDetected"}}"#.to_vec();
        assert!(matches!(
            classify_download("u", resp),
            Err(StoreError::Malware(_))
        ));
    }

    #[test]
    fn test_classify_statuses() {
        assert!(matches!(
            classify_download("u", RawResponse::with_status(401)),
            Err(StoreError::Unauthorized(_))
        ));
        assert!(matches!(
            classify_download("u", RawResponse::with_status(404)),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            classify_download("u", RawResponse::with_status(503)),
            Err(StoreError::ServiceUnavailable(_))
        ));
    }
}
