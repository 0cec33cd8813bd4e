//! Microsoft Graph API client
//!
//! Provides a typed HTTP client for the drive endpoints the backup engine
//! needs. Handles authentication headers, status classification, and
//! conversion of responses into domain types.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use drivesnap_graph::client::GraphClient;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = GraphClient::new("access-token-here");
//! let drives = client.list_drives("user-id").await?;
//! println!("{} drives", drives.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use drivesnap_core::domain::{DriveId, DriveItem, Grantee, LinkShareLink, RemotePermission};
use drivesnap_core::ports::{Drive, RawResponse};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::delta::{DeltaParser, GraphDriveItem};
use crate::GraphError;

/// Base URL for Microsoft Graph API v1.0
pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Longest response excerpt carried in an error
const MAX_ERROR_BODY: usize = 512;

// ============================================================================
// Graph API response types
// ============================================================================

/// A page of a collection response
#[derive(Debug, Deserialize)]
struct GraphPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,

    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Entry of `GET /users/{id}/drives`
#[derive(Debug, Deserialize)]
struct GraphDrive {
    id: String,
    #[serde(default)]
    name: String,
}

/// Identity of a permission grantee
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GraphIdentity {
    id: Option<String>,
    email: Option<String>,
}

/// `identitySet`: exactly one of the members is usually present
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GraphIdentitySet {
    user: Option<GraphIdentity>,
    group: Option<GraphIdentity>,
    application: Option<GraphIdentity>,
}

impl GraphIdentitySet {
    fn into_grantee(self) -> Option<Grantee> {
        let (identity, entity_type) = if let Some(user) = self.user {
            (user, "user")
        } else if let Some(group) = self.group {
            (group, "group")
        } else {
            (self.application?, "application")
        };

        Some(Grantee {
            entity_id: identity.id,
            email: identity.email,
            entity_type: Some(entity_type.to_string()),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GraphItemReference {
    id: Option<String>,
    path: Option<String>,
}

/// Entry of `GET /drives/{d}/items/{i}/permissions`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphPermission {
    #[serde(default)]
    id: String,
    #[serde(default)]
    roles: Vec<String>,
    granted_to_v2: Option<GraphIdentitySet>,
    granted_to: Option<GraphIdentitySet>,
    #[serde(default)]
    granted_to_identities_v2: Vec<GraphIdentitySet>,
    link: Option<LinkShareLink>,
    inherited_from: Option<GraphItemReference>,
    expiration_date_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    has_password: bool,
}

impl From<GraphPermission> for RemotePermission {
    fn from(p: GraphPermission) -> Self {
        let granted_to = p
            .granted_to_v2
            .or(p.granted_to)
            .and_then(GraphIdentitySet::into_grantee);

        let granted_to_identities = p
            .granted_to_identities_v2
            .into_iter()
            .filter_map(GraphIdentitySet::into_grantee)
            .collect();

        let inherited_from = p
            .inherited_from
            .and_then(|r| r.id.or(r.path))
            .filter(|s| !s.is_empty());

        RemotePermission {
            id: p.id,
            roles: p.roles,
            granted_to,
            granted_to_identities,
            link: p.link,
            inherited_from,
            expiration: p.expiration_date_time,
            has_password: p.has_password,
        }
    }
}

// ============================================================================
// GraphClient
// ============================================================================

/// HTTP client for Microsoft Graph API calls
///
/// Wraps `reqwest::Client` with authentication headers and base URL
/// construction for the Microsoft Graph API.
#[derive(Debug, Clone)]
pub struct GraphClient {
    /// The underlying HTTP client
    client: Client,
    /// Base URL for API requests
    base_url: String,
    /// Current OAuth2 access token
    access_token: String,
}

impl GraphClient {
    /// Creates a new GraphClient with the given access token
    ///
    /// # Arguments
    /// * `access_token` - A valid OAuth2 access token for Microsoft Graph
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_base_url(access_token, GRAPH_BASE_URL)
    }

    /// Creates a new GraphClient with a custom base URL (useful for testing)
    ///
    /// # Arguments
    /// * `access_token` - A valid OAuth2 access token
    /// * `base_url` - Custom base URL for API requests
    pub fn with_base_url(access_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    /// Updates the access token (e.g., after a token refresh)
    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.access_token = token.into();
        debug!("Updated GraphClient access token");
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Creates an authenticated request builder for a path relative to the base URL
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.request_url(method, &format!("{}{}", self.base_url, path))
    }

    /// Creates an authenticated request builder for an absolute URL
    ///
    /// Used for `@odata.nextLink` and `@odata.deltaLink` URLs, which the
    /// service returns fully qualified.
    pub fn request_url(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    /// Fetches and decodes a JSON document from an absolute URL.
    ///
    /// # Errors
    /// Returns the status-classified error for non-success responses, or
    /// [`GraphError::InvalidResponse`] if the body cannot be decoded
    pub async fn get_json_url<T: DeserializeOwned>(&self, url: &str) -> Result<T, GraphError> {
        let response = self.request_url(Method::GET, url).send().await?;
        let response = check_status(response, url).await?;

        response
            .json()
            .await
            .map_err(|e| GraphError::InvalidResponse(format!("{url}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GraphError> {
        self.get_json_url(&format!("{}{}", self.base_url, path)).await
    }

    /// Lists every drive of a user, following pagination.
    ///
    /// # Errors
    /// Returns error if a request fails or a drive carries an invalid ID
    pub async fn list_drives(&self, owner_id: &str) -> Result<Vec<Drive>, GraphError> {
        let mut url = format!("{}/users/{}/drives", self.base_url, owner_id);
        let mut drives = Vec::new();

        loop {
            let page: GraphPage<GraphDrive> = self.get_json_url(&url).await?;

            for d in page.value {
                let id = DriveId::new(d.id)
                    .map_err(|e| GraphError::InvalidResponse(e.to_string()))?;
                drives.push(Drive { id, name: d.name });
            }

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        debug!(owner_id, count = drives.len(), "Listed drives");
        Ok(drives)
    }

    /// Fetches the root folder of a drive.
    ///
    /// # Errors
    /// Returns error if the request fails or the item cannot be converted
    pub async fn get_root_folder(&self, drive_id: &DriveId) -> Result<DriveItem, GraphError> {
        let item: GraphDriveItem = self.get_json(&format!("/drives/{drive_id}/root")).await?;
        DeltaParser::parse_item(item, drive_id.as_str())
    }

    /// Fetches the current record of an item, including a fresh download URL.
    ///
    /// # Errors
    /// Returns error if the request fails or the item cannot be converted
    pub async fn get_item(&self, drive_id: &DriveId, item_id: &str) -> Result<DriveItem, GraphError> {
        let item: GraphDriveItem = self
            .get_json(&format!("/drives/{drive_id}/items/{item_id}"))
            .await?;
        DeltaParser::parse_item(item, drive_id.as_str())
    }

    /// Fetches the permission list of an item.
    ///
    /// # Errors
    /// Returns error if a request fails
    pub async fn get_item_permissions(
        &self,
        drive_id: &DriveId,
        item_id: &str,
    ) -> Result<Vec<RemotePermission>, GraphError> {
        let mut url = format!(
            "{}/drives/{drive_id}/items/{item_id}/permissions",
            self.base_url
        );
        let mut perms = Vec::new();

        loop {
            let page: GraphPage<GraphPermission> = self.get_json_url(&url).await?;
            perms.extend(page.value.into_iter().map(RemotePermission::from));

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(perms)
    }

    /// Issues a raw GET against an absolute URL.
    ///
    /// Any HTTP status is returned as-is; header names are lowercased.
    ///
    /// # Errors
    /// Returns error only on transport failures
    pub async fn get_raw(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RawResponse, GraphError> {
        // Download URLs are pre-authenticated; no bearer token.
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        debug!(status, bytes = body.len(), "Raw GET completed");

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

/// Classifies non-success responses.
pub(crate) async fn check_status(response: Response, url: &str) -> Result<Response, GraphError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }

    Err(GraphError::from_status(
        status.as_u16(),
        format!("GET {url}: {body}"),
    ))
}
