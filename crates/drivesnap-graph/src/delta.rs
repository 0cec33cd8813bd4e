//! Microsoft Graph Delta API for incremental backups
//!
//! Implements the delta query pattern for drives, which returns only the
//! items that changed since a previous query.
//!
//! ## Delta Query Flow
//!
//! 1. **Initial enumeration**: start without a cursor to receive every item
//! 2. **Follow pages**: each page links the next one via `@odata.nextLink`
//! 3. **Save cursor**: the last page carries `@odata.deltaLink`, the cursor
//!    for the next backup
//! 4. **Expired cursor**: HTTP 410 means the cursor is no longer valid; the
//!    pager restarts without a cursor and flags the first page it then
//!    returns as a reset
//!
//! Every Graph item is converted into a [`DriveItem`] by [`DeltaParser`]
//! before it leaves this module.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use drivesnap_core::domain::{DriveId, DriveItem, ItemKind, ParentReference};
use drivesnap_core::ports::{DeltaPage, DeltaPager, DeltaUpdate, ItemFields};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::client::GraphClient;
use crate::GraphError;

/// Fields requested for a backup enumeration
pub const BACKUP_SELECT: &str = "id,name,size,file,folder,package,root,deleted,malware,shared,\
parentReference,createdBy,createdDateTime,lastModifiedDateTime,content.downloadUrl";

/// Fields requested when refreshing download URLs
pub const URL_CACHE_SELECT: &str = "id,file,folder,deleted,content.downloadUrl";

/// Legacy parent path prefix (`/drive/root:`), not scoped to a drive ID
const LEGACY_ROOT_PREFIX: &str = "/drive/root:";

// ============================================================================
// Microsoft Graph API response types (JSON deserialization)
// ============================================================================

/// Raw response from the Microsoft Graph delta API
///
/// See: <https://learn.microsoft.com/en-us/graph/api/driveitem-delta>
#[derive(Debug, Deserialize)]
pub(crate) struct GraphDeltaResponse {
    #[serde(default)]
    value: Vec<GraphDriveItem>,

    /// URL for the next page of results (present when more pages exist)
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,

    /// Cursor for the next enumeration (present only on the last page)
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

/// A drive item as returned by the Graph API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphDriveItem {
    id: String,

    #[serde(default)]
    name: String,

    size: Option<u64>,

    created_date_time: Option<DateTime<Utc>>,
    last_modified_date_time: Option<DateTime<Utc>>,

    parent_reference: Option<GraphParentReference>,

    file: Option<GraphFileFacet>,
    folder: Option<serde_json::Value>,
    package: Option<serde_json::Value>,
    root: Option<serde_json::Value>,
    deleted: Option<serde_json::Value>,
    malware: Option<serde_json::Value>,
    shared: Option<serde_json::Value>,

    created_by: Option<GraphIdentitySet>,

    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphParentReference {
    id: Option<String>,
    /// Format: `/drive/root:/path/to/parent` or `/drives/<id>/root:/...`
    path: Option<String>,
    drive_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFileFacet {
    mime_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GraphIdentitySet {
    user: Option<GraphIdentity>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GraphIdentity {
    email: Option<String>,
    display_name: Option<String>,
}

// ============================================================================
// DeltaParser - converts Graph API responses to domain types
// ============================================================================

/// Converts Graph drive items into [`DriveItem`]s
pub struct DeltaParser;

impl DeltaParser {
    /// Converts one Graph item.
    ///
    /// # Arguments
    /// * `item` - The deserialized Graph item
    /// * `drive_id` - Drive the item was enumerated from, used to scope
    ///   legacy parent paths
    ///
    /// # Errors
    /// Returns [`GraphError::InvalidResponse`] for a live item that is
    /// neither a file nor a container
    pub(crate) fn parse_item(item: GraphDriveItem, drive_id: &str) -> Result<DriveItem, GraphError> {
        let deleted = item.deleted.is_some();

        let kind = if item.root.is_some() {
            ItemKind::Root
        } else if item.package.is_some() {
            ItemKind::Package
        } else if item.folder.is_some() {
            ItemKind::Folder
        } else if item.file.is_some() || deleted {
            // Delete markers may come without facets; a folder delete then
            // reaches the engine as a file delete.
            ItemKind::File
        } else {
            return Err(GraphError::InvalidResponse(format!(
                "item {} has unknown type",
                item.id
            )));
        };

        let parent = item.parent_reference.map(|pr| {
            let drive_scope = pr.drive_id.as_deref().unwrap_or(drive_id);
            ParentReference {
                id: pr.id,
                path: pr
                    .path
                    .as_deref()
                    .map(|p| Self::normalize_parent_path(p, drive_scope)),
                drive_id: pr.drive_id,
                drive_name: None,
            }
        });

        let created_by = item
            .created_by
            .and_then(|c| c.user)
            .and_then(|u| u.email.or(u.display_name));

        Ok(DriveItem {
            id: item.id,
            name: item.name,
            kind,
            size: item.size.unwrap_or(0),
            parent,
            deleted,
            malware: item.malware.is_some(),
            shared: item.shared.is_some(),
            mime_type: item.file.and_then(|f| f.mime_type),
            download_url: item.download_url,
            created_by,
            created: item.created_date_time,
            modified: item.last_modified_date_time,
        })
    }

    /// Rewrites a parent path into the drive-scoped form
    /// `/drives/<driveID>/root:/...`.
    ///
    /// Paths already in that form, or in any other form, are returned as-is.
    pub fn normalize_parent_path(parent_path: &str, drive_id: &str) -> String {
        match parent_path.strip_prefix(LEGACY_ROOT_PREFIX) {
            Some(rest) => format!("/drives/{drive_id}/root:{rest}"),
            None => parent_path.to_string(),
        }
    }

    /// Converts every item of a page, dropping items that fail conversion.
    fn parse_page(items: Vec<GraphDriveItem>, drive_id: &str) -> Vec<DriveItem> {
        items
            .into_iter()
            .filter_map(|item| match Self::parse_item(item, drive_id) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(drive_id, error = %e, "dropping unconvertible delta item");
                    None
                }
            })
            .collect()
    }
}

// ============================================================================
// GraphDeltaPager
// ============================================================================

/// One paged delta enumeration of a drive
pub struct GraphDeltaPager {
    client: Arc<GraphClient>,
    drive_id: DriveId,
    /// Cursor-less query, used for the first request of a full enumeration
    /// and after an expired cursor
    fresh_url: String,
    next_url: Option<String>,
    delta_link: Option<String>,
    reset_pending: bool,
    had_reset: bool,
    error: Option<GraphError>,
    cancelled: bool,
}

impl GraphDeltaPager {
    /// Creates a pager; no request is made until the first page is pulled.
    ///
    /// # Arguments
    /// * `client` - Authenticated Graph client
    /// * `drive_id` - Drive to enumerate
    /// * `prev_delta_link` - Cursor of the previous enumeration; empty for a full enumeration
    /// * `fields` - Field selection of the returned items
    pub fn new(
        client: Arc<GraphClient>,
        drive_id: DriveId,
        prev_delta_link: &str,
        fields: ItemFields,
    ) -> Self {
        let select = match fields {
            ItemFields::Backup => BACKUP_SELECT,
            ItemFields::UrlCache => URL_CACHE_SELECT,
        };
        let fresh_url = format!(
            "{}/drives/{}/root/delta?$select={}",
            client.base_url(),
            drive_id,
            select
        );
        let next_url = if prev_delta_link.is_empty() {
            fresh_url.clone()
        } else {
            prev_delta_link.to_string()
        };

        Self {
            client,
            drive_id,
            fresh_url,
            next_url: Some(next_url),
            delta_link: None,
            reset_pending: false,
            had_reset: false,
            error: None,
            cancelled: false,
        }
    }
}

#[async_trait::async_trait]
impl DeltaPager for GraphDeltaPager {
    async fn next_page(&mut self) -> Option<DeltaPage> {
        loop {
            if self.cancelled {
                return None;
            }
            let url = self.next_url.take()?;

            match self.client.get_json_url::<GraphDeltaResponse>(&url).await {
                Err(GraphError::Gone(msg)) if url != self.fresh_url => {
                    info!(drive_id = %self.drive_id, reason = %msg, "delta token expired, restarting enumeration");
                    self.reset_pending = true;
                    self.had_reset = true;
                    self.next_url = Some(self.fresh_url.clone());
                }
                Err(e) => {
                    warn!(drive_id = %self.drive_id, error = %e, "delta page request failed");
                    self.error = Some(e);
                    return None;
                }
                Ok(response) => {
                    self.next_url = response.next_link;
                    if response.delta_link.is_some() {
                        self.delta_link = response.delta_link;
                    }

                    let items = DeltaParser::parse_page(response.value, self.drive_id.as_str());

                    debug!(
                        drive_id = %self.drive_id,
                        items = items.len(),
                        has_next = self.next_url.is_some(),
                        "Received delta page"
                    );

                    return Some(DeltaPage {
                        items,
                        reset: std::mem::take(&mut self.reset_pending),
                    });
                }
            }
        }
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.next_url = None;
    }

    async fn results(&mut self) -> anyhow::Result<DeltaUpdate> {
        if let Some(e) = self.error.take() {
            return Err(anyhow::Error::new(e).context("Delta enumeration failed"));
        }

        if self.delta_link.is_none() && !self.cancelled {
            warn!(drive_id = %self.drive_id, "delta enumeration completed without a deltaLink");
        }

        Ok(DeltaUpdate {
            url: self.delta_link.clone().unwrap_or_default(),
            reset: self.had_reset,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
