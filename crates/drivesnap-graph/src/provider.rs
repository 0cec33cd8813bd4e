//! GraphProvider - port implementations for Microsoft Graph
//!
//! Wraps a shared [`GraphClient`] and fulfils the [`DriveSource`] and
//! [`ItemStore`] contracts the backup engine consumes.
//!
//! ## Design Notes
//!
//! - The client is held in an `Arc` because every delta pager handed out by
//!   [`DriveSource::enumerate_items_delta`] owns a handle to it.
//! - Drive-source methods return `anyhow::Result` with context; item-store
//!   methods classify failures as [`StoreError`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use drivesnap_core::domain::{DriveId, DriveItem, RemotePermission, StoreError};
use drivesnap_core::ports::{DeltaPager, Drive, DriveSource, ItemFields, ItemStore, RawResponse};
use tracing::debug;

use crate::client::GraphClient;
use crate::delta::GraphDeltaPager;

/// Microsoft Graph implementation of the backup ports
#[derive(Debug, Clone)]
pub struct GraphProvider {
    client: Arc<GraphClient>,
}

impl GraphProvider {
    pub fn new(client: GraphClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }
}

#[async_trait::async_trait]
impl DriveSource for GraphProvider {
    async fn list_drives(&self, owner_id: &str) -> Result<Vec<Drive>> {
        self.client
            .list_drives(owner_id)
            .await
            .with_context(|| format!("Failed to list drives of {owner_id}"))
    }

    async fn get_root_folder(&self, drive_id: &DriveId) -> Result<DriveItem> {
        self.client
            .get_root_folder(drive_id)
            .await
            .with_context(|| format!("Failed to get root folder of drive {drive_id}"))
    }

    fn enumerate_items_delta(
        &self,
        drive_id: &DriveId,
        prev_delta_link: &str,
        fields: ItemFields,
    ) -> Box<dyn DeltaPager> {
        debug!(
            drive_id = %drive_id,
            has_prev_delta = !prev_delta_link.is_empty(),
            ?fields,
            "Starting delta enumeration"
        );

        Box::new(GraphDeltaPager::new(
            self.client.clone(),
            drive_id.clone(),
            prev_delta_link,
            fields,
        ))
    }
}

#[async_trait::async_trait]
impl ItemStore for GraphProvider {
    async fn get_item(&self, drive_id: &DriveId, item_id: &str) -> Result<DriveItem, StoreError> {
        let item = self.client.get_item(drive_id, item_id).await?;

        if item.deleted {
            return Err(StoreError::DeletedInFlight(item_id.to_string()));
        }

        Ok(item)
    }

    async fn get_item_permissions(
        &self,
        drive_id: &DriveId,
        item_id: &str,
    ) -> Result<Vec<RemotePermission>, StoreError> {
        Ok(self.client.get_item_permissions(drive_id, item_id).await?)
    }

    async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<RawResponse, StoreError> {
        Ok(self.client.get_raw(url, headers).await?)
    }
}
