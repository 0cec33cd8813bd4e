//! Delta enumeration port (driven/secondary port)
//!
//! A [`DeltaPager`] walks one delta query of a drive page by page. The pager
//! may signal that the previous cursor was invalid, in which case the page
//! carrying `reset = true` starts a replacement enumeration and everything
//! accumulated before it must be discarded.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because pager failures are adapter-specific.
//! - `cancel` must be called on every exit path, including early ones, so
//!   adapters can release half-consumed connections.

use serde::{Deserialize, Serialize};

use crate::domain::drive_item::DriveItem;
use crate::domain::newtypes::DriveId;

/// One page of delta results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaPage {
    pub items: Vec<DriveItem>,
    /// The enumeration restarted from scratch with this page
    pub reset: bool,
}

/// Final cursor of a delta enumeration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaUpdate {
    /// Link to resume enumeration from next time (may be empty)
    pub url: String,
    /// At least one reset happened during the enumeration
    pub reset: bool,
}

/// Which item fields an enumeration must return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFields {
    /// Everything the backup needs
    Backup,
    /// The minimal set needed to refresh download URLs
    UrlCache,
}

/// A remote drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub id: DriveId,
    pub name: String,
}

/// A single paged delta enumeration
#[async_trait::async_trait]
pub trait DeltaPager: Send {
    /// Returns the next page, or `None` once the enumeration is exhausted or failed
    async fn next_page(&mut self) -> Option<DeltaPage>;

    /// Stops the enumeration; later `next_page` calls return `None`
    fn cancel(&mut self);

    /// Final cursor, or the error that ended the enumeration
    async fn results(&mut self) -> anyhow::Result<DeltaUpdate>;
}

/// Source of drives and their change feeds
#[async_trait::async_trait]
pub trait DriveSource: Send + Sync {
    /// Lists every drive owned by `owner_id`
    async fn list_drives(&self, owner_id: &str) -> anyhow::Result<Vec<Drive>>;

    /// Fetches the root folder item of a drive
    async fn get_root_folder(&self, drive_id: &DriveId) -> anyhow::Result<DriveItem>;

    /// Starts a delta enumeration from `prev_delta_link`
    ///
    /// # Arguments
    /// * `drive_id` - The drive to enumerate
    /// * `prev_delta_link` - Cursor from the previous run; empty for a full enumeration
    /// * `fields` - Field selection for the returned items
    fn enumerate_items_delta(
        &self,
        drive_id: &DriveId,
        prev_delta_link: &str,
        fields: ItemFields,
    ) -> Box<dyn DeltaPager>;
}
