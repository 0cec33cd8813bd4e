//! Recorded delta feeds
//!
//! A recording is a JSON document holding, per drive, the pages each delta
//! query returned. [`ReplaySource`] serves those pages through the
//! [`DriveSource`] port so a backup can be planned offline. Once a drive's
//! recorded queries are used up, further queries return a single empty page,
//! which is what a quiet drive looks like.
//!
//! ```json
//! {
//!   "drives": [{
//!     "id": "d1",
//!     "name": "OneDrive",
//!     "delta_link": "link-1",
//!     "queries": [[{
//!       "items": [
//!         {"id": "root", "name": "root", "kind": "root"},
//!         {"id": "f1", "name": "Documents", "kind": "folder",
//!          "parent_id": "root", "parent_path": "/drives/d1/root:"}
//!       ]
//!     }]]
//!   }]
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use drivesnap_core::domain::{
    DriveId, DriveItem, ItemKind, ParentReference, RemotePermission, StoreError,
};
use drivesnap_core::ports::{
    DeltaPage, DeltaPager, DeltaUpdate, Drive, DriveSource, ItemFields, ItemStore, RawResponse,
};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Recording {
    pub drives: Vec<RecordedDrive>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordedDrive {
    pub id: String,
    pub name: String,
    /// Root folder; taken from the first recorded root item when absent
    #[serde(default)]
    pub root: Option<RecordedItem>,
    /// Cursor handed out at the end of every query
    #[serde(default)]
    pub delta_link: Option<String>,
    /// Pages of each consecutive delta query
    #[serde(default)]
    pub queries: Vec<Vec<RecordedPage>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordedPage {
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub items: Vec<RecordedItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordedItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: ItemKind,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub parent_path: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub malware: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl RecordedItem {
    fn into_item(self, drive_id: &str) -> DriveItem {
        let mut item = DriveItem::new(self.id, self.name, self.kind).with_size(self.size);

        if self.parent_id.is_some() || self.parent_path.is_some() {
            item.parent = Some(ParentReference {
                id: self.parent_id,
                path: self.parent_path,
                drive_id: Some(drive_id.to_string()),
                drive_name: None,
            });
        }

        item.deleted = self.deleted;
        item.malware = self.malware;
        item.shared = self.shared;
        item.download_url = self.download_url;
        item
    }
}

impl Recording {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recording {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse recording {}", path.display()))
    }
}

// ============================================================================
// ReplaySource
// ============================================================================

/// [`DriveSource`] serving recorded delta queries in order
#[derive(Debug)]
pub struct ReplaySource {
    drives: Vec<Drive>,
    roots: HashMap<String, DriveItem>,
    links: HashMap<String, String>,
    queries: Mutex<HashMap<String, VecDeque<Vec<DeltaPage>>>>,
}

impl ReplaySource {
    pub fn from_recording(recording: Recording) -> Result<Self> {
        let mut drives = Vec::with_capacity(recording.drives.len());
        let mut roots = HashMap::new();
        let mut links = HashMap::new();
        let mut queries = HashMap::new();

        for rec in recording.drives {
            let id = DriveId::new(rec.id.clone())
                .with_context(|| format!("Invalid drive ID in recording: {:?}", rec.id))?;

            let pages: VecDeque<Vec<DeltaPage>> = rec
                .queries
                .into_iter()
                .map(|query| {
                    query
                        .into_iter()
                        .map(|page| DeltaPage {
                            reset: page.reset,
                            items: page.items.into_iter().map(|i| i.into_item(&rec.id)).collect(),
                        })
                        .collect()
                })
                .collect();

            let root = match rec.root {
                Some(root) => Some(root.into_item(&rec.id)),
                None => pages
                    .iter()
                    .flatten()
                    .flat_map(|page| page.items.iter())
                    .find(|item| item.is_root())
                    .cloned(),
            };

            if let Some(root) = root {
                roots.insert(rec.id.clone(), root);
            }
            if let Some(link) = rec.delta_link {
                links.insert(rec.id.clone(), link);
            }

            queries.insert(rec.id.clone(), pages);
            drives.push(Drive { id, name: rec.name });
        }

        Ok(Self {
            drives,
            roots,
            links,
            queries: Mutex::new(queries),
        })
    }

    fn next_query(&self, drive_id: &str) -> Vec<DeltaPage> {
        let mut queries = self.queries.lock().unwrap_or_else(PoisonError::into_inner);
        queries
            .get_mut(drive_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| vec![DeltaPage::default()])
    }
}

#[async_trait::async_trait]
impl DriveSource for ReplaySource {
    async fn list_drives(&self, _owner_id: &str) -> Result<Vec<Drive>> {
        Ok(self.drives.clone())
    }

    async fn get_root_folder(&self, drive_id: &DriveId) -> Result<DriveItem> {
        self.roots
            .get(drive_id.as_str())
            .cloned()
            .with_context(|| format!("Recording has no root folder for drive {drive_id}"))
    }

    fn enumerate_items_delta(
        &self,
        drive_id: &DriveId,
        prev_delta_link: &str,
        fields: ItemFields,
    ) -> Box<dyn DeltaPager> {
        let pages = match fields {
            ItemFields::Backup => self.next_query(drive_id.as_str()),
            ItemFields::UrlCache => vec![DeltaPage::default()],
        };

        debug!(
            drive_id = %drive_id,
            has_prev_delta = !prev_delta_link.is_empty(),
            num_pages = pages.len(),
            "Replaying delta query"
        );

        let link = self
            .links
            .get(drive_id.as_str())
            .cloned()
            .unwrap_or_else(|| format!("replay:{drive_id}"));

        Box::new(ReplayPager {
            pages: pages.into(),
            link,
            reset: false,
            cancelled: false,
        })
    }
}

struct ReplayPager {
    pages: VecDeque<DeltaPage>,
    link: String,
    reset: bool,
    cancelled: bool,
}

#[async_trait::async_trait]
impl DeltaPager for ReplayPager {
    async fn next_page(&mut self) -> Option<DeltaPage> {
        if self.cancelled {
            return None;
        }
        let page = self.pages.pop_front()?;
        self.reset |= page.reset;
        Some(page)
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }

    async fn results(&mut self) -> Result<DeltaUpdate> {
        Ok(DeltaUpdate {
            url: self.link.clone(),
            reset: self.reset,
        })
    }
}

// ============================================================================
// ReplayStore
// ============================================================================

/// [`ItemStore`] for offline planning; no item content is available
#[derive(Debug, Default)]
pub struct ReplayStore;

#[async_trait::async_trait]
impl ItemStore for ReplayStore {
    async fn get_item(&self, _drive_id: &DriveId, item_id: &str) -> Result<DriveItem, StoreError> {
        Err(StoreError::NotFound(item_id.to_string()))
    }

    async fn get_item_permissions(
        &self,
        _drive_id: &DriveId,
        _item_id: &str,
    ) -> Result<Vec<RemotePermission>, StoreError> {
        Ok(Vec::new())
    }

    async fn get(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<RawResponse, StoreError> {
        Err(StoreError::NotFound(url.to_string()))
    }
}
