//! Drive item view
//!
//! [`DriveItem`] is the narrow, vendor-independent view of one entry in a
//! delta page. Adapters build it once at the boundary where remote
//! responses are received; nothing past that boundary sees vendor types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of entry a delta item describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// The drive's root folder
    Root,
    /// A plain folder
    Folder,
    /// A folder-like bundle (e.g. a OneNote notebook) whose descendants
    /// are treated as package content
    Package,
    /// A file
    File,
}

/// Reference to the folder containing an item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentReference {
    /// Parent folder ID
    pub id: Option<String>,
    /// Parent path, e.g. `/drives/<driveID>/root:/Documents`
    pub path: Option<String>,
    /// Drive the parent lives in
    pub drive_id: Option<String>,
    /// Display name of that drive
    pub drive_name: Option<String>,
}

/// One create/update/delete event from a delta page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    pub kind: ItemKind,
    /// Size in bytes (0 for folders)
    pub size: u64,
    pub parent: Option<ParentReference>,
    /// The event is a delete marker for `id`
    pub deleted: bool,
    /// The service flagged the item as unsafe
    pub malware: bool,
    /// The item carries sharing information of its own
    pub shared: bool,
    pub mime_type: Option<String>,
    /// Pre-authenticated, short-lived content URL
    pub download_url: Option<String>,
    pub created_by: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl DriveItem {
    /// Creates an item of the given kind with every optional field unset.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            size: 0,
            parent: None,
            deleted: false,
            malware: false,
            shared: false,
            mime_type: None,
            download_url: None,
            created_by: None,
            created: None,
            modified: None,
        }
    }

    /// Sets the parent reference (ID and path).
    #[must_use]
    pub fn with_parent(mut self, id: impl Into<String>, path: impl Into<String>) -> Self {
        let parent = self.parent.get_or_insert_with(ParentReference::default);
        parent.id = Some(id.into());
        parent.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Marks the item as a delete marker.
    #[must_use]
    pub fn with_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Marks the item as malware.
    #[must_use]
    pub fn with_malware(mut self) -> Self {
        self.malware = true;
        self
    }

    #[must_use]
    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.kind == ItemKind::Root
    }

    #[must_use]
    pub fn is_package(&self) -> bool {
        self.kind == ItemKind::Package
    }

    /// Root, folders and packages are all containers.
    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, ItemKind::Root | ItemKind::Folder | ItemKind::Package)
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == ItemKind::File
    }

    /// Parent folder ID, if present and non-empty.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.parent
            .as_ref()
            .and_then(|p| p.id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Parent path, if present and non-empty.
    #[must_use]
    pub fn parent_path(&self) -> Option<&str> {
        self.parent
            .as_ref()
            .and_then(|p| p.path.as_deref())
            .filter(|path| !path.is_empty())
    }
}
