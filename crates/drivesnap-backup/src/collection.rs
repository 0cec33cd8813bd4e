//! Per-folder backup collections
//!
//! A [`Collection`] holds the items queued for one folder of one drive. When
//! the consumer calls [`Collection::items`], every queued entry is streamed
//! concurrently as up to two [`BackupItem`]s:
//!
//! - `<id>.data`: the file content, fetched lazily on first read
//! - `<id>.meta` (or `.dirmeta` for folders): the sharing metadata
//!
//! ## Content fetch cascade
//!
//! 1. Download from the item's own URL
//! 2. On an expired URL, ask the drive's URL cache for a fresh one
//! 3. On a cache miss, fetch the item record again and retry once
//!
//! Malware, deleted-in-flight and inaccessible OneNote content are recorded
//! as skips; any other failure is recoverable and surfaced to the reader.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use drivesnap_core::domain::{
    BackupPath, DomainError, DriveId, DriveItem, FaultBus, ItemMeta, SkipCause, Skipped, StoreError,
};
use drivesnap_core::ports::{Drive, ItemStore};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extensions::{ExtensionData, ExtensionReader, ItemExtensionFactory};
use crate::metadata::{DATA_FILE_SUFFIX, DIR_META_FILE_SUFFIX, META_FILE_SUFFIX};
use crate::url_cache::ItemPropertyLookup;

/// Capacity of the channel returned by [`Collection::items`]
pub const COLLECTION_BUFFER_SIZE: usize = 1000;

/// Largest OneNote export the service is known to produce
pub const MAX_ONENOTE_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

const ONENOTE_MIME_TYPE: &str = "application/msonenote";

// ============================================================================
// State and status
// ============================================================================

/// How a collection relates to the previous backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    New,
    NotMoved,
    Moved,
    Deleted,
}

impl CollectionState {
    /// Classifies a collection from its previous and current paths.
    #[must_use]
    pub fn of(prev: Option<&BackupPath>, curr: Option<&BackupPath>) -> Self {
        match (prev, curr) {
            (_, None) => Self::Deleted,
            (None, Some(_)) => Self::New,
            (Some(prev), Some(curr)) if prev == curr => Self::NotMoved,
            (Some(_), Some(_)) => Self::Moved,
        }
    }
}

impl fmt::Display for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::NotMoved => "not_moved",
            Self::Moved => "moved",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Outcome of one [`Collection::items`] run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionStatus {
    pub folder: String,
    /// Files found in the collection
    pub objects: usize,
    /// Files streamed successfully
    pub successes: usize,
    /// Bytes of all streamed entries
    pub bytes: u64,
}

/// Receives exactly one [`CollectionStatus`] per `items` run
pub type StatusUpdater = Arc<dyn Fn(CollectionStatus) + Send + Sync>;

/// A status updater that drops every status
pub fn noop_status_updater() -> StatusUpdater {
    Arc::new(|_| {})
}

// ============================================================================
// Errors
// ============================================================================

/// Failure to produce an item's content
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContentError {
    #[error("Malware item: {0}")]
    Malware(String),

    #[error("Deleted item: {0}")]
    DeletedInFlight(String),

    #[error("Inaccessible OneNote item: {0}")]
    OneNote(String),

    #[error("Fetching item content: {0}")]
    Failed(String),

    #[error("Reading item content: {0}")]
    Read(String),
}

impl ContentError {
    /// True when the item can be dropped without failing the backup.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::Malware(_) | Self::DeletedInFlight(_) | Self::OneNote(_)
        )
    }
}

// ============================================================================
// Backup items
// ============================================================================

/// Reader over an item's content, wrapped by the configured extensions
pub type ItemReader = ExtensionReader<Cursor<Vec<u8>>>;

/// Content that is only fetched when first opened
pub struct LazyContent {
    fetcher: Arc<ContentFetcher>,
    item: DriveItem,
    errs: Arc<FaultBus>,
}

impl fmt::Debug for LazyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyContent")
            .field("item_id", &self.item.id)
            .finish_non_exhaustive()
    }
}

impl LazyContent {
    /// Fetches the content and wraps it with the item extensions.
    ///
    /// # Errors
    /// Returns the classified [`ContentError`]; skips and recoverable errors
    /// are also recorded on the fault bus
    pub async fn open(self) -> Result<ItemReader, ContentError> {
        let bytes = self
            .fetcher
            .get_drive_item_content(&self.item, &self.errs)
            .await?;

        Ok(ExtensionReader::new(
            Cursor::new(bytes),
            &self.item,
            &self.fetcher.extensions,
        ))
    }
}

#[derive(Debug)]
pub enum ItemContent {
    Ready(Vec<u8>),
    Lazy(LazyContent),
}

/// One entry streamed out of a collection
#[derive(Debug)]
pub struct BackupItem {
    name: String,
    modified: DateTime<Utc>,
    content: ItemContent,
}

impl BackupItem {
    pub fn ready(name: impl Into<String>, modified: DateTime<Utc>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            modified,
            content: ItemContent::Ready(data),
        }
    }

    fn lazy(name: String, modified: DateTime<Utc>, content: LazyContent) -> Self {
        Self {
            name,
            modified,
            content: ItemContent::Lazy(content),
        }
    }

    /// Entry name, e.g. `<id>.data`
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    #[must_use]
    pub fn is_lazy(&self) -> bool {
        matches!(self.content, ItemContent::Lazy(_))
    }

    pub fn into_content(self) -> ItemContent {
        self.content
    }

    /// Reads the whole content, returning it with any extension data.
    ///
    /// # Errors
    /// Returns the fetch error for lazy content, or [`ContentError::Read`]
    /// if reading or an extension failed
    pub async fn read_all(self) -> Result<(Vec<u8>, Option<ExtensionData>), ContentError> {
        match self.content {
            ItemContent::Ready(data) => Ok((data, None)),
            ItemContent::Lazy(lazy) => {
                let mut reader = lazy.open().await?;
                let handle = reader.handle();

                let mut out = Vec::new();
                reader
                    .read_to_end(&mut out)
                    .await
                    .map_err(|e| ContentError::Read(e.to_string()))?;

                Ok((out, handle.data()))
            }
        }
    }
}

// ============================================================================
// Content fetching
// ============================================================================

struct ContentFetcher {
    store: Arc<dyn ItemStore>,
    drive_id: DriveId,
    url_cache: Option<Arc<dyn ItemPropertyLookup>>,
    is_package_or_child_of_package: bool,
    extensions: Vec<Arc<dyn ItemExtensionFactory>>,
}

impl ContentFetcher {
    async fn get_drive_item_content(
        &self,
        item: &DriveItem,
        errs: &FaultBus,
    ) -> Result<Vec<u8>, ContentError> {
        let err = match self.download_content(item).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };

        if matches!(err, StoreError::Malware(_)) || item.malware {
            info!(item_id = %item.id, skipped_reason = %SkipCause::Malware, "item flagged as malware");
            errs.add_skip(Skipped::file(
                SkipCause::Malware,
                self.drive_id.as_str(),
                &item.id,
                &item.name,
            ));
            return Err(ContentError::Malware(err.to_string()));
        }

        if err.is_not_found_or_deleted() {
            info!(item_id = %item.id, error = %err, "item not found, probably deleted in flight");
            return Err(ContentError::DeletedInFlight(err.to_string()));
        }

        let is_onenote = item
            .mime_type
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(ONENOTE_MIME_TYPE));

        if matches!(err, StoreError::ServiceUnavailable(_))
            && (self.is_package_or_child_of_package || is_onenote)
        {
            info!(item_id = %item.id, skipped_reason = %SkipCause::OneNote, "inaccessible one note file");
            errs.add_skip(Skipped::file(
                SkipCause::OneNote,
                self.drive_id.as_str(),
                &item.id,
                &item.name,
            ));
            return Err(ContentError::OneNote(err.to_string()));
        }

        warn!(item_id = %item.id, error = %err, "downloading item content");
        errs.add_recoverable(format!("downloading item content {}: {err}", item.id));

        Err(ContentError::Failed(err.to_string()))
    }

    async fn download_content(&self, item: &DriveItem) -> Result<Vec<u8>, StoreError> {
        match download_item(self.store.as_ref(), item).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if !e.is_unauthorized() => return Err(e),
            Err(_) => {}
        }

        match self.read_item_contents(&item.id).await {
            Ok(bytes) => {
                debug!(item_id = %item.id, "found item in url cache");
                return Ok(bytes);
            }
            Err(e) => {
                info!(item_id = %item.id, error = %e, "url cache miss: refetching from API");
            }
        }

        let fresh = self
            .store
            .get_item(&self.drive_id, &item.id)
            .await
            .inspect_err(|e| debug!(item_id = %item.id, error = %e, "retrieving expired item"))?;

        download_item(self.store.as_ref(), &fresh)
            .await
            .inspect_err(|e| debug!(item_id = %item.id, error = %e, "content download retry"))
    }

    async fn read_item_contents(&self, item_id: &str) -> Result<Vec<u8>, String> {
        let Some(cache) = &self.url_cache else {
            return Err("nil url cache".to_string());
        };

        let props = cache
            .get_item_properties(item_id)
            .await
            .map_err(|e| e.to_string())?;

        if props.is_deleted {
            info!(item_id = %item_id, "item deleted in cache");
            return Err(StoreError::DeletedInFlight(item_id.to_string()).to_string());
        }

        self.store.download(&props.download_url).await.map_err(|e| {
            if e.is_unauthorized() {
                info!(item_id = %item_id, "stale item in cache");
            }
            e.to_string()
        })
    }
}

async fn download_item(store: &dyn ItemStore, item: &DriveItem) -> Result<Vec<u8>, StoreError> {
    if item.malware {
        return Err(StoreError::Malware(item.id.clone()));
    }

    let url = item
        .download_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| StoreError::MissingDownloadUrl(item.id.clone()))?;

    store.download(url).await
}

async fn download_item_meta(
    store: &dyn ItemStore,
    drive_id: &DriveId,
    item: &DriveItem,
) -> Result<Vec<u8>, StoreError> {
    let meta = if item.shared {
        let remote = store.get_item_permissions(drive_id, &item.id).await?;
        ItemMeta::from_remote(item.name.clone(), &remote)
    } else {
        ItemMeta::inherited(item.name.clone())
    };

    serde_json::to_vec(&meta).map_err(|e| StoreError::Transport(format!("encoding item meta: {e}")))
}

// ============================================================================
// Collection
// ============================================================================

/// Settings shared by every collection of a backup run
#[derive(Clone)]
pub struct CollectionOptions {
    pub item_parallelism: usize,
    pub extensions: Vec<Arc<dyn ItemExtensionFactory>>,
    pub status_updater: StatusUpdater,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            item_parallelism: 4,
            extensions: Vec::new(),
            status_updater: noop_status_updater(),
        }
    }
}

impl fmt::Debug for CollectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("item_parallelism", &self.item_parallelism)
            .field("extensions", &self.extensions.len())
            .finish_non_exhaustive()
    }
}

/// One folder's queued items
pub struct Collection {
    store: Arc<dyn ItemStore>,
    drive_id: DriveId,
    drive_name: String,
    folder_path: Option<BackupPath>,
    prev_path: Option<BackupPath>,
    state: CollectionState,
    drive_items: HashMap<String, DriveItem>,
    is_package_or_child_of_package: bool,
    do_not_merge_items: bool,
    url_cache: Option<Arc<dyn ItemPropertyLookup>>,
    options: CollectionOptions,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("drive_id", &self.drive_id)
            .field("folder_path", &self.folder_path)
            .field("prev_path", &self.prev_path)
            .field("state", &self.state)
            .field("items", &self.drive_items.len())
            .field("do_not_merge_items", &self.do_not_merge_items)
            .finish_non_exhaustive()
    }
}

impl Collection {
    /// Creates an empty collection.
    ///
    /// `curr` is `None` for a folder that no longer exists.
    ///
    /// # Errors
    /// Returns error if `curr` is not a path inside a drive
    pub fn new(
        store: Arc<dyn ItemStore>,
        drive: &Drive,
        curr: Option<BackupPath>,
        prev: Option<BackupPath>,
        is_package_or_child_of_package: bool,
        do_not_merge_items: bool,
        options: CollectionOptions,
    ) -> Result<Self, DomainError> {
        if let Some(curr) = &curr {
            curr.drive_folder_path()?;
        }

        Ok(Self {
            store,
            drive_id: drive.id.clone(),
            drive_name: drive.name.clone(),
            state: CollectionState::of(prev.as_ref(), curr.as_ref()),
            folder_path: curr,
            prev_path: prev,
            drive_items: HashMap::new(),
            is_package_or_child_of_package,
            do_not_merge_items,
            url_cache: None,
            options,
        })
    }

    /// Queues an item, replacing any earlier entry with the same ID.
    ///
    /// Returns true if the ID was not queued before.
    pub fn add(&mut self, item: DriveItem) -> bool {
        self.drive_items.insert(item.id.clone(), item).is_none()
    }

    /// Returns true if the item was queued.
    pub fn remove(&mut self, item_id: &str) -> bool {
        self.drive_items.remove(item_id).is_some()
    }

    #[must_use]
    pub fn contains(&self, item_id: &str) -> bool {
        self.drive_items.contains_key(item_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.drive_items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.drive_items.len()
    }

    /// Queued files, excluding folder entries.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.drive_items.values().filter(|i| i.is_file()).count()
    }

    #[must_use]
    pub fn full_path(&self) -> Option<&BackupPath> {
        self.folder_path.as_ref()
    }

    #[must_use]
    pub fn previous_path(&self) -> Option<&BackupPath> {
        self.prev_path.as_ref()
    }

    /// Updates the current path and re-derives the state.
    pub fn set_full_path(&mut self, curr: Option<BackupPath>) {
        self.state = CollectionState::of(self.prev_path.as_ref(), curr.as_ref());
        self.folder_path = curr;
    }

    #[must_use]
    pub fn state(&self) -> CollectionState {
        self.state
    }

    #[must_use]
    pub fn do_not_merge_items(&self) -> bool {
        self.do_not_merge_items
    }

    #[must_use]
    pub fn is_package_or_child_of_package(&self) -> bool {
        self.is_package_or_child_of_package
    }

    #[must_use]
    pub fn drive_id(&self) -> &DriveId {
        &self.drive_id
    }

    pub fn set_url_cache(&mut self, cache: Arc<dyn ItemPropertyLookup>) {
        self.url_cache = Some(cache);
    }

    #[must_use]
    pub fn has_url_cache(&self) -> bool {
        self.url_cache.is_some()
    }

    /// IDs of the queued items.
    pub fn item_ids(&self) -> impl Iterator<Item = &String> {
        self.drive_items.keys()
    }

    /// Streams every queued item.
    ///
    /// The returned channel closes once all items were processed, the
    /// fault bus reports a failure, or `cancel` fires. The status updater
    /// is invoked exactly once per call.
    pub fn items(&self, cancel: CancellationToken, errs: Arc<FaultBus>) -> mpsc::Receiver<BackupItem> {
        let (tx, rx) = mpsc::channel(COLLECTION_BUFFER_SIZE);

        let run = StreamRun {
            fetcher: Arc::new(ContentFetcher {
                store: self.store.clone(),
                drive_id: self.drive_id.clone(),
                url_cache: self.url_cache.clone(),
                is_package_or_child_of_package: self.is_package_or_child_of_package,
                extensions: self.options.extensions.clone(),
            }),
            drive_name: self.drive_name.clone(),
            folder_path: self.folder_path.clone(),
            items: self.drive_items.values().cloned().collect(),
            parallelism: self.options.item_parallelism.max(1),
            status_updater: self.options.status_updater.clone(),
        };

        tokio::spawn(run.stream_items(tx, cancel, errs));

        rx
    }
}

#[derive(Debug, Default)]
struct DriveStats {
    dirs_found: AtomicUsize,
    dirs_read: AtomicUsize,
    items_found: AtomicUsize,
    items_read: AtomicUsize,
    byte_count: AtomicU64,
}

struct StreamRun {
    fetcher: Arc<ContentFetcher>,
    drive_name: String,
    folder_path: Option<BackupPath>,
    items: Vec<DriveItem>,
    parallelism: usize,
    status_updater: StatusUpdater,
}

async fn send(tx: &mpsc::Sender<BackupItem>, cancel: &CancellationToken, item: BackupItem) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

impl StreamRun {
    async fn stream_items(
        self,
        tx: mpsc::Sender<BackupItem>,
        cancel: CancellationToken,
        errs: Arc<FaultBus>,
    ) {
        let stats = Arc::new(DriveStats::default());

        let Some(folder_path) = self.folder_path.clone() else {
            self.report_as_completed(&stats);
            return;
        };

        debug!(
            drive_id = %self.fetcher.drive_id,
            folder = %folder_path,
            is_package = self.fetcher.is_package_or_child_of_package,
            num_items = self.items.len(),
            "streaming collection items"
        );

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks = JoinSet::new();

        for mut item in self.items.iter().cloned() {
            if errs.failure().is_some() || cancel.is_cancelled() {
                break;
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            if let Some(parent) = item.parent.as_mut() {
                parent.drive_name = Some(self.drive_name.clone());
            }

            let fetcher = self.fetcher.clone();
            let stats = stats.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let errs = errs.clone();

            tasks.spawn(async move {
                let _permit = permit;
                stream_drive_item(fetcher, item, &stats, &tx, &cancel, errs).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "item streaming task failed");
            }
        }

        self.report_as_completed(&stats);
    }

    fn report_as_completed(&self, stats: &DriveStats) {
        let status = CollectionStatus {
            folder: self
                .folder_path
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            objects: stats.items_found.load(Ordering::SeqCst),
            successes: stats.items_read.load(Ordering::SeqCst),
            bytes: stats.byte_count.load(Ordering::SeqCst),
        };

        debug!(
            folder = %status.folder,
            objects = status.objects,
            successes = status.successes,
            bytes = status.bytes,
            dirs_found = stats.dirs_found.load(Ordering::SeqCst),
            dirs_read = stats.dirs_read.load(Ordering::SeqCst),
            "done streaming items"
        );

        (self.status_updater)(status);
    }
}

async fn stream_drive_item(
    fetcher: Arc<ContentFetcher>,
    item: DriveItem,
    stats: &DriveStats,
    tx: &mpsc::Sender<BackupItem>,
    cancel: &CancellationToken,
    errs: Arc<FaultBus>,
) {
    let is_file = item.is_file();

    let meta_name = if is_file {
        stats.items_found.fetch_add(1, Ordering::SeqCst);
        format!("{}{META_FILE_SUFFIX}", item.id)
    } else {
        stats.dirs_found.fetch_add(1, Ordering::SeqCst);
        DIR_META_FILE_SUFFIX.to_string()
    };

    let meta = match download_item_meta(fetcher.store.as_ref(), &fetcher.drive_id, &item).await {
        Ok(meta) => meta,
        Err(e) => {
            if !e.is_not_found_or_deleted() {
                warn!(item_id = %item.id, error = %e, "getting item metadata");
                errs.add_recoverable(format!("getting item metadata {}: {e}", item.id));
            }
            return;
        }
    };

    let now = Utc::now();
    let item_modified = item.modified.or(item.created).unwrap_or(now);
    let size = item.size;

    if is_file {
        let data = BackupItem::lazy(
            format!("{}{DATA_FILE_SUFFIX}", item.id),
            item_modified,
            LazyContent {
                fetcher: fetcher.clone(),
                item: item.clone(),
                errs: errs.clone(),
            },
        );
        if !send(tx, cancel, data).await {
            return;
        }
    }

    // permission changes do not bump the item's own mod time
    let meta_modified = now.max(item_modified);
    if !send(tx, cancel, BackupItem::ready(meta_name, meta_modified, meta)).await {
        return;
    }

    if is_file {
        stats.items_read.fetch_add(1, Ordering::SeqCst);
    } else {
        stats.dirs_read.fetch_add(1, Ordering::SeqCst);
    }
    stats.byte_count.fetch_add(size, Ordering::SeqCst);
}

// ============================================================================
// Tombstones
// ============================================================================

/// A deleted folder or drive: only a previous path, no items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TombstoneCollection {
    prev_path: BackupPath,
    do_not_merge_items: bool,
}

impl TombstoneCollection {
    pub fn new(prev_path: BackupPath, do_not_merge_items: bool) -> Self {
        Self {
            prev_path,
            do_not_merge_items,
        }
    }

    #[must_use]
    pub fn previous_path(&self) -> &BackupPath {
        &self.prev_path
    }

    #[must_use]
    pub fn do_not_merge_items(&self) -> bool {
        self.do_not_merge_items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url_cache::{ItemProps, UrlCacheError};
    use drivesnap_core::domain::{
        Category, ItemKind, RemotePermission, ResourceScope, Service, SkipCause,
    };
    use drivesnap_core::ports::RawResponse;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockStore {
        responses: Mutex<HashMap<String, Vec<RawResponse>>>,
        items: HashMap<String, DriveItem>,
        permissions: HashMap<String, Result<Vec<RemotePermission>, StoreError>>,
        get_item_calls: AtomicUsize,
    }

    impl MockStore {
        fn respond(self, url: &str, responses: Vec<RawResponse>) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(url.to_string(), responses);
            self
        }
    }

    #[async_trait::async_trait]
    impl ItemStore for MockStore {
        async fn get_item(&self, _drive_id: &DriveId, item_id: &str) -> Result<DriveItem, StoreError> {
            self.get_item_calls.fetch_add(1, Ordering::SeqCst);
            self.items
                .get(item_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(item_id.to_string()))
        }

        async fn get_item_permissions(
            &self,
            _drive_id: &DriveId,
            item_id: &str,
        ) -> Result<Vec<RemotePermission>, StoreError> {
            self.permissions
                .get(item_id)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn get(
            &self,
            url: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<RawResponse, StoreError> {
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(url) {
                Some(queue) if queue.len() > 1 => Ok(queue.remove(0)),
                Some(queue) if queue.len() == 1 => Ok(queue[0].clone()),
                _ => Ok(RawResponse::with_status(404)),
            }
        }
    }

    struct FixedLookup(Result<ItemProps, UrlCacheError>);

    #[async_trait::async_trait]
    impl ItemPropertyLookup for FixedLookup {
        async fn get_item_properties(&self, _item_id: &str) -> Result<ItemProps, UrlCacheError> {
            self.0.clone()
        }
    }

    fn drive() -> Drive {
        Drive {
            id: DriveId::new("d1".to_string()).unwrap(),
            name: "Documents".to_string(),
        }
    }

    fn folder_path() -> BackupPath {
        ResourceScope::new("t", "u", Service::OneDrive, Category::Files)
            .unwrap()
            .drive_root(&drive().id)
            .unwrap()
            .append("folder")
            .unwrap()
    }

    fn file(id: &str, url: &str) -> DriveItem {
        DriveItem::new(id, format!("{id}.txt"), ItemKind::File)
            .with_parent("folder", "/drives/d1/root:/folder")
            .with_size(3)
            .with_download_url(url)
    }

    fn collection(store: MockStore, is_package: bool) -> Collection {
        Collection::new(
            Arc::new(store),
            &drive(),
            Some(folder_path()),
            None,
            is_package,
            false,
            CollectionOptions::default(),
        )
        .expect("valid collection")
    }

    async fn drain(mut rx: mpsc::Receiver<BackupItem>) -> Vec<BackupItem> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    async fn open_single_data(coll: &Collection, errs: Arc<FaultBus>) -> Result<Vec<u8>, ContentError> {
        let items = drain(coll.items(CancellationToken::new(), errs)).await;
        let data = items
            .into_iter()
            .find(|i| i.name().ends_with(DATA_FILE_SUFFIX))
            .expect("data item");
        data.read_all().await.map(|(bytes, _)| bytes)
    }

    #[test]
    fn test_state_of() {
        let a = folder_path();
        let b = a.append("b").unwrap();

        assert_eq!(CollectionState::of(None, Some(&a)), CollectionState::New);
        assert_eq!(CollectionState::of(Some(&a), Some(&a)), CollectionState::NotMoved);
        assert_eq!(CollectionState::of(Some(&a), Some(&b)), CollectionState::Moved);
        assert_eq!(CollectionState::of(Some(&a), None), CollectionState::Deleted);
    }

    #[test]
    fn test_new_rejects_non_drive_path() {
        let not_drive = ResourceScope::new("t", "u", Service::OneDrive, Category::Files)
            .unwrap()
            .canonical_path(vec!["x".to_string()])
            .unwrap();

        let result = Collection::new(
            Arc::new(MockStore::default()),
            &drive(),
            Some(not_drive),
            None,
            false,
            false,
            CollectionOptions::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_set_full_path_updates_state() {
        let mut coll = collection(MockStore::default(), false);
        assert_eq!(coll.state(), CollectionState::New);

        coll.set_full_path(None);
        assert_eq!(coll.state(), CollectionState::Deleted);
    }

    #[tokio::test]
    async fn test_repeated_add_emits_one_pair() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let options = CollectionOptions {
            status_updater: Arc::new(move |s| sink.lock().unwrap().push(s)),
            ..CollectionOptions::default()
        };

        let mut coll = Collection::new(
            Arc::new(MockStore::default()),
            &drive(),
            Some(folder_path()),
            None,
            false,
            false,
            options,
        )
        .unwrap();

        assert!(coll.add(file("1", "https://u/1")));
        assert!(!coll.add(file("1", "https://u/1")));
        let mut last = file("1", "https://u/1");
        last.name = "final.txt".to_string();
        assert!(!coll.add(last));

        let items = drain(coll.items(CancellationToken::new(), Arc::new(FaultBus::default()))).await;
        let mut names: Vec<_> = items.iter().map(|i| i.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["1.data", "1.meta"]);

        let meta = items
            .into_iter()
            .find(|i| i.name() == "1.meta")
            .unwrap();
        let (bytes, _) = meta.read_all().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["fileName"], "final.txt");
        assert_eq!(parsed["sharingMode"], "inherited");

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].objects, 1);
        assert_eq!(statuses[0].successes, 1);
        assert_eq!(statuses[0].bytes, 3);
    }

    #[tokio::test]
    async fn test_folder_items_emit_dirmeta() {
        let mut coll = collection(MockStore::default(), false);
        coll.add(DriveItem::new("folder", "folder", ItemKind::Folder).with_parent("root", ""));

        let items = drain(coll.items(CancellationToken::new(), Arc::new(FaultBus::default()))).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name(), ".dirmeta");
    }

    #[tokio::test]
    async fn test_shared_item_fetches_permissions() {
        let mut store = MockStore::default();
        store.permissions.insert(
            "1".to_string(),
            Ok(vec![serde_json::from_value(serde_json::json!({
                "id": "p1",
                "roles": ["write"],
                "grantedTo": {"entityId": "u1", "email": "a@b.c", "entityType": "user"}
            }))
            .unwrap()]),
        );
        let mut coll = collection(store, false);
        let mut item = file("1", "https://u/1");
        item.shared = true;
        coll.add(item);

        let items = drain(coll.items(CancellationToken::new(), Arc::new(FaultBus::default()))).await;
        let meta = items.into_iter().find(|i| i.name() == "1.meta").unwrap();
        let (bytes, _) = meta.read_all().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["sharingMode"], "custom");
        assert_eq!(parsed["permissions"][0]["email"], "a@b.c");
    }

    #[tokio::test]
    async fn test_meta_not_found_drops_item_quietly() {
        let mut store = MockStore::default();
        store
            .permissions
            .insert("1".to_string(), Err(StoreError::NotFound("1".to_string())));
        store
            .permissions
            .insert("2".to_string(), Err(StoreError::Transport("reset".to_string())));
        let mut coll = collection(store, false);
        for id in ["1", "2"] {
            let mut item = file(id, "https://u");
            item.shared = true;
            coll.add(item);
        }

        let errs = Arc::new(FaultBus::default());
        let items = drain(coll.items(CancellationToken::new(), errs.clone())).await;

        assert!(items.is_empty());
        assert_eq!(errs.recovered().len(), 1);
    }

    #[tokio::test]
    async fn test_meta_modified_is_never_older_than_item() {
        let mut coll = collection(MockStore::default(), false);
        let future = Utc::now() + chrono::Duration::days(30);
        let mut item = file("1", "https://u/1");
        item.modified = Some(future);
        coll.add(item);

        let items = drain(coll.items(CancellationToken::new(), Arc::new(FaultBus::default()))).await;
        let meta = items.iter().find(|i| i.name() == "1.meta").unwrap();
        assert!(meta.modified() >= future);
    }

    #[tokio::test]
    async fn test_content_downloaded_lazily() {
        let store = MockStore::default().respond("https://u/1", vec![RawResponse::ok(b"abc".to_vec())]);
        let mut coll = collection(store, false);
        coll.add(file("1", "https://u/1"));

        let bytes = open_single_data(&coll, Arc::new(FaultBus::default()))
            .await
            .unwrap();
        assert_eq!(bytes, b"abc");
    }

    #[tokio::test]
    async fn test_expired_url_uses_url_cache() {
        let store = MockStore::default()
            .respond("https://u/1", vec![RawResponse::with_status(401)])
            .respond("https://cache/1", vec![RawResponse::ok(b"cached".to_vec())]);
        let mut coll = collection(store, false);
        coll.add(file("1", "https://u/1"));
        coll.set_url_cache(Arc::new(FixedLookup(Ok(ItemProps {
            download_url: "https://cache/1".to_string(),
            is_deleted: false,
        }))));

        let bytes = open_single_data(&coll, Arc::new(FaultBus::default()))
            .await
            .unwrap();
        assert_eq!(bytes, b"cached");
    }

    #[tokio::test]
    async fn test_cache_deleted_falls_back_to_item_refetch() {
        let mut store = MockStore::default()
            .respond("https://u/1", vec![RawResponse::with_status(401)])
            .respond("https://fresh/1", vec![RawResponse::ok(b"fresh".to_vec())]);
        store
            .items
            .insert("1".to_string(), file("1", "https://fresh/1"));
        let store = Arc::new(store);

        let mut coll = Collection::new(
            store.clone(),
            &drive(),
            Some(folder_path()),
            None,
            false,
            false,
            CollectionOptions::default(),
        )
        .unwrap();
        coll.add(file("1", "https://u/1"));
        coll.set_url_cache(Arc::new(FixedLookup(Ok(ItemProps {
            download_url: String::new(),
            is_deleted: true,
        }))));

        let bytes = open_single_data(&coll, Arc::new(FaultBus::default()))
            .await
            .unwrap();
        assert_eq!(bytes, b"fresh");
        assert_eq!(store.get_item_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malware_is_skipped() {
        let mut coll = collection(MockStore::default(), false);
        coll.add(file("1", "https://u/1").with_malware());

        let errs = Arc::new(FaultBus::default());
        let result = open_single_data(&coll, errs.clone()).await;

        let err = result.unwrap_err();
        assert!(matches!(err, ContentError::Malware(_)));
        assert!(err.is_skippable());
        assert_eq!(errs.skipped().len(), 1);
        assert_eq!(errs.skipped()[0].cause, SkipCause::Malware);
        assert!(errs.recovered().is_empty());
    }

    #[tokio::test]
    async fn test_not_found_is_deleted_in_flight() {
        let mut coll = collection(MockStore::default(), false);
        coll.add(file("1", "https://missing"));

        let errs = Arc::new(FaultBus::default());
        let err = open_single_data(&coll, errs.clone()).await.unwrap_err();

        assert!(matches!(err, ContentError::DeletedInFlight(_)));
        assert!(errs.recovered().is_empty());
        assert!(errs.skipped().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_package_content_is_skipped() {
        let store = MockStore::default().respond("https://u/1", vec![RawResponse::with_status(503)]);
        let mut coll = collection(store, true);
        coll.add(file("1", "https://u/1"));

        let errs = Arc::new(FaultBus::default());
        let err = open_single_data(&coll, errs.clone()).await.unwrap_err();

        assert!(matches!(err, ContentError::OneNote(_)));
        assert_eq!(errs.skipped()[0].cause, SkipCause::OneNote);
    }

    #[tokio::test]
    async fn test_unavailable_onenote_mime_is_skipped() {
        let store = MockStore::default().respond("https://u/1", vec![RawResponse::with_status(503)]);
        let mut coll = collection(store, false);
        let mut item = file("1", "https://u/1");
        item.mime_type = Some("Application/MSOneNote".to_string());
        coll.add(item);

        let err = open_single_data(&coll, Arc::new(FaultBus::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::OneNote(_)));
    }

    #[tokio::test]
    async fn test_unavailable_plain_content_is_recoverable() {
        let store = MockStore::default().respond("https://u/1", vec![RawResponse::with_status(503)]);
        let mut coll = collection(store, false);
        coll.add(file("1", "https://u/1"));

        let errs = Arc::new(FaultBus::default());
        let err = open_single_data(&coll, errs.clone()).await.unwrap_err();

        assert!(matches!(err, ContentError::Failed(_)));
        assert!(!err.is_skippable());
        assert_eq!(errs.recovered().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_collection_streams_nothing() {
        let statuses = Arc::new(AtomicUsize::new(0));
        let counter = statuses.clone();
        let options = CollectionOptions {
            status_updater: Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            ..CollectionOptions::default()
        };
        let coll = Collection::new(
            Arc::new(MockStore::default()),
            &drive(),
            None,
            Some(folder_path()),
            false,
            false,
            options,
        )
        .unwrap();

        assert_eq!(coll.state(), CollectionState::Deleted);
        let items = drain(coll.items(CancellationToken::new(), Arc::new(FaultBus::default()))).await;
        assert!(items.is_empty());
        assert_eq!(statuses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_stops_streaming() {
        let mut coll = collection(MockStore::default(), false);
        for i in 0..10 {
            coll.add(file(&i.to_string(), "https://u"));
        }

        let errs = Arc::new(FaultBus::default());
        errs.fail("stop");
        let items = drain(coll.items(CancellationToken::new(), errs)).await;
        assert!(items.is_empty());
    }
}
