//! Download URL cache
//!
//! Download URLs handed out by the drive expire after roughly an hour. When a
//! collection's first download attempt fails as unauthorized, it asks the
//! [`UrlCache`] for a fresh URL instead of fetching the item record again.
//! The cache is filled by one full delta scan of the drive with a minimal
//! field selection, and is rebuilt from scratch whenever it is empty or
//! older than its refresh interval.
//!
//! ## Locking
//!
//! Readers of a fresh cache share a read lock. A refresh holds an exclusive
//! lock for the whole scan, and concurrent callers that all find the cache
//! stale are serialized so that only one of them performs the scan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use drivesnap_core::domain::{DriveId, DriveItem};
use drivesnap_core::ports::{DriveSource, ItemFields};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shortest refresh interval accepted by [`UrlCache::new`]
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Default lifetime of a cache fill
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UrlCacheError {
    #[error("Invalid refresh interval: {0:?}")]
    InvalidRefreshInterval(Duration),

    #[error("Missing item ID")]
    MissingItemId,

    #[error("Item not found in URL cache: {0}")]
    NotFound(String),

    #[error("URL cache refresh failed: {0}")]
    Refresh(String),
}

/// Download properties of one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemProps {
    pub download_url: String,
    pub is_deleted: bool,
}

/// Lookup of fresh download properties by item ID
#[async_trait::async_trait]
pub trait ItemPropertyLookup: Send + Sync {
    /// # Errors
    /// Returns [`UrlCacheError::NotFound`] if the item is unknown, or the
    /// refresh error if the cache could not be filled
    async fn get_item_properties(&self, item_id: &str) -> Result<ItemProps, UrlCacheError>;
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, ItemProps>,
    last_refresh: Option<Instant>,
    refresh_count: usize,
}

/// Per-drive cache of download URLs
pub struct UrlCache {
    drive_id: DriveId,
    prev_delta_link: String,
    refresh_interval: Duration,
    source: Arc<dyn DriveSource>,
    state: RwLock<CacheState>,
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for UrlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlCache")
            .field("drive_id", &self.drive_id)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

impl UrlCache {
    /// Creates an empty cache for one drive.
    ///
    /// # Arguments
    /// * `drive_id` - The drive whose items are cached
    /// * `prev_delta_link` - Cursor every refresh scan starts from
    /// * `refresh_interval` - Lifetime of one fill
    /// * `source` - Source of the refresh delta scans
    ///
    /// # Errors
    /// Returns [`UrlCacheError::InvalidRefreshInterval`] if the interval is
    /// shorter than [`MIN_REFRESH_INTERVAL`]
    pub fn new(
        drive_id: DriveId,
        prev_delta_link: impl Into<String>,
        refresh_interval: Duration,
        source: Arc<dyn DriveSource>,
    ) -> Result<Self, UrlCacheError> {
        if refresh_interval < MIN_REFRESH_INTERVAL {
            return Err(UrlCacheError::InvalidRefreshInterval(refresh_interval));
        }

        Ok(Self {
            drive_id,
            prev_delta_link: prev_delta_link.into(),
            refresh_interval,
            source,
            state: RwLock::new(CacheState::default()),
            refresh_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn drive_id(&self) -> &DriveId {
        &self.drive_id
    }

    /// Number of refresh attempts so far, failed ones included.
    pub async fn refresh_count(&self) -> usize {
        self.state.read().await.refresh_count
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn needs_refresh(&self) -> bool {
        let state = self.state.read().await;
        Self::is_stale(&state, self.refresh_interval)
    }

    fn is_stale(state: &CacheState, interval: Duration) -> bool {
        match state.last_refresh {
            None => true,
            Some(_) if state.entries.is_empty() => true,
            Some(at) => at.elapsed() >= interval,
        }
    }

    async fn refresh(&self) -> Result<(), UrlCacheError> {
        let _refreshing = self.refresh_lock.lock().await;

        let mut state = self.state.write().await;

        // another caller may have refreshed while we waited
        if !Self::is_stale(&state, self.refresh_interval) {
            return Ok(());
        }

        state.entries.clear();
        state.last_refresh = None;
        state.refresh_count += 1;

        debug!(drive_id = %self.drive_id, "refreshing url cache");

        let mut pager =
            self.source
                .enumerate_items_delta(&self.drive_id, &self.prev_delta_link, ItemFields::UrlCache);

        while let Some(page) = pager.next_page().await {
            if page.reset {
                state.entries.clear();
            }

            for item in &page.items {
                Self::update_entry(&mut state.entries, item);
            }
        }

        pager.cancel();

        if let Err(e) = pager.results().await {
            state.entries.clear();
            warn!(drive_id = %self.drive_id, error = %e, "url cache refresh failed");
            return Err(UrlCacheError::Refresh(e.to_string()));
        }

        state.last_refresh = Some(Instant::now());

        info!(
            drive_id = %self.drive_id,
            num_entries = state.entries.len(),
            "url cache refreshed"
        );

        Ok(())
    }

    fn update_entry(entries: &mut HashMap<String, ItemProps>, item: &DriveItem) {
        if item.is_folder() {
            return;
        }

        let props = if item.deleted {
            ItemProps {
                download_url: String::new(),
                is_deleted: true,
            }
        } else {
            ItemProps {
                download_url: item.download_url.clone().unwrap_or_default(),
                is_deleted: false,
            }
        };

        entries.insert(item.id.clone(), props);
    }
}

#[async_trait::async_trait]
impl ItemPropertyLookup for UrlCache {
    async fn get_item_properties(&self, item_id: &str) -> Result<ItemProps, UrlCacheError> {
        if item_id.is_empty() {
            return Err(UrlCacheError::MissingItemId);
        }

        if self.needs_refresh().await {
            self.refresh().await?;
        }

        let state = self.state.read().await;
        state
            .entries
            .get(item_id)
            .cloned()
            .ok_or_else(|| UrlCacheError::NotFound(item_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivesnap_core::domain::ItemKind;
    use drivesnap_core::ports::{DeltaPage, DeltaPager, DeltaUpdate, Drive};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedPager {
        pages: Vec<DeltaPage>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl DeltaPager for ScriptedPager {
        async fn next_page(&mut self) -> Option<DeltaPage> {
            if self.pages.is_empty() {
                None
            } else {
                Some(self.pages.remove(0))
            }
        }

        fn cancel(&mut self) {
            self.pages.clear();
        }

        async fn results(&mut self) -> anyhow::Result<DeltaUpdate> {
            if self.fail {
                anyhow::bail!("delta query error");
            }
            Ok(DeltaUpdate {
                url: "next".to_string(),
                reset: false,
            })
        }
    }

    struct ScriptedSource {
        pages: Vec<DeltaPage>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(pages: Vec<DeltaPage>) -> Self {
            Self {
                pages,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl DriveSource for ScriptedSource {
        async fn list_drives(&self, _owner_id: &str) -> anyhow::Result<Vec<Drive>> {
            Ok(Vec::new())
        }

        async fn get_root_folder(&self, _drive_id: &DriveId) -> anyhow::Result<DriveItem> {
            Ok(DriveItem::new("root", "root", ItemKind::Root))
        }

        fn enumerate_items_delta(
            &self,
            _drive_id: &DriveId,
            _prev_delta_link: &str,
            fields: ItemFields,
        ) -> Box<dyn DeltaPager> {
            assert_eq!(fields, ItemFields::UrlCache);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::new(ScriptedPager {
                pages: self.pages.clone(),
                fail: self.fail,
            })
        }
    }

    fn file(id: &str, url: &str) -> DriveItem {
        DriveItem::new(id, id, ItemKind::File)
            .with_parent("root", "/drives/d1/root:")
            .with_download_url(url)
    }

    fn page(items: Vec<DriveItem>, reset: bool) -> DeltaPage {
        DeltaPage { items, reset }
    }

    fn cache(source: Arc<ScriptedSource>) -> UrlCache {
        UrlCache::new(
            DriveId::new("d1".to_string()).unwrap(),
            "",
            Duration::from_secs(3600),
            source,
        )
        .expect("valid cache")
    }

    #[test]
    fn test_rejects_short_refresh_interval() {
        let result = UrlCache::new(
            DriveId::new("d1".to_string()).unwrap(),
            "",
            Duration::from_millis(100),
            Arc::new(ScriptedSource::new(Vec::new())),
        );
        assert!(matches!(result, Err(UrlCacheError::InvalidRefreshInterval(_))));
    }

    #[tokio::test]
    async fn test_multiple_pages_with_reset() {
        let source = Arc::new(ScriptedSource::new(vec![
            page(vec![file("1", "https://old/1"), file("9", "https://gone")], false),
            page(vec![file("1", "https://new/1")], true),
            page(vec![file("2", "https://new/2")], false),
        ]));
        let cache = cache(source);

        let props = cache.get_item_properties("1").await.unwrap();
        assert_eq!(props.download_url, "https://new/1");
        assert!(!props.is_deleted);
        assert!(matches!(
            cache.get_item_properties("9").await,
            Err(UrlCacheError::NotFound(_))
        ));
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.refresh_count().await, 1);
    }

    #[tokio::test]
    async fn test_deleted_items_and_folders() {
        let source = Arc::new(ScriptedSource::new(vec![page(
            vec![
                file("1", "https://u/1"),
                DriveItem::new("1", "", ItemKind::File).with_deleted(),
                DriveItem::new("f", "folder", ItemKind::Folder).with_parent("root", ""),
            ],
            false,
        )]));
        let cache = cache(source);

        let props = cache.get_item_properties("1").await.unwrap();
        assert_eq!(props, ItemProps { download_url: String::new(), is_deleted: true });
        assert!(matches!(
            cache.get_item_properties("f").await,
            Err(UrlCacheError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_error_leaves_cache_empty() {
        let source = Arc::new(ScriptedSource {
            pages: vec![page(vec![file("1", "https://u/1")], false)],
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let cache = cache(source);

        assert!(matches!(
            cache.get_item_properties("1").await,
            Err(UrlCacheError::Refresh(_))
        ));
        assert!(cache.is_empty().await);
        assert_eq!(cache.refresh_count().await, 1);
        assert!(cache.state.read().await.last_refresh.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_refresh_once() {
        let source = Arc::new(ScriptedSource::new(vec![page(
            vec![file("1", "https://u/1"), file("2", "https://u/2")],
            false,
        )]));
        let cache = Arc::new(cache(source.clone()));

        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            let id = if i % 2 == 0 { "1" } else { "2" };
            handles.push(tokio::spawn(async move {
                cache.get_item_properties(id).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refresh_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cache_refreshes() {
        let source = Arc::new(ScriptedSource::new(vec![page(
            vec![file("1", "https://u/1")],
            false,
        )]));
        let cache = cache(source.clone());

        cache.get_item_properties("1").await.unwrap();
        cache.get_item_properties("1").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(3601)).await;

        cache.get_item_properties("1").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_item_id() {
        let cache = cache(Arc::new(ScriptedSource::new(Vec::new())));
        assert_eq!(
            cache.get_item_properties("").await,
            Err(UrlCacheError::MissingItemId)
        );
    }
}
