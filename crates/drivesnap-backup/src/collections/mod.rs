//! Collections orchestrator
//!
//! [`Collections`] turns every drive of one owner into backup collections.
//! For each drive it loads the previous backup's metadata, hands the
//! drive's delta feed to a [`DriveReconciler`], and gathers the results.
//!
//! ## Flow of one backup
//!
//! 1. Read delta links and previous paths from the previous backup
//! 2. List drives; each drive is reconciled independently
//! 3. Record the new delta link, previous paths, and exclusions per drive
//! 4. Drives missing from the listing become tombstones
//! 5. A single metadata collection persists state for the next run
//!
//! ## Strategies
//!
//! - [`TreeReconciler`] accumulates the feed in a [`DeltaTree`](crate::delta_tree::DeltaTree)
//!   and flattens it once enumeration converges (default)
//! - [`FlatReconciler`] reconciles item by item with flat maps

mod flat;
mod tree;

pub use flat::FlatReconciler;
pub use tree::{TreeFlow, TreeReconciler};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drivesnap_core::config::Config;
use drivesnap_core::domain::{BackupPath, Category, DriveId, FaultBus, ResourceScope};
use drivesnap_core::ports::{DeltaUpdate, DirScope, Drive, DriveSource, ItemStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collection::{
    BackupItem, Collection, CollectionOptions, CollectionState, StatusUpdater, TombstoneCollection,
};
use crate::excludes::ExcludeSet;
use crate::extensions::factories_from_names;
use crate::limiter::Limiter;
use crate::metadata::{
    alert_if_prev_paths_have_collisions, deserialize_and_validate_metadata,
    make_metadata_collection, DeltaLinks, MetadataCollection, PreviousPaths,
};
use crate::url_cache::UrlCache;
use crate::BackupError;

/// SharePoint library drive that is never backed up
pub const RESTRICTED_DIRECTORY: &str = "Site Pages";

// ============================================================================
// BackupCollection
// ============================================================================

/// Anything the orchestrator hands to the backup store
#[derive(Debug)]
pub enum BackupCollection {
    /// A live, moved, or deleted folder of a drive
    Drive(Collection),
    /// A drive that no longer exists
    Tombstone(TombstoneCollection),
    /// Delta links and previous paths for the next run
    Metadata(MetadataCollection),
}

impl BackupCollection {
    /// Current location; `None` for deleted folders and drives.
    #[must_use]
    pub fn full_path(&self) -> Option<&BackupPath> {
        match self {
            Self::Drive(c) => c.full_path(),
            Self::Tombstone(_) => None,
            Self::Metadata(m) => Some(m.full_path()),
        }
    }

    #[must_use]
    pub fn previous_path(&self) -> Option<&BackupPath> {
        match self {
            Self::Drive(c) => c.previous_path(),
            Self::Tombstone(t) => Some(t.previous_path()),
            Self::Metadata(_) => None,
        }
    }

    #[must_use]
    pub fn state(&self) -> CollectionState {
        match self {
            Self::Drive(c) => c.state(),
            Self::Tombstone(_) => CollectionState::Deleted,
            Self::Metadata(_) => CollectionState::New,
        }
    }

    #[must_use]
    pub fn do_not_merge_items(&self) -> bool {
        match self {
            Self::Drive(c) => c.do_not_merge_items(),
            Self::Tombstone(t) => t.do_not_merge_items(),
            Self::Metadata(_) => false,
        }
    }

    /// Streams the collection's items. Tombstones yield nothing.
    pub fn items(&self, cancel: CancellationToken, errs: Arc<FaultBus>) -> mpsc::Receiver<BackupItem> {
        match self {
            Self::Drive(c) => c.items(cancel, errs),
            Self::Tombstone(_) => {
                let (_tx, rx) = mpsc::channel(1);
                rx
            }
            Self::Metadata(m) => m.items(),
        }
    }

    #[must_use]
    pub fn as_drive(&self) -> Option<&Collection> {
        match self {
            Self::Drive(c) => Some(c),
            _ => None,
        }
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Everything a reconciler needs besides the drive itself
pub struct BackupContext {
    pub source: Arc<dyn DriveSource>,
    pub store: Arc<dyn ItemStore>,
    pub scope: ResourceScope,
    pub selector: Arc<dyn DirScope>,
    pub limiter: Limiter,
    pub options: CollectionOptions,
    /// Drives below this count get a URL cache
    pub url_cache_threshold: usize,
    pub url_cache_refresh: Duration,
    /// Upper bound on consecutive delta queries of the tree strategy
    pub max_delta_queries: u32,
}

impl std::fmt::Debug for BackupContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupContext")
            .field("scope", &self.scope)
            .field("limiter", &self.limiter)
            .field("options", &self.options)
            .field("url_cache_threshold", &self.url_cache_threshold)
            .field("max_delta_queries", &self.max_delta_queries)
            .finish_non_exhaustive()
    }
}

impl BackupContext {
    /// True when a folder must be left out of the backup.
    ///
    /// The drive root is always selected under an all-pass selector.
    /// Paths that are not drive folder paths are never skipped.
    pub(crate) fn should_skip(&self, path: &BackupPath, drive_name: &str) -> bool {
        if path.category() == Category::Libraries && drive_name == RESTRICTED_DIRECTORY {
            return true;
        }

        let folder = match path.drive_folder_path() {
            Ok(folder) => folder,
            Err(e) => {
                warn!(error = %e, "getting drive folder path");
                return false;
            }
        };

        if folder.is_empty() && self.selector.is_all_pass() {
            return false;
        }

        !self.selector.includes_dir(&folder)
    }

    /// Builds the URL cache shared by a drive's collections, if the drive is
    /// small enough.
    ///
    /// `size` is the strategy's measure of the drive; `prev_delta_link` is the
    /// cursor the backup started from.
    pub(crate) fn url_cache_for(
        &self,
        drive: &Drive,
        prev_delta_link: &str,
        size: usize,
    ) -> Result<Option<Arc<UrlCache>>, BackupError> {
        if size >= self.url_cache_threshold {
            debug!(drive_id = %drive.id, size, "drive too large for url cache");
            return Ok(None);
        }

        info!(drive_id = %drive.id, size, "adding url cache for drive collections");

        let cache = UrlCache::new(
            drive.id.clone(),
            prev_delta_link,
            self.url_cache_refresh,
            self.source.clone(),
        )?;

        Ok(Some(Arc::new(cache)))
    }
}

/// What reconciling one drive produced
#[derive(Debug, Default)]
pub struct DriveResult {
    pub collections: Vec<Collection>,
    /// Folder ID -> path, persisted for the next run
    pub new_prev_paths: HashMap<String, String>,
    pub delta: DeltaUpdate,
    /// Base-backup entries to drop; `None` when enumeration reset
    pub excluded: Option<HashSet<String>>,
}

/// Strategy turning one drive's delta feed into collections
#[async_trait::async_trait]
pub trait DriveReconciler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Reconciles one drive against its previous backup state.
    ///
    /// # Arguments
    /// * `ctx` - Ports, selection, limits, and collection options
    /// * `drive` - The drive to enumerate
    /// * `prev_paths` - Folder ID -> path from the previous backup
    /// * `prev_delta_link` - Cursor from the previous backup; empty for a full enumeration
    /// * `errs` - Fault bus of the run
    async fn reconcile(
        &self,
        ctx: &BackupContext,
        drive: &Drive,
        prev_paths: &HashMap<String, String>,
        prev_delta_link: &str,
        errs: &FaultBus,
    ) -> Result<DriveResult, BackupError>;
}

/// Parses a stored previous path.
pub(crate) fn parse_prev_path(folder_id: &str, raw: &str) -> Result<BackupPath, BackupError> {
    raw.parse()
        .map_err(|_| BackupError::InvalidPreviousPath {
            folder_id: folder_id.to_string(),
            path: raw.to_string(),
        })
}

// ============================================================================
// Collections
// ============================================================================

/// Per-backup orchestrator over all drives of one owner
pub struct Collections {
    ctx: BackupContext,
    reconciler: Box<dyn DriveReconciler>,
}

impl Collections {
    /// Creates an orchestrator from the backup configuration.
    ///
    /// # Errors
    /// Returns error if a configured item extension is unknown
    pub fn new(
        source: Arc<dyn DriveSource>,
        store: Arc<dyn ItemStore>,
        scope: ResourceScope,
        selector: Arc<dyn DirScope>,
        config: &Config,
    ) -> Result<Self, BackupError> {
        let options = CollectionOptions {
            item_parallelism: config.backup.item_parallelism,
            extensions: factories_from_names(&config.backup.extensions)?,
            ..CollectionOptions::default()
        };

        let reconciler: Box<dyn DriveReconciler> = if config.backup.use_delta_tree {
            Box::new(TreeReconciler)
        } else {
            Box::new(FlatReconciler)
        };

        Ok(Self {
            ctx: BackupContext {
                source,
                store,
                scope,
                selector,
                limiter: Limiter::new(&config.preview),
                options,
                url_cache_threshold: config.url_cache.drive_item_threshold,
                url_cache_refresh: Duration::from_secs(config.url_cache.refresh_interval_secs),
                max_delta_queries: config.backup.max_delta_queries,
            },
            reconciler,
        })
    }

    /// Replaces the status updater handed to every collection.
    #[must_use]
    pub fn with_status_updater(mut self, updater: StatusUpdater) -> Self {
        self.ctx.options.status_updater = updater;
        self
    }

    /// Replaces the reconciliation strategy.
    #[must_use]
    pub fn with_reconciler(mut self, reconciler: Box<dyn DriveReconciler>) -> Self {
        self.reconciler = reconciler;
        self
    }

    #[must_use]
    pub fn context(&self) -> &BackupContext {
        &self.ctx
    }

    /// Produces every collection of the backup.
    ///
    /// Returns the collections and whether the previous backup's metadata
    /// could be used. Excluded base-backup entries are added to `excludes`
    /// under each drive's root path.
    ///
    /// # Errors
    /// Returns error if drives cannot be listed, a drive cannot be
    /// reconciled, or the fault bus records a failure
    #[tracing::instrument(skip_all, fields(owner = %self.ctx.scope.owner_id(), strategy = self.reconciler.name()))]
    pub async fn get(
        &self,
        prev_metadata: &[MetadataCollection],
        excludes: &mut ExcludeSet,
        errs: &FaultBus,
    ) -> Result<(Vec<BackupCollection>, bool), BackupError> {
        let (deltas, prev_paths, can_use_prev_backup) =
            deserialize_and_validate_metadata(prev_metadata, errs);

        info!(
            can_use_previous_backup = can_use_prev_backup,
            num_prev_deltas = deltas.len(),
            num_prev_drives = prev_paths.len(),
            "previous backup metadata loaded"
        );

        let mut drive_tombstones: HashSet<String> = prev_paths.keys().cloned().collect();

        let drives = self
            .ctx
            .source
            .list_drives(self.ctx.scope.owner_id())
            .await
            .context("Failed to list drives")?;

        let mut collections = Vec::new();
        let mut new_deltas = DeltaLinks::new();
        let mut new_prev_paths = PreviousPaths::new();
        let empty = HashMap::new();

        for drive in &drives {
            if let Some(failure) = errs.failure() {
                return Err(BackupError::Failure(failure));
            }

            let drive_id = drive.id.as_str();
            drive_tombstones.remove(drive_id);

            let old_prev_paths = prev_paths.get(drive_id).unwrap_or(&empty);
            let prev_delta_link = deltas.get(drive_id).map(String::as_str).unwrap_or("");

            info!(
                drive_id = %drive_id,
                num_paths_entries = old_prev_paths.len(),
                has_prev_delta = !prev_delta_link.is_empty(),
                "previous metadata for drive"
            );

            let result = self
                .reconciler
                .reconcile(&self.ctx, drive, old_prev_paths, prev_delta_link, errs)
                .await?;

            if !result.delta.url.is_empty() {
                new_deltas.insert(drive_id.to_string(), result.delta.url.clone());
            }

            info!(
                drive_id = %drive_id,
                num_new_paths_entries = result.new_prev_paths.len(),
                num_collections = result.collections.len(),
                delta_reset = result.delta.reset,
                "persisted metadata for drive"
            );

            // Always recorded, even when empty, so the next run keeps the delta link.
            new_prev_paths.insert(drive_id.to_string(), result.new_prev_paths);

            if let Some(excluded) = result.excluded.filter(|e| !e.is_empty()) {
                excludes.add(&self.ctx.scope.drive_root(&drive.id)?, excluded);
            }

            collections.extend(result.collections.into_iter().map(BackupCollection::Drive));
        }

        if let Some(failure) = errs.failure() {
            return Err(BackupError::Failure(failure));
        }

        alert_if_prev_paths_have_collisions(&new_prev_paths, errs);

        collections.extend(self.make_drive_tombstones(drive_tombstones, errs));

        match self.make_metadata_collection(&new_prev_paths, &new_deltas) {
            Ok(md) => collections.push(BackupCollection::Metadata(md)),
            Err(e) => {
                warn!(error = %e, "making metadata collection for future incremental backups");
            }
        }

        info!(count_collections = collections.len(), "produced collections");

        Ok((collections, can_use_prev_backup))
    }

    fn make_drive_tombstones(
        &self,
        drive_ids: HashSet<String>,
        errs: &FaultBus,
    ) -> Vec<BackupCollection> {
        let mut drive_ids: Vec<String> = drive_ids.into_iter().collect();
        drive_ids.sort();

        let mut tombstones = Vec::with_capacity(drive_ids.len());

        for drive_id in drive_ids {
            let prefix = DriveId::new(drive_id.clone())
                .and_then(|id| self.ctx.scope.drive_prefix(&id));

            match prefix {
                Ok(prefix) => {
                    info!(drive_id = %drive_id, "drive removed since last backup");
                    tombstones.push(BackupCollection::Tombstone(TombstoneCollection::new(
                        prefix, true,
                    )));
                }
                Err(e) => {
                    errs.add_recoverable(format!(
                        "making drive tombstone for previous path of {drive_id}: {e}"
                    ));
                }
            }
        }

        tombstones
    }

    fn make_metadata_collection(
        &self,
        prev_paths: &PreviousPaths,
        deltas: &DeltaLinks,
    ) -> Result<MetadataCollection, BackupError> {
        let prefix = self.ctx.scope.metadata_prefix()?;
        Ok(make_metadata_collection(prefix, prev_paths, deltas)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NoDrives, NoStore};
    use drivesnap_core::domain::Service;
    use drivesnap_core::ports::{AllPass, GlobScope};

    fn scope(category: Category) -> ResourceScope {
        ResourceScope::new("tenant", "user", Service::OneDrive, category).unwrap()
    }

    fn collections(selector: Arc<dyn DirScope>, category: Category) -> Collections {
        Collections::new(
            Arc::new(NoDrives),
            Arc::new(NoStore),
            scope(category),
            selector,
            &Config::default(),
        )
        .unwrap()
    }

    fn drive_path(category: Category, folders: &[&str]) -> BackupPath {
        let mut path = scope(category)
            .drive_root(&DriveId::new("d1".to_string()).unwrap())
            .unwrap();
        for folder in folders {
            path = path.append(folder).unwrap();
        }
        path
    }

    #[test]
    fn test_should_skip_all_pass_root() {
        let c = collections(Arc::new(AllPass), Category::Files);
        assert!(!c.context().should_skip(&drive_path(Category::Files, &[]), "OneDrive"));
        assert!(!c.context().should_skip(&drive_path(Category::Files, &["a"]), "OneDrive"));
    }

    #[test]
    fn test_should_skip_unselected_folder() {
        let selector = GlobScope::new(&["Documents"]).unwrap();
        let c = collections(Arc::new(selector), Category::Files);

        assert!(c.context().should_skip(&drive_path(Category::Files, &[]), "OneDrive"));
        assert!(c.context().should_skip(&drive_path(Category::Files, &["Pictures"]), "OneDrive"));
        assert!(!c
            .context()
            .should_skip(&drive_path(Category::Files, &["Documents", "Taxes"]), "OneDrive"));
    }

    #[test]
    fn test_should_skip_site_pages() {
        let c = collections(Arc::new(AllPass), Category::Libraries);
        assert!(c
            .context()
            .should_skip(&drive_path(Category::Libraries, &["a"]), RESTRICTED_DIRECTORY));
        assert!(!c
            .context()
            .should_skip(&drive_path(Category::Libraries, &["a"]), "Documents"));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let mut config = Config::default();
        config.backup.extensions = vec!["crc32".to_string()];

        let result = Collections::new(
            Arc::new(NoDrives),
            Arc::new(NoStore),
            scope(Category::Files),
            Arc::new(AllPass),
            &config,
        );
        assert!(matches!(result, Err(BackupError::Extension(_))));
    }

    #[tokio::test]
    async fn test_get_without_drives_emits_metadata() {
        let c = collections(Arc::new(AllPass), Category::Files);
        let errs = FaultBus::default();
        let mut excludes = ExcludeSet::new();

        let (cols, can_use) = c.get(&[], &mut excludes, &errs).await.unwrap();

        assert!(can_use);
        assert_eq!(cols.len(), 1);
        assert!(matches!(cols[0], BackupCollection::Metadata(_)));
        assert_eq!(cols[0].state(), CollectionState::New);
        assert!(excludes.is_empty());
    }

    #[tokio::test]
    async fn test_get_tombstones_missing_drives() {
        let c = collections(Arc::new(AllPass), Category::Files);
        let errs = FaultBus::default();
        let mut excludes = ExcludeSet::new();

        let prev_root = drive_path(Category::Files, &[]);
        let prevs: PreviousPaths = HashMap::from([(
            "d1".to_string(),
            HashMap::from([("root".to_string(), prev_root.to_string())]),
        )]);
        let prev_md = make_metadata_collection(
            scope(Category::Files).metadata_prefix().unwrap(),
            &prevs,
            &DeltaLinks::from([("d1".to_string(), "delta-1".to_string())]),
        )
        .unwrap();

        let (cols, _) = c.get(&[prev_md], &mut excludes, &errs).await.unwrap();

        let tombstone = cols
            .iter()
            .find(|c| matches!(c, BackupCollection::Tombstone(_)))
            .expect("drive tombstone");
        assert_eq!(tombstone.state(), CollectionState::Deleted);
        assert!(tombstone.full_path().is_none());
        assert_eq!(
            tombstone.previous_path().unwrap().folders(),
            &["drives".to_string(), "d1".to_string()]
        );
        assert!(tombstone.do_not_merge_items());
    }

    #[tokio::test]
    async fn test_tombstone_items_are_empty() {
        let prefix = drive_path(Category::Files, &[]);
        let col = BackupCollection::Tombstone(TombstoneCollection::new(prefix, true));

        let mut rx = col.items(CancellationToken::new(), Arc::new(FaultBus::default()));
        assert!(rx.recv().await.is_none());
    }
}
