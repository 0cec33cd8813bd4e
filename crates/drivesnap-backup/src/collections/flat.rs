//! Flat-map reconciliation
//!
//! Items are reconciled one at a time as pages arrive. One collection is
//! kept per folder ID, and three maps carry the path bookkeeping of a pass:
//!
//! - **old previous paths** - folder ID -> path from the previous backup (read only)
//! - **current parents** - file ID -> parent folder ID seen so far in this pass
//! - **new previous paths** - folder ID -> path persisted for the next backup
//!
//! A reset page discards everything accumulated for the drive; the pass
//! then continues with the replacement pages as if it had started empty.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use drivesnap_core::domain::{BackupPath, DriveItem, FaultBus, SkipCause, Skipped};
use drivesnap_core::ports::{DeltaUpdate, Drive, ItemFields};
use tracing::{debug, info};

use super::{parse_prev_path, BackupContext, DriveReconciler, DriveResult};
use crate::collection::Collection;
use crate::limiter::LimiterStats;
use crate::metadata::{DATA_FILE_SUFFIX, META_FILE_SUFFIX};
use crate::BackupError;

/// Item-by-item reconciliation over flat maps
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatReconciler;

#[async_trait::async_trait]
impl DriveReconciler for FlatReconciler {
    fn name(&self) -> &'static str {
        "flat"
    }

    #[tracing::instrument(skip_all, fields(drive_id = %drive.id))]
    async fn reconcile(
        &self,
        ctx: &BackupContext,
        drive: &Drive,
        prev_paths: &HashMap<String, String>,
        prev_delta_link: &str,
        errs: &FaultBus,
    ) -> Result<DriveResult, BackupError> {
        let mut pass = FlatPass::new(ctx, drive, prev_paths, prev_delta_link, errs)?;
        let delta = pass.populate_drive_collections().await?;
        pass.finish(delta)
    }
}

// ============================================================================
// FlatPass
// ============================================================================

/// State of one drive's reconciliation
pub(crate) struct FlatPass<'a> {
    ctx: &'a BackupContext,
    drive: &'a Drive,
    errs: &'a FaultBus,
    drive_root: BackupPath,
    prev_delta_link: &'a str,
    old_prev_paths: &'a HashMap<String, String>,
    /// File ID -> parent folder ID, for files seen in this pass
    curr_parents: HashMap<String, String>,
    new_prev_paths: HashMap<String, String>,
    /// Current path -> folder ID that claimed it
    seen_folders: HashMap<String, String>,
    collections: HashMap<String, Collection>,
    excluded: HashSet<String>,
    package_paths: HashSet<BackupPath>,
    /// Either no previous delta link or the enumeration reset
    invalid_prev_delta: bool,
    stats: LimiterStats,
    /// Items queued or deleted since the last reset
    num_items: usize,
    hit_limit: bool,
}

impl<'a> FlatPass<'a> {
    pub(crate) fn new(
        ctx: &'a BackupContext,
        drive: &'a Drive,
        old_prev_paths: &'a HashMap<String, String>,
        prev_delta_link: &'a str,
        errs: &'a FaultBus,
    ) -> Result<Self, BackupError> {
        let invalid_prev_delta = prev_delta_link.is_empty();

        // With a valid cursor, folders the feed never mentions keep their paths.
        let new_prev_paths = if invalid_prev_delta {
            HashMap::new()
        } else {
            old_prev_paths.clone()
        };

        Ok(Self {
            ctx,
            drive,
            errs,
            drive_root: ctx.scope.drive_root(&drive.id)?,
            prev_delta_link,
            old_prev_paths,
            curr_parents: HashMap::new(),
            new_prev_paths,
            seen_folders: HashMap::new(),
            collections: HashMap::new(),
            excluded: HashSet::new(),
            package_paths: HashSet::new(),
            invalid_prev_delta,
            stats: LimiterStats::default(),
            num_items: 0,
            hit_limit: false,
        })
    }

    /// Consumes one delta enumeration of the drive.
    ///
    /// Per-item errors are recorded as recoverable; enumeration stops when
    /// the fault bus fails or a preview limit is reached.
    ///
    /// # Errors
    /// Returns error if the pager's final results fail or the fault bus
    /// recorded a failure
    pub(crate) async fn populate_drive_collections(&mut self) -> Result<DeltaUpdate, BackupError> {
        let mut pager = self.ctx.source.enumerate_items_delta(
            &self.drive.id,
            self.prev_delta_link,
            ItemFields::Backup,
        );

        while let Some(page) = pager.next_page().await {
            if self.errs.failure().is_some() {
                break;
            }

            if page.reset {
                info!(drive_id = %self.drive.id, "delta reset, discarding accumulated state");
                self.reset();
            }

            for item in &page.items {
                if self.errs.failure().is_some() || self.hit_limit {
                    break;
                }

                if let Err(e) = self.process_item(item) {
                    self.errs
                        .add_recoverable(format!("processing item {}: {e}", item.id));
                }
            }

            if !page.items.is_empty() {
                self.stats.pages += 1;
            }

            if self.hit_limit || self.ctx.limiter.at_page_limit(&self.stats) {
                info!(drive_id = %self.drive.id, stats = ?self.stats, "preview limit reached");
                break;
            }
        }

        pager.cancel();
        let delta = pager
            .results()
            .await
            .context("Failed to get delta results")?;

        if let Some(failure) = self.errs.failure() {
            return Err(BackupError::Failure(failure));
        }

        info!(
            drive_id = %self.drive.id,
            num_collections = self.collections.len(),
            num_items = self.num_items,
            stats = ?self.stats,
            "enumerated collection delta"
        );

        Ok(delta)
    }

    fn reset(&mut self) {
        self.new_prev_paths.clear();
        self.curr_parents.clear();
        self.seen_folders.clear();
        self.collections.clear();
        self.excluded.clear();
        self.package_paths.clear();
        self.stats = LimiterStats::default();
        self.num_items = 0;
        self.invalid_prev_delta = true;
    }

    /// Reconciles one delta item into the pass state.
    ///
    /// # Errors
    /// Returns error if the item's path cannot be built, a previous path is
    /// invalid, or a file arrives before its parent folder
    pub(crate) fn process_item(&mut self, item: &DriveItem) -> Result<(), BackupError> {
        if item.malware {
            let skip = if item.is_folder() {
                Skipped::container(SkipCause::Malware, self.drive.id.as_str(), &item.id, &item.name)
            } else {
                Skipped::file(SkipCause::Malware, self.drive.id.as_str(), &item.id, &item.name)
            };
            self.errs.add_skip(skip);
            return Ok(());
        }

        if item.deleted {
            return self.handle_delete(item);
        }

        let collection_path = self.collection_path(item)?;

        if self.ctx.should_skip(&collection_path, &self.drive.name) {
            debug!(item_id = %item.id, skipped_path = %collection_path, "path not selected");

            if item.is_folder() {
                update_path(&mut self.new_prev_paths, &item.id, &collection_path.to_string());
            }
            return Ok(());
        }

        if item.is_folder() {
            self.process_folder(item, collection_path)
        } else {
            self.process_file(item)
        }
    }

    /// The collection an item belongs to: the folder itself for folders,
    /// the parent folder for files.
    fn collection_path(&self, item: &DriveItem) -> Result<BackupPath, BackupError> {
        if item.is_root() {
            return Ok(self.drive_root.clone());
        }

        let parent_path = item
            .parent_path()
            .ok_or_else(|| BackupError::MissingParent(item.id.clone()))?;
        let parent = self.ctx.scope.path_from_parent_reference(parent_path)?;

        if item.is_folder() {
            Ok(parent.append(&item.name)?)
        } else {
            Ok(parent)
        }
    }

    fn process_folder(&mut self, item: &DriveItem, path: BackupPath) -> Result<(), BackupError> {
        let id = item.id.as_str();

        let mut prev_path = match self.old_prev_paths.get(id) {
            Some(raw) => Some(parse_prev_path(id, raw)?),
            // The root never moves.
            None if item.is_root() => Some(path.clone()),
            None => None,
        };

        // Subfolders of a moved folder get no delta entries of their own.
        let path_key = path.to_string();
        update_path(&mut self.new_prev_paths, id, &path_key);

        if self.update_collection_paths(item, &path) {
            return Ok(());
        }

        if self.ctx.limiter.at_container_limit(&self.stats) {
            self.hit_limit = true;
            return Ok(());
        }

        if item.is_package() {
            self.package_paths.insert(path.clone());
        }
        let child_of_package = self.package_paths.iter().any(|p| p.is_prefix_of(&path));

        // A path claimed twice in one pass means the folder was recreated;
        // the later folder wins and starts fresh.
        let mut collision = false;
        if let Some(other_id) = self.seen_folders.get(&path_key).cloned() {
            if other_id != id {
                debug!(folder_id = %id, evicted_folder_id = %other_id, path = %path_key, "folder path claimed twice");

                collision = true;
                prev_path = None;

                if let Some(evicted) = self.collections.remove(&other_id) {
                    self.stats.containers = self.stats.containers.saturating_sub(1);
                    if evicted.contains(&other_id) {
                        self.num_items = self.num_items.saturating_sub(1);
                    }
                }
                self.new_prev_paths.remove(&other_id);
            }
        }
        self.seen_folders.insert(path_key, id.to_string());

        let mut col = Collection::new(
            self.ctx.store.clone(),
            self.drive,
            Some(path),
            prev_path,
            item.is_package() || child_of_package,
            self.invalid_prev_delta || collision,
            self.ctx.options.clone(),
        )?;

        // The folder entry carries the folder's own permissions.
        if !item.is_root() && col.add(item.clone()) {
            self.num_items += 1;
        }

        self.collections.insert(id.to_string(), col);
        self.stats.containers += 1;

        Ok(())
    }

    /// Moves an already known folder collection, and every collection
    /// below it, to `curr`. Returns true if the folder was known.
    fn update_collection_paths(&mut self, item: &DriveItem, curr: &BackupPath) -> bool {
        let id = item.id.as_str();

        let Some(col) = self.collections.get_mut(id) else {
            return false;
        };

        let Some(initial) = col.full_path().cloned() else {
            // Deleted earlier in this pass and now back.
            col.set_full_path(Some(curr.clone()));
            if !item.is_root() && col.add(item.clone()) {
                self.num_items += 1;
            }
            return true;
        };

        if &initial == curr {
            return true;
        }

        col.set_full_path(Some(curr.clone()));

        for (other_id, other) in &mut self.collections {
            if other_id == id {
                continue;
            }
            let Some(mut path) = other.full_path().cloned() else {
                continue;
            };
            if path.update_parent(&initial, curr) {
                other.set_full_path(Some(path));
            }
        }

        true
    }

    fn process_file(&mut self, item: &DriveItem) -> Result<(), BackupError> {
        let id = item.id.as_str();

        let parent_id = item
            .parent_id()
            .ok_or_else(|| BackupError::MissingParent(id.to_string()))?
            .to_string();

        let Some(parent) = self.collections.get(&parent_id) else {
            return Err(BackupError::ItemBeforeParent {
                item_id: id.to_string(),
                parent_id,
            });
        };

        let prev_parent = self.curr_parents.get(id).cloned();

        if prev_parent.is_none() {
            let limiter = &self.ctx.limiter;

            if limiter.at_container_items_limit(parent.file_count())
                || limiter.at_item_limit(&self.stats)
            {
                debug!(item_id = %id, parent_id = %parent_id, "collection full, skipping file");
                return Ok(());
            }

            let prospective = LimiterStats {
                bytes: self.stats.bytes + item.size,
                ..self.stats
            };
            if limiter.at_byte_limit(&prospective) {
                debug!(item_id = %id, size = item.size, "file exceeds byte budget, skipping");
                return Ok(());
            }
        }

        // Moved more than once within this delta: drop it from where it was.
        if let Some(prev_parent) = prev_parent.filter(|p| *p != parent_id) {
            if let Some(prev_col) = self.collections.get_mut(&prev_parent) {
                if !prev_col.remove(id) {
                    return Err(BackupError::MovedItemNotFound(id.to_string()));
                }
            }
        }

        self.curr_parents.insert(id.to_string(), parent_id.clone());

        if let Some(col) = self.collections.get_mut(&parent_id) {
            if col.add(item.clone()) {
                self.num_items += 1;
                self.stats.files += 1;
                self.stats.bytes += item.size;
            }
        }

        // The file may have been renamed, moved, or modified, so the base
        // backup's copy is always replaced.
        if !self.invalid_prev_delta {
            self.excluded.insert(format!("{id}{DATA_FILE_SUFFIX}"));
            self.excluded.insert(format!("{id}{META_FILE_SUFFIX}"));
        }

        Ok(())
    }

    fn handle_delete(&mut self, item: &DriveItem) -> Result<(), BackupError> {
        let id = item.id.as_str();

        if !item.is_folder() {
            // Created and deleted within this delta.
            if let Some(parent_id) = self.curr_parents.remove(id) {
                if let Some(col) = self.collections.get_mut(&parent_id) {
                    col.remove(id);
                }
            }

            if self.invalid_prev_delta {
                return Ok(());
            }

            self.excluded.insert(format!("{id}{DATA_FILE_SUFFIX}"));
            self.excluded.insert(format!("{id}{META_FILE_SUFFIX}"));
            self.num_items += 1;

            return Ok(());
        }

        let prev_path = self
            .old_prev_paths
            .get(id)
            .map(|raw| parse_prev_path(id, raw))
            .transpose()?;

        // Nested folders get delete entries of their own.
        self.new_prev_paths.remove(id);

        let Some(prev_path) = prev_path.filter(|_| !self.invalid_prev_delta) else {
            // Never backed up, or the set difference in `finish` covers it.
            if let Some(removed) = self.collections.remove(id) {
                if removed.full_path().is_some() {
                    self.stats.containers = self.stats.containers.saturating_sub(1);
                }
            }
            return Ok(());
        };

        let col = Collection::new(
            self.ctx.store.clone(),
            self.drive,
            None,
            Some(prev_path),
            false,
            false,
            self.ctx.options.clone(),
        )?;

        if let Some(replaced) = self.collections.insert(id.to_string(), col) {
            if replaced.full_path().is_some() {
                self.stats.containers = self.stats.containers.saturating_sub(1);
            }
        }

        Ok(())
    }

    /// Produces the drive's result.
    ///
    /// Without a trustworthy cursor every previously known folder the
    /// enumeration did not mention becomes a deleted collection.
    pub(crate) fn finish(self, delta: DeltaUpdate) -> Result<DriveResult, BackupError> {
        let full_enumeration = self.invalid_prev_delta || delta.reset;
        let mut collections = self.collections;

        if full_enumeration {
            let mut unseen: Vec<(&String, &String)> = self
                .old_prev_paths
                .iter()
                .filter(|(id, _)| !collections.contains_key(*id))
                .collect();
            unseen.sort();

            for (id, raw) in unseen {
                let prev = parse_prev_path(id, raw)?;
                let col = Collection::new(
                    self.ctx.store.clone(),
                    self.drive,
                    None,
                    Some(prev),
                    false,
                    true,
                    self.ctx.options.clone(),
                )?;
                collections.insert(id.clone(), col);
            }
        }

        let url_cache = self
            .ctx
            .url_cache_for(self.drive, self.prev_delta_link, self.num_items)?;

        let mut entries: Vec<(String, Collection)> = collections.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let collections = entries
            .into_iter()
            .map(|(_, mut col)| {
                if let Some(cache) = &url_cache {
                    col.set_url_cache(cache.clone());
                }
                col
            })
            .collect();

        Ok(DriveResult {
            collections,
            new_prev_paths: self.new_prev_paths,
            delta,
            excluded: (!full_enumeration).then_some(self.excluded),
        })
    }
}

/// Records `new_path` for `id`. When the folder already had a different
/// path, every entry at or below the old path is rewritten too.
pub(crate) fn update_path(paths: &mut HashMap<String, String>, id: &str, new_path: &str) {
    let Some(curr) = paths.get(id).cloned() else {
        paths.insert(id.to_string(), new_path.to_string());
        return;
    };

    if curr == new_path {
        return;
    }

    let nested = format!("{curr}/");
    for path in paths.values_mut() {
        if *path == curr {
            *path = new_path.to_string();
        } else if let Some(rest) = path.strip_prefix(&nested) {
            *path = format!("{new_path}/{rest}");
        }
    }
}
