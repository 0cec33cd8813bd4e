//! Tree-based reconciliation
//!
//! The whole delta feed of a drive is accumulated in a [`DeltaTree`]
//! first; collections are only derived once enumeration has converged.
//! Enumeration repeats delta queries from the newest cursor until a query
//! reports no changes, so items that changed while the drive was being
//! enumerated are picked up before the tree is flattened.
//!
//! A backup without a previous cursor is treated like a reset: every
//! folder the previous backup knew and the feed no longer mentions is
//! tombstoned.

use std::collections::HashMap;

use anyhow::Context;
use drivesnap_core::domain::{BackupPath, DriveItem, FaultBus, ItemKind, SkipCause, Skipped};
use drivesnap_core::ports::{DeltaUpdate, Drive, ItemFields};
use tracing::{debug, info};

use super::{parse_prev_path, BackupContext, DriveReconciler, DriveResult};
use crate::collection::Collection;
use crate::delta_tree::{Collectable, DeltaTree};
use crate::limiter::LimiterStats;
use crate::BackupError;

/// Outcome of offering one item to the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeFlow {
    /// Keep enumerating
    Continue,
    /// The item was left out and must be reported
    Skipped(Skipped),
    /// The item's folder is full; later items may still fit elsewhere
    CollectionFull,
    /// A preview limit was hit; stop enumerating the drive
    LimitReached,
}

/// Reconciliation through an in-memory [`DeltaTree`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeReconciler;

#[async_trait::async_trait]
impl DriveReconciler for TreeReconciler {
    fn name(&self) -> &'static str {
        "tree"
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
        let prefix = ctx.scope.drive_root(&drive.id)?;

        let mut root = ctx
            .source
            .get_root_folder(&drive.id)
            .await
            .context("Failed to get root folder")?;
        root.kind = ItemKind::Root;

        let mut tree = DeltaTree::new(prefix);
        if prev_delta_link.is_empty() {
            tree.reset();
        }
        tree.set_folder(&root)?;

        let (delta, page_count) =
            populate_tree(ctx, &mut tree, drive, &root, prev_delta_link, errs).await?;

        add_prev_paths_to_tree(&mut tree, prev_paths, errs)?;

        let (collections, new_prev_paths) =
            turn_tree_into_collections(ctx, &tree, drive, prev_paths, prev_delta_link, page_count)?;

        let excluded = (!tree.had_reset()).then(|| tree.generate_exclude_item_ids());

        Ok(DriveResult {
            collections,
            new_prev_paths,
            delta: DeltaUpdate {
                url: delta.url,
                reset: tree.had_reset(),
            },
            excluded,
        })
    }
}

// ============================================================================
// Enumeration
// ============================================================================

/// Fills `tree` from repeated delta queries.
///
/// Returns the final cursor and the number of pages that carried items,
/// counted across all queries since the last reset.
///
/// # Errors
/// Returns error if a pager's results fail, enumeration does not converge
/// within the configured number of queries, or the fault bus fails
pub(crate) async fn populate_tree(
    ctx: &BackupContext,
    tree: &mut DeltaTree,
    drive: &Drive,
    root: &DriveItem,
    prev_delta_link: &str,
    errs: &FaultBus,
) -> Result<(DeltaUpdate, usize), BackupError> {
    let mut curr_delta_link = prev_delta_link.to_string();
    let mut delta = DeltaUpdate::default();
    let mut queries: u32 = 0;
    let mut pages_with_items: usize = 0;
    let mut hit_limit = false;
    let mut finished = false;

    while !hit_limit && !finished && errs.failure().is_none() {
        queries += 1;

        // Per query, to tell "no changes" apart from a quiet final page.
        let mut query_pages: usize = 0;
        let mut query_items: usize = 0;

        let mut pager =
            ctx.source
                .enumerate_items_delta(&drive.id, &curr_delta_link, ItemFields::Backup);

        while let Some(page) = pager.next_page().await {
            if errs.failure().is_some() {
                break;
            }

            query_pages += 1;

            if page.reset {
                info!(drive_id = %drive.id, "delta reset, rebuilding tree");

                tree.reset();
                tree.set_folder(root)?;
                pages_with_items = 0;
                query_pages = 1;
                query_items = 0;
            }

            if enumerate_page_of_items(ctx, tree, drive, &page.items, errs) == TreeFlow::LimitReached
            {
                hit_limit = true;
                break;
            }

            query_items += page.items.len();
            if !page.items.is_empty() {
                pages_with_items += 1;
            }

            let stats = LimiterStats {
                pages: pages_with_items,
                ..LimiterStats::default()
            };
            if ctx.limiter.at_page_limit(&stats) {
                hit_limit = true;
                break;
            }
        }

        pager.cancel();
        delta = pager
            .results()
            .await
            .context("Failed to get delta results")?;

        curr_delta_link = delta.url.clone();

        // A query always yields at least one, possibly empty, page.
        finished = query_pages < 2 && query_items == 0;

        debug!(
            drive_id = %drive.id,
            query = queries,
            query_pages,
            query_items,
            finished,
            "delta query processed"
        );

        if !finished && !hit_limit && queries >= ctx.max_delta_queries {
            return Err(BackupError::InconsistentDelta(ctx.max_delta_queries));
        }
    }

    if let Some(failure) = errs.failure() {
        return Err(BackupError::Failure(failure));
    }

    let (num_files, num_bytes) = tree.count_live_files_and_sizes();
    info!(
        drive_id = %drive.id,
        queries,
        pages_with_items,
        live_folders = tree.count_live_folders(),
        tombstones = tree.count_tombstones(),
        num_files,
        num_bytes,
        hit_limit,
        "enumerated collection delta"
    );

    Ok((delta, pages_with_items))
}

/// Offers every item of one page to the tree.
///
/// Skips and recoverable errors go to the fault bus; only a hit preview
/// limit is returned.
fn enumerate_page_of_items(
    ctx: &BackupContext,
    tree: &mut DeltaTree,
    drive: &Drive,
    items: &[DriveItem],
    errs: &FaultBus,
) -> TreeFlow {
    for item in items {
        if errs.failure().is_some() {
            break;
        }

        let flow = if item.is_folder() {
            add_folder_to_tree(ctx, tree, drive, item)
        } else {
            add_file_to_tree(ctx, tree, drive, item)
        };

        match flow {
            Ok(TreeFlow::Continue | TreeFlow::CollectionFull) => {}
            Ok(TreeFlow::Skipped(skip)) => errs.add_skip(skip),
            Ok(TreeFlow::LimitReached) => return TreeFlow::LimitReached,
            Err(e) => errs.add_recoverable(format!("adding item {} to tree: {e}", item.id)),
        }
    }

    TreeFlow::Continue
}

/// Applies one folder event to the tree.
///
/// Folders rejected by the directory selector are still inserted so their
/// descendants can link, but they are flagged and yield no collection.
///
/// # Errors
/// Returns error if the folder's path cannot be built or the tree rejects it
pub(crate) fn add_folder_to_tree(
    ctx: &BackupContext,
    tree: &mut DeltaTree,
    drive: &Drive,
    folder: &DriveItem,
) -> Result<TreeFlow, BackupError> {
    if !tree.contains_folder(&folder.id) {
        let stats = LimiterStats {
            containers: tree.count_live_folders(),
            ..LimiterStats::default()
        };
        if ctx.limiter.at_container_limit(&stats) {
            return Ok(TreeFlow::LimitReached);
        }
    }

    if folder.malware {
        info!(item_id = %folder.id, "malware folder detected");
        return Ok(TreeFlow::Skipped(Skipped::container(
            SkipCause::Malware,
            drive.id.as_str(),
            &folder.id,
            &folder.name,
        )));
    }

    if folder.deleted {
        tree.set_tombstone(&folder.id, None)?;
        return Ok(TreeFlow::Continue);
    }

    let path = folder_collection_path(ctx, tree, folder)?;
    let selected = !ctx.should_skip(&path, &drive.name);

    tree.set_folder(folder)?;
    tree.set_selected(&folder.id, selected);

    if !selected {
        debug!(item_id = %folder.id, skipped_path = %path, "path not selected");
    }

    Ok(TreeFlow::Continue)
}

fn folder_collection_path(
    ctx: &BackupContext,
    tree: &DeltaTree,
    folder: &DriveItem,
) -> Result<BackupPath, BackupError> {
    if folder.is_root() {
        return Ok(tree.prefix().clone());
    }

    let parent_path = folder
        .parent_path()
        .ok_or_else(|| BackupError::MissingParent(folder.id.clone()))?;

    Ok(ctx
        .scope
        .path_from_parent_reference(parent_path)?
        .append(&folder.name)?)
}

/// Applies one file event to the tree.
///
/// New files are checked against the preview limits; moves and updates of
/// files already in the tree always pass.
///
/// # Errors
/// Returns error if the tree rejects the file
pub(crate) fn add_file_to_tree(
    ctx: &BackupContext,
    tree: &mut DeltaTree,
    drive: &Drive,
    file: &DriveItem,
) -> Result<TreeFlow, BackupError> {
    if file.malware {
        info!(item_id = %file.id, "malware file detected");
        return Ok(TreeFlow::Skipped(Skipped::file(
            SkipCause::Malware,
            drive.id.as_str(),
            &file.id,
            &file.name,
        )));
    }

    if file.deleted {
        tree.delete_file(&file.id);
        return Ok(TreeFlow::Continue);
    }

    let parent_id = file.parent_id();

    if let Some(parent_id) = parent_id {
        if tree.is_selected(parent_id) == Some(false) {
            debug!(item_id = %file.id, parent_id = %parent_id, "parent not selected");
            return Ok(TreeFlow::Continue);
        }
    }

    let limiter = &ctx.limiter;
    let parent_count = parent_id
        .filter(|_| limiter.enabled() && !tree.has_file(&file.id))
        .and_then(|id| tree.folder_file_count(id));

    if let Some(parent_count) = parent_count {
        let (files, bytes) = tree.count_live_files_and_sizes();
        let stats = LimiterStats {
            files,
            bytes,
            ..LimiterStats::default()
        };

        if limiter.at_container_items_limit(parent_count) || limiter.at_item_limit(&stats) {
            return Ok(TreeFlow::CollectionFull);
        }

        // Forward looking: a single large file must not blow the budget.
        let prospective = LimiterStats {
            bytes: bytes + file.size,
            ..stats
        };
        if limiter.at_byte_limit(&prospective) {
            debug!(item_id = %file.id, size = file.size, "file exceeds byte budget, skipping");
            return Ok(TreeFlow::Continue);
        }
    }

    tree.add_file(file)?;

    Ok(TreeFlow::Continue)
}

// ============================================================================
// Post-processing
// ============================================================================

/// Stitches the previous backup's folder paths into the tree.
///
/// Unparseable entries are recoverable errors.
///
/// # Errors
/// Returns error if the fault bus records a failure
pub(crate) fn add_prev_paths_to_tree(
    tree: &mut DeltaTree,
    prev_paths: &HashMap<String, String>,
    errs: &FaultBus,
) -> Result<(), BackupError> {
    let mut entries: Vec<(&String, &String)> = prev_paths.iter().collect();
    entries.sort();

    for (folder_id, raw) in entries {
        if errs.failure().is_some() {
            break;
        }

        let prev = match parse_prev_path(folder_id, raw) {
            Ok(prev) => prev,
            Err(e) => {
                errs.add_recoverable(e);
                continue;
            }
        };

        if let Err(e) = tree.set_previous_path(folder_id, prev) {
            errs.add_recoverable(format!("setting previous path of {folder_id}: {e}"));
        }
    }

    match errs.failure() {
        Some(failure) => Err(BackupError::Failure(failure)),
        None => Ok(()),
    }
}

/// Flattens the tree into collections and the next previous-paths map.
///
/// `page_count` decides whether the drive is small enough for a URL cache.
///
/// # Errors
/// Returns error if the tree cannot be flattened or a collection cannot
/// be built
pub(crate) fn turn_tree_into_collections(
    ctx: &BackupContext,
    tree: &DeltaTree,
    drive: &Drive,
    prev_paths: &HashMap<String, String>,
    prev_delta_link: &str,
    page_count: usize,
) -> Result<(Vec<Collection>, HashMap<String, String>), BackupError> {
    let collectables = tree.generate_collectables()?;

    // The cache replays everything since the start of the backup, so it
    // starts from the original cursor.
    let url_cache = ctx.url_cache_for(drive, prev_delta_link, page_count)?;

    let mut selected: Vec<&Collectable> = collectables.values().filter(|c| c.selected).collect();
    selected.sort_by(|a, b| a.folder_id.cmp(&b.folder_id));

    let mut collections = Vec::with_capacity(selected.len());

    for cbl in selected {
        let mut col = Collection::new(
            ctx.store.clone(),
            drive,
            cbl.curr_path.clone(),
            cbl.prev_path.clone(),
            cbl.is_package_or_child_of_package,
            tree.had_reset(),
            ctx.options.clone(),
        )?;

        for item in cbl.files.values() {
            col.add(item.clone());
        }

        if let Some(cache) = &url_cache {
            col.set_url_cache(cache.clone());
        }

        collections.push(col);
    }

    let new_prev_paths = tree.generate_new_previous_paths(&collectables, prev_paths)?;

    Ok((collections, new_prev_paths))
}
