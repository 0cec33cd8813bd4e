//! In-memory delta tree
//!
//! [`DeltaTree`] accumulates one full delta enumeration of a drive. Live
//! folders are kept in an arena keyed by folder ID, with parent links stored
//! as IDs so that moves and tombstone/resurrection cycles never leave a
//! dangling reference behind. Deleted folders live in a separate tombstone
//! table, and live files are tracked through a flat `file ID -> parent ID`
//! index.
//!
//! ## State per folder ID
//!
//! ```text
//! Absent --set_folder--> Live --set_tombstone--> Tombstoned --set_folder--> Live ...
//! ```
//!
//! A folder ID is never present in both tables at once.
//!
//! ## Post-processing
//!
//! Once enumeration converges, the tree is flattened with
//! [`DeltaTree::generate_collectables`], the next run's previous-paths map
//! is derived with [`DeltaTree::generate_new_previous_paths`], and the set of
//! base-backup entries to replace comes from
//! [`DeltaTree::generate_exclude_item_ids`].

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use drivesnap_core::domain::{BackupPath, DomainError, DriveItem, ItemKind};
use thiserror::Error;
use tracing::debug;

use crate::metadata::{DATA_FILE_SUFFIX, META_FILE_SUFFIX};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while mutating or flattening a [`DeltaTree`]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreeError {
    #[error("Missing folder ID")]
    MissingFolderId,

    #[error("Missing folder name: {0}")]
    MissingFolderName(String),

    #[error("Non-root folder missing parent ID: {0}")]
    MissingParentId(String),

    #[error("Folder added before parent: {id} (parent {parent_id})")]
    FolderBeforeParent { id: String, parent_id: String },

    #[error("Item added without ID")]
    MissingItemId,

    #[error("Item added without parent folder ID: {0}")]
    MissingFileParent(String),

    #[error("File added before parent: {id} (parent {parent_id})")]
    FileBeforeParent { id: String, parent_id: String },

    #[error("Empty previous path for folder: {0}")]
    EmptyPreviousPath(String),

    #[error("Invalid previous path: {0}")]
    InvalidPreviousPath(String),

    #[error("Path error: {0}")]
    Path(#[from] DomainError),
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone)]
struct FolderNode {
    parent_id: Option<String>,
    folder: DriveItem,
    prev: Option<BackupPath>,
    children: HashSet<String>,
    files: HashMap<String, DriveItem>,
    selected: bool,
}

impl FolderNode {
    fn new(parent_id: Option<String>, folder: DriveItem) -> Self {
        Self {
            parent_id,
            folder,
            prev: None,
            children: HashSet::new(),
            files: HashMap::new(),
            selected: true,
        }
    }
}

/// One flattened folder, ready to become a collection
#[derive(Debug, Clone, PartialEq)]
pub struct Collectable {
    pub folder_id: String,
    /// `None` for tombstones
    pub curr_path: Option<BackupPath>,
    pub prev_path: Option<BackupPath>,
    /// Files in the folder plus, for non-root folders, the folder item itself
    pub files: HashMap<String, DriveItem>,
    pub is_package_or_child_of_package: bool,
    /// False when the directory selector rejected the folder
    pub selected: bool,
}

impl Collectable {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.curr_path.is_none()
    }
}

// ============================================================================
// DeltaTree
// ============================================================================

/// Accumulation target for one delta enumeration of a single drive
#[derive(Debug, Clone)]
pub struct DeltaTree {
    /// Canonical path of the drive root
    prefix: BackupPath,
    root_id: Option<String>,
    nodes: HashMap<String, FolderNode>,
    tombstones: HashMap<String, FolderNode>,
    file_parents: HashMap<String, String>,
    deleted_files: HashSet<String>,
    had_reset: bool,
}

impl DeltaTree {
    /// Creates an empty tree whose root resolves to `prefix`.
    pub fn new(prefix: BackupPath) -> Self {
        Self {
            prefix,
            root_id: None,
            nodes: HashMap::new(),
            tombstones: HashMap::new(),
            file_parents: HashMap::new(),
            deleted_files: HashSet::new(),
            had_reset: false,
        }
    }

    /// Drops every folder, tombstone and file link.
    ///
    /// Deleted file IDs are retained; they still need excluding from the
    /// base backup.
    pub fn reset(&mut self) {
        self.had_reset = true;
        self.root_id = None;
        self.nodes.clear();
        self.tombstones.clear();
        self.file_parents.clear();
    }

    #[must_use]
    pub fn had_reset(&self) -> bool {
        self.had_reset
    }

    #[must_use]
    pub fn prefix(&self) -> &BackupPath {
        &self.prefix
    }

    // ------------------------------------------------------------------------
    // Folders
    // ------------------------------------------------------------------------

    /// True when `id` is either live or tombstoned.
    #[must_use]
    pub fn contains_folder(&self, id: &str) -> bool {
        self.nodes.contains_key(id) || self.tombstones.contains_key(id)
    }

    #[must_use]
    pub fn is_live(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    #[must_use]
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Selection flag of a live folder; `None` when the folder is not live.
    #[must_use]
    pub fn is_selected(&self, id: &str) -> Option<bool> {
        self.nodes.get(id).map(|node| node.selected)
    }

    /// Marks a live folder as selected or rejected by the directory selector.
    pub fn set_selected(&mut self, id: &str, selected: bool) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.selected = selected;
        }
    }

    /// Number of files currently attached to a live folder.
    #[must_use]
    pub fn folder_file_count(&self, id: &str) -> Option<usize> {
        self.nodes.get(id).map(|node| node.files.len())
    }

    /// Inserts or updates a live folder.
    ///
    /// The root is created on first sight. A tombstoned folder is
    /// resurrected with its previous path, files and children intact. A live
    /// folder whose parent changed is detached from the old parent first.
    ///
    /// # Errors
    /// Returns error if the ID or name is missing, a non-root folder has no
    /// parent ID, or the parent is not a live folder
    pub fn set_folder(&mut self, folder: &DriveItem) -> Result<(), TreeError> {
        let id = folder.id.as_str();

        if id.is_empty() {
            return Err(TreeError::MissingFolderId);
        }
        if folder.name.is_empty() {
            return Err(TreeError::MissingFolderName(id.to_string()));
        }

        if folder.is_root() {
            match self.nodes.get_mut(id) {
                Some(root) => root.folder = folder.clone(),
                None => {
                    self.nodes
                        .insert(id.to_string(), FolderNode::new(None, folder.clone()));
                }
            }
            self.root_id = Some(id.to_string());
            return Ok(());
        }

        let parent_id = folder
            .parent_id()
            .ok_or_else(|| TreeError::MissingParentId(id.to_string()))?
            .to_string();

        if !self.nodes.contains_key(&parent_id) {
            return Err(TreeError::FolderBeforeParent {
                id: id.to_string(),
                parent_id,
            });
        }

        let node = if let Some(mut zombie) = self.tombstones.remove(id) {
            debug!(folder_id = %id, "resurrecting tombstoned folder");
            zombie.parent_id = Some(parent_id.clone());
            zombie.folder = folder.clone();
            zombie
        } else if let Some(mut live) = self.nodes.remove(id) {
            if let Some(old_parent) = live.parent_id.as_deref() {
                if old_parent != parent_id {
                    self.detach_child(old_parent, id);
                }
            }
            live.parent_id = Some(parent_id.clone());
            live.folder = folder.clone();
            live
        } else {
            FolderNode::new(Some(parent_id.clone()), folder.clone())
        };

        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            parent.children.insert(id.to_string());
        }
        self.nodes.insert(id.to_string(), node);

        Ok(())
    }

    /// Moves a folder into the tombstone table.
    ///
    /// A supplied previous path overwrites whatever the folder carried
    /// before.
    ///
    /// # Errors
    /// Returns error if the ID is empty or the supplied path has no folders
    pub fn set_tombstone(&mut self, id: &str, prev: Option<BackupPath>) -> Result<(), TreeError> {
        if id.is_empty() {
            return Err(TreeError::MissingFolderId);
        }
        if matches!(&prev, Some(p) if p.folders().is_empty()) {
            return Err(TreeError::EmptyPreviousPath(id.to_string()));
        }

        if let Some(mut node) = self.nodes.remove(id) {
            if let Some(parent_id) = node.parent_id.take() {
                self.detach_child(&parent_id, id);
            }
            if self.root_id.as_deref() == Some(id) {
                self.root_id = None;
            }
            if prev.is_some() {
                node.prev = prev;
            }
            self.tombstones.insert(id.to_string(), node);
            return Ok(());
        }

        let zombie = self
            .tombstones
            .entry(id.to_string())
            .or_insert_with(|| FolderNode::new(None, DriveItem::new(id, "", ItemKind::Folder)));
        if prev.is_some() {
            zombie.prev = prev;
        }

        Ok(())
    }

    /// Records the path a folder had in the previous backup.
    ///
    /// Unknown IDs are ignored unless the tree was reset, in which case a
    /// tombstone carrying `prev` is created: after a reset, a folder the
    /// enumeration never mentioned is gone.
    ///
    /// # Errors
    /// Returns error if the ID is empty or the path has no folders
    pub fn set_previous_path(&mut self, id: &str, prev: BackupPath) -> Result<(), TreeError> {
        if id.is_empty() {
            return Err(TreeError::MissingFolderId);
        }
        if prev.folders().is_empty() {
            return Err(TreeError::EmptyPreviousPath(id.to_string()));
        }

        if let Some(zombie) = self.tombstones.get_mut(id) {
            zombie.prev = Some(prev);
            return Ok(());
        }

        if let Some(node) = self.nodes.get_mut(id) {
            node.prev = Some(prev);
            return Ok(());
        }

        if self.had_reset {
            self.set_tombstone(id, Some(prev))?;
        }

        Ok(())
    }

    fn detach_child(&mut self, parent_id: &str, child_id: &str) {
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.children.remove(child_id);
        } else if let Some(parent) = self.tombstones.get_mut(parent_id) {
            parent.children.remove(child_id);
        }
    }

    // ------------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn has_file(&self, id: &str) -> bool {
        self.file_parents.contains_key(id)
    }

    /// Parent folder ID of a tracked file.
    #[must_use]
    pub fn file_parent(&self, id: &str) -> Option<&str> {
        self.file_parents.get(id).map(String::as_str)
    }

    /// Attaches a file to its parent folder, moving it if it was tracked
    /// elsewhere.
    ///
    /// # Errors
    /// Returns error if the file has no ID or parent ID, or the parent is
    /// not a live folder
    pub fn add_file(&mut self, file: &DriveItem) -> Result<(), TreeError> {
        let id = file.id.as_str();
        if id.is_empty() {
            return Err(TreeError::MissingItemId);
        }

        let parent_id = file
            .parent_id()
            .ok_or_else(|| TreeError::MissingFileParent(id.to_string()))?
            .to_string();

        if let Some(old_parent) = self.file_parents.get(id).cloned() {
            if old_parent != parent_id {
                self.detach_file(&old_parent, id);
            }
        }

        let Some(parent) = self.nodes.get_mut(&parent_id) else {
            return Err(TreeError::FileBeforeParent {
                id: id.to_string(),
                parent_id,
            });
        };

        parent.files.insert(id.to_string(), file.clone());
        self.file_parents.insert(id.to_string(), parent_id);
        self.deleted_files.remove(id);

        Ok(())
    }

    /// Drops a file from the tree and remembers it as deleted.
    pub fn delete_file(&mut self, id: &str) {
        if let Some(parent_id) = self.file_parents.remove(id) {
            self.detach_file(&parent_id, id);
        }
        self.deleted_files.insert(id.to_string());
    }

    fn detach_file(&mut self, parent_id: &str, file_id: &str) {
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.files.remove(file_id);
        } else if let Some(parent) = self.tombstones.get_mut(parent_id) {
            parent.files.remove(file_id);
        }
    }

    // ------------------------------------------------------------------------
    // Counts
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn count_live_folders(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn count_tombstones(&self) -> usize {
        self.tombstones.len()
    }

    /// Number and total size of files reachable from the root.
    #[must_use]
    pub fn count_live_files_and_sizes(&self) -> (usize, u64) {
        let Some(root_id) = self.root_id.as_deref() else {
            return (0, 0);
        };

        let mut count = 0;
        let mut bytes = 0;
        let mut stack = vec![root_id];

        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            count += node.files.len();
            bytes += node.files.values().map(|f| f.size).sum::<u64>();
            stack.extend(node.children.iter().map(String::as_str));
        }

        (count, bytes)
    }

    // ------------------------------------------------------------------------
    // Post-processing
    // ------------------------------------------------------------------------

    /// Flattens the tree into one collectable per live folder and one per
    /// tombstone that has a previous path.
    ///
    /// # Errors
    /// Returns error if a folder name cannot be appended to its parent path
    pub fn generate_collectables(&self) -> Result<HashMap<String, Collectable>, TreeError> {
        let mut result = HashMap::new();

        if let Some(root_id) = self.root_id.as_deref() {
            self.walk(root_id, self.prefix.clone(), false, &mut result)?;
        }

        for (id, zombie) in &self.tombstones {
            let Some(prev) = zombie.prev.clone() else {
                continue;
            };

            result.insert(
                id.clone(),
                Collectable {
                    folder_id: id.clone(),
                    curr_path: None,
                    prev_path: Some(prev),
                    files: HashMap::new(),
                    is_package_or_child_of_package: false,
                    selected: true,
                },
            );
        }

        Ok(result)
    }

    fn walk(
        &self,
        id: &str,
        path: BackupPath,
        is_child_of_package: bool,
        result: &mut HashMap<String, Collectable>,
    ) -> Result<(), TreeError> {
        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };

        let is_package = node.folder.is_package() || is_child_of_package;
        let is_root = self.root_id.as_deref() == Some(id);

        let mut files = node.files.clone();
        if !is_root {
            files.insert(id.to_string(), node.folder.clone());
        }

        for child_id in &node.children {
            let Some(child) = self.nodes.get(child_id) else {
                continue;
            };
            let child_path = path.append(&child.folder.name)?;
            self.walk(child_id, child_path, is_package, result)?;
        }

        result.insert(
            id.to_string(),
            Collectable {
                folder_id: id.to_string(),
                curr_path: Some(path),
                prev_path: node.prev.clone(),
                files,
                is_package_or_child_of_package: is_package,
                selected: node.selected,
            },
        );

        Ok(())
    }

    /// Builds the previous-paths map for the next backup.
    ///
    /// Every live collectable contributes its current path. Entries of the
    /// old map that this enumeration never mentioned are carried forward in
    /// ascending path order: an entry under a tombstoned parent is dropped,
    /// an entry under a moved parent is rewritten to the new parent
    /// location, and any other entry keeps its old path.
    ///
    /// # Errors
    /// Returns error if an old entry cannot be parsed as a path
    pub fn generate_new_previous_paths(
        &self,
        collectables: &HashMap<String, Collectable>,
        old_prev_paths: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, TreeError> {
        let mut results = HashMap::new();
        let mut tombstoned: HashSet<String> = HashSet::new();
        let mut moved: HashMap<String, BackupPath> = HashMap::new();

        for (id, collectable) in collectables {
            match &collectable.curr_path {
                None => {
                    if let Some(prev) = &collectable.prev_path {
                        tombstoned.insert(prev.to_string());
                    }
                }
                Some(curr) => {
                    results.insert(id.clone(), curr.to_string());

                    if let Some(prev) = &collectable.prev_path {
                        if prev != curr {
                            moved.insert(prev.to_string(), curr.clone());
                        }
                    }
                }
            }
        }

        let mut unseen: Vec<(&String, &String)> = old_prev_paths
            .iter()
            .filter(|(id, path)| !results.contains_key(*id) && !tombstoned.contains(*path))
            .collect();
        unseen.sort_by(|a, b| a.1.cmp(b.1));

        for (id, raw) in unseen {
            let path = BackupPath::from_str(raw)
                .map_err(|e| TreeError::InvalidPreviousPath(format!("{raw}: {e}")))?;

            let Some(parent) = path.dir() else {
                results.insert(id.clone(), raw.clone());
                continue;
            };
            let parent_key = parent.to_string();

            if tombstoned.contains(&parent_key) {
                tombstoned.insert(raw.clone());
                continue;
            }

            match moved.get(&parent_key) {
                None => {
                    results.insert(id.clone(), raw.clone());
                }
                Some(new_parent) => {
                    let mut rewritten = path.clone();
                    rewritten.update_parent(&parent, new_parent);

                    results.insert(id.clone(), rewritten.to_string());
                    moved.insert(raw.clone(), rewritten);
                }
            }
        }

        Ok(results)
    }

    /// Item names to exclude from the base backup.
    ///
    /// Files still attached to a live folder contribute both their data and
    /// meta entries; every deleted file contributes its bare ID.
    #[must_use]
    pub fn generate_exclude_item_ids(&self) -> HashSet<String> {
        let mut result = HashSet::new();

        for (file_id, parent_id) in &self.file_parents {
            if !self.nodes.contains_key(parent_id) {
                continue;
            }
            result.insert(format!("{file_id}{DATA_FILE_SUFFIX}"));
            result.insert(format!("{file_id}{META_FILE_SUFFIX}"));
        }

        result.extend(self.deleted_files.iter().cloned());

        result
    }
}
