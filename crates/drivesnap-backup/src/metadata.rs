//! Backup metadata
//!
//! Every backup persists one metadata collection per tenant. It has two
//! JSON entries that make the next run incremental:
//!
//! - `delta`: drive ID -> delta link
//! - `previouspath`: drive ID -> folder ID -> canonical path
//!
//! Reading them back is deliberately forgiving: any problem with the stored
//! files disables the previous backup (forcing a full enumeration) instead of
//! failing the run.

use std::collections::HashMap;

use chrono::Utc;
use drivesnap_core::domain::{Alert, BackupPath, FaultBus};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::collection::BackupItem;

pub const PREVIOUS_PATH_FILE_NAME: &str = "previouspath";
pub const DELTA_URLS_FILE_NAME: &str = "delta";

pub const DATA_FILE_SUFFIX: &str = ".data";
pub const META_FILE_SUFFIX: &str = ".meta";
pub const DIR_META_FILE_SUFFIX: &str = ".dirmeta";

/// Alert raised when two folders of one drive share a previous path
pub const ALERT_PREVIOUS_PATH_COLLISION: &str = "previous folder path collision";

/// Drive ID -> delta link
pub type DeltaLinks = HashMap<String, String>;

/// Drive ID -> folder ID -> canonical path string
pub type PreviousPaths = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Deserializing file contents: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Mapping already exists for same drive ID: {0}")]
    ExistingMapping(String),
}

/// One named JSON file of a metadata collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub file_name: String,
    pub data: Vec<u8>,
}

impl MetadataEntry {
    /// Serializes `value` as the content of `file_name`.
    ///
    /// # Errors
    /// Returns [`MetadataError::Decode`] if `value` cannot be serialized
    pub fn new<T: Serialize>(file_name: impl Into<String>, value: &T) -> Result<Self, MetadataError> {
        Ok(Self {
            file_name: file_name.into(),
            data: serde_json::to_vec(value)?,
        })
    }
}

/// A collection of metadata files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataCollection {
    path: BackupPath,
    entries: Vec<MetadataEntry>,
}

impl MetadataCollection {
    pub fn new(path: BackupPath, entries: Vec<MetadataEntry>) -> Self {
        Self { path, entries }
    }

    #[must_use]
    pub fn full_path(&self) -> &BackupPath {
        &self.path
    }

    #[must_use]
    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    /// Streams every entry as a ready item.
    pub fn items(&self) -> mpsc::Receiver<BackupItem> {
        let (tx, rx) = mpsc::channel(self.entries.len().max(1));
        let now = Utc::now();

        for entry in &self.entries {
            // capacity covers every entry
            let _ = tx.try_send(BackupItem::ready(
                entry.file_name.clone(),
                now,
                entry.data.clone(),
            ));
        }

        rx
    }
}

/// Builds the metadata collection persisted for the next backup.
///
/// # Errors
/// Returns [`MetadataError::Decode`] if a map cannot be serialized
pub fn make_metadata_collection(
    prefix: BackupPath,
    previous_paths: &PreviousPaths,
    delta_links: &DeltaLinks,
) -> Result<MetadataCollection, MetadataError> {
    Ok(MetadataCollection::new(
        prefix,
        vec![
            MetadataEntry::new(PREVIOUS_PATH_FILE_NAME, previous_paths)?,
            MetadataEntry::new(DELTA_URLS_FILE_NAME, delta_links)?,
        ],
    ))
}

/// Merges the map in `data` into `already_found`.
///
/// Nothing is merged if any key of the new map is already present.
///
/// # Errors
/// Returns error if `data` is not a JSON map, or a key is already present
pub fn deserialize_map<T: DeserializeOwned>(
    data: &[u8],
    already_found: &mut HashMap<String, T>,
) -> Result<(), MetadataError> {
    let tmp: HashMap<String, T> = serde_json::from_slice(data)?;

    if let Some(dup) = tmp.keys().find(|k| already_found.contains_key(*k)) {
        return Err(MetadataError::ExistingMapping(dup.clone()));
    }

    already_found.extend(tmp);
    Ok(())
}

/// Reads the delta links and previous paths of earlier backups.
///
/// Returns `(deltas, previous_paths, can_use_previous_backup)`. Any decode
/// error or duplicate drive yields empty maps and `false`.
pub fn deserialize_metadata(cols: &[MetadataCollection]) -> (DeltaLinks, PreviousPaths, bool) {
    info!(num_collections = cols.len(), "deserializing previous backup metadata");

    let mut deltas = DeltaLinks::new();
    let mut prevs = PreviousPaths::new();

    for col in cols {
        for entry in col.entries() {
            let result = match entry.file_name.as_str() {
                PREVIOUS_PATH_FILE_NAME => deserialize_map(&entry.data, &mut prevs),
                DELTA_URLS_FILE_NAME => deserialize_map(&entry.data, &mut deltas),
                other => {
                    info!(file_name = %other, "skipping unknown metadata file");
                    continue;
                }
            };

            if let Err(e) = result {
                warn!(file_name = %entry.file_name, error = %e, "reading metadata collection items");
                return (DeltaLinks::new(), PreviousPaths::new(), false);
            }
        }
    }

    (deltas, prevs, true)
}

/// Reads previous metadata and drops delta links that cannot be trusted.
///
/// A drive's delta link is dropped when it has no previous paths, or when
/// any of its previous paths is empty. Folders sharing a previous path are
/// reported as alerts but kept.
pub fn deserialize_and_validate_metadata(
    cols: &[MetadataCollection],
    errs: &FaultBus,
) -> (DeltaLinks, PreviousPaths, bool) {
    let (mut deltas, prevs, can_use) = deserialize_metadata(cols);
    if !can_use {
        return (deltas, prevs, false);
    }

    deltas.retain(|drive_id, _| {
        let Some(paths) = prevs.get(drive_id).filter(|p| !p.is_empty()) else {
            info!(drive_id = %drive_id, "dropping drive delta due to 0 prev paths");
            return false;
        };

        if paths.values().any(String::is_empty) {
            info!(drive_id = %drive_id, "dropping drive delta due to 0 len path");
            return false;
        }

        true
    });

    alert_if_prev_paths_have_collisions(&prevs, errs);

    (deltas, prevs, true)
}

/// Raises one alert per folder whose previous path is already claimed by
/// another folder of the same drive.
pub fn alert_if_prev_paths_have_collisions(prevs: &PreviousPaths, errs: &FaultBus) {
    let mut drive_ids: Vec<&String> = prevs.keys().collect();
    drive_ids.sort();

    for drive_id in drive_ids {
        let folders = &prevs[drive_id];
        let mut folder_ids: Vec<&String> = folders.keys().collect();
        folder_ids.sort();

        let mut seen: HashMap<&str, &str> = HashMap::new();

        for folder_id in folder_ids {
            let prev = folders[folder_id].as_str();

            if let Some(other) = seen.get(prev) {
                warn!(
                    collision_folder_id_1 = %folder_id,
                    collision_folder_id_2 = %other,
                    collision_drive_id = %drive_id,
                    "previous path collision"
                );

                errs.add_alert(
                    Alert::new(ALERT_PREVIOUS_PATH_COLLISION, "", "", "previousPaths")
                        .with("collision_folder_id_1", folder_id.as_str())
                        .with("collision_folder_id_2", *other)
                        .with("collision_drive_id", drive_id.as_str())
                        .with("collision_prev_path", prev),
                );
            }

            seen.insert(prev, folder_id.as_str());
        }
    }
}
