//! DriveSnap Backup - Delta-to-collection backup engine
//!
//! Provides:
//! - Reconciliation of a drive's delta feed into folder-scoped collections
//! - Preview limits for sampling large drives
//! - Lazy, concurrent item streaming with download-URL refresh
//! - Metadata persistence for the next incremental run
//!
//! ## Modules
//!
//! - [`collections`] - Per-backup orchestrator with flat and tree strategies
//! - [`collection`] - Per-folder item streaming
//! - [`delta_tree`] - In-memory folder tree built from one delta enumeration
//! - [`limiter`] - Preview limit policy
//! - [`url_cache`] - Per-drive download URL cache
//! - [`metadata`] - Delta links and previous paths of earlier backups
//! - [`excludes`] - Base-backup entries replaced by this backup
//! - [`extensions`] - Observers attached to item content streams

pub mod collection;
pub mod collections;
pub mod delta_tree;
pub mod excludes;
pub mod extensions;
pub mod limiter;
pub mod metadata;
pub mod url_cache;

#[cfg(test)]
mod testing;

use drivesnap_core::domain::DomainError;
use thiserror::Error;

use crate::delta_tree::TreeError;
use crate::extensions::ExtensionError;
use crate::metadata::MetadataError;
use crate::url_cache::UrlCacheError;

/// Errors that abort a drive's reconciliation or the whole backup
#[derive(Debug, Error)]
pub enum BackupError {
    /// The delta tree rejected a mutation or could not be flattened
    #[error("Delta tree error: {0}")]
    Tree(#[from] TreeError),

    /// A stored previous path could not be parsed
    #[error("Invalid previous path for folder {folder_id}: {path}")]
    InvalidPreviousPath { folder_id: String, path: String },

    /// A file referenced a folder that was never enumerated
    #[error("Item seen before parent folder: {item_id} (parent {parent_id})")]
    ItemBeforeParent { item_id: String, parent_id: String },

    /// A non-root item carried no usable parent reference
    #[error("Missing parent reference: {0}")]
    MissingParent(String),

    /// A moved file was not queued where its previous parent said it was
    #[error("Moved item not found in previous collection: {0}")]
    MovedItemNotFound(String),

    /// Delta enumeration never converged
    #[error("Unable to produce consistent delta after {0} queries")]
    InconsistentDelta(u32),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("URL cache error: {0}")]
    UrlCache(#[from] UrlCacheError),

    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),

    /// The fault bus recorded a hard failure
    #[error("Backup failed: {0}")]
    Failure(String),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// A port adapter failed (drive listing, delta results)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
