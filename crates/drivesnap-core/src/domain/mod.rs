//! Domain entities and value types
//!
//! This module contains the core domain types for DriveSnap:
//! - Newtypes for validated identifiers
//! - Canonical backup paths and the resource scope that builds them
//! - The drive item view produced by delta enumeration
//! - Item sharing metadata persisted next to each file
//! - The fault bus shared by a backup run
//! - Domain-specific error types

pub mod drive_item;
pub mod errors;
pub mod fault;
pub mod newtypes;
pub mod path;
pub mod permissions;

// Re-export commonly used types
pub use drive_item::{DriveItem, ItemKind, ParentReference};
pub use errors::{DomainError, StoreError};
pub use fault::{Alert, FaultBus, SkipCause, SkipKind, Skipped};
pub use newtypes::DriveId;
pub use path::{BackupPath, Category, ResourceScope, Service};
pub use permissions::{
    Grantee, ItemMeta, LinkShare, LinkShareLink, Permission, RemotePermission, SharingMode,
};
