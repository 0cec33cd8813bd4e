//! Port definitions (hexagonal architecture interfaces)
//!
//! The backup engine depends on these traits; adapter crates implement them.
//!
//! ## Ports Overview
//!
//! - [`DriveSource`] - Drive listing, root lookup, and delta enumeration
//! - [`DeltaPager`] - One paged delta enumeration of a drive
//! - [`ItemStore`] - Item records, permissions, and raw content downloads
//! - [`DirScope`] - Directory selection for a backup

pub mod delta_source;
pub mod dir_scope;
pub mod item_store;

pub use delta_source::{DeltaPage, DeltaPager, DeltaUpdate, Drive, DriveSource, ItemFields};
pub use dir_scope::{AllPass, DirScope, GlobScope};
pub use item_store::{classify_download, ItemStore, RawResponse};
