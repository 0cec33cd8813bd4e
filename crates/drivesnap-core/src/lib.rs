//! DriveSnap Core - Domain types and port definitions
//!
//! This crate contains the pieces shared by every DriveSnap crate:
//! - **Domain types** - `DriveItem`, `BackupPath`, `ResourceScope`, `DriveId`, item metadata
//! - **Fault bus** - `FaultBus` collecting recoverable errors, skips and alerts
//! - **Port definitions** - Traits for adapters: `DriveSource`, `DeltaPager`, `ItemStore`, `DirScope`
//! - **Configuration** - YAML-backed `Config` with validation and a builder
//!
//! # Architecture
//!
//! The backup engine only ever sees the narrow domain types defined here.
//! Adapter crates (such as `drivesnap-graph`) convert vendor responses into
//! these types at the boundary and implement the port traits.

pub mod config;
pub mod domain;
pub mod ports;
