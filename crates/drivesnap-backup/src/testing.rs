//! Port doubles shared by unit tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use drivesnap_core::domain::{
    Category, DriveId, DriveItem, ItemKind, RemotePermission, ResourceScope, Service, StoreError,
};
use drivesnap_core::ports::{
    AllPass, DeltaPager, Drive, DriveSource, ItemFields, ItemStore, RawResponse,
};

use crate::collection::CollectionOptions;
use crate::collections::BackupContext;
use crate::limiter::Limiter;

/// A source without drives
pub(crate) struct NoDrives;

#[async_trait::async_trait]
impl DriveSource for NoDrives {
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
        _fields: ItemFields,
    ) -> Box<dyn DeltaPager> {
        unreachable!("no drives to enumerate")
    }
}

/// A store where nothing exists
pub(crate) struct NoStore;

#[async_trait::async_trait]
impl ItemStore for NoStore {
    async fn get_item(&self, _drive_id: &DriveId, item_id: &str) -> Result<DriveItem, StoreError> {
        Err(StoreError::NotFound(item_id.to_string()))
    }

    async fn get_item_permissions(
        &self,
        _drive_id: &DriveId,
        _item_id: &str,
    ) -> Result<Vec<RemotePermission>, StoreError> {
        Ok(Vec::new())
    }

    async fn get(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<RawResponse, StoreError> {
        Err(StoreError::NotFound(url.to_string()))
    }
}

pub(crate) fn scope() -> ResourceScope {
    ResourceScope::new("tenant", "user", Service::OneDrive, Category::Files).unwrap()
}

pub(crate) fn drive() -> Drive {
    Drive {
        id: DriveId::new("d1".to_string()).unwrap(),
        name: "OneDrive".to_string(),
    }
}

/// Context over the no-op ports with the given limiter
pub(crate) fn context(limiter: Limiter) -> BackupContext {
    BackupContext {
        source: Arc::new(NoDrives),
        store: Arc::new(NoStore),
        scope: scope(),
        selector: Arc::new(AllPass),
        limiter,
        options: CollectionOptions::default(),
        url_cache_threshold: 0,
        url_cache_refresh: Duration::from_secs(60),
        max_delta_queries: 5,
    }
}
