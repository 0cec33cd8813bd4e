//! Integration tests for delta enumeration
//!
//! Verifies the Graph delta pager against a wiremock-based mock server:
//! - Fresh enumeration with item conversion
//! - Pagination across nextLink pages
//! - Expired cursors restarting as a reset
//! - Request failures surfacing through results()
//! - Cancellation

use drivesnap_core::domain::ItemKind;
use drivesnap_core::ports::{DriveSource, ItemFields};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_fresh_enumeration_returns_converted_items() {
    let (server, provider) = common::setup_graph_mock().await;

    let items = serde_json::json!([
        {
            "id": "root-id",
            "name": "root",
            "root": {},
            "folder": { "childCount": 1 }
        },
        {
            "id": "folder-001",
            "name": "Documents",
            "parentReference": { "id": "root-id", "path": "/drive/root:" },
            "folder": { "childCount": 1 }
        },
        {
            "id": "file-001",
            "name": "notes.txt",
            "size": 42,
            "parentReference": { "id": "folder-001", "path": "/drive/root:/Documents" },
            "file": { "mimeType": "text/plain" }
        }
    ]);
    common::mount_delta_single_page(&server, items, "token-1").await;

    let mut pager = provider.enumerate_items_delta(&common::drive_id(), "", ItemFields::Backup);

    let page = pager.next_page().await.expect("first page");
    assert!(!page.reset);
    assert_eq!(page.items.len(), 3);
    assert_eq!(page.items[0].kind, ItemKind::Root);
    assert_eq!(page.items[1].parent_path(), Some("/drives/drive-001/root:"));
    assert_eq!(page.items[2].parent_path(), Some("/drives/drive-001/root:/Documents"));
    assert_eq!(page.items[2].size, 42);

    assert!(pager.next_page().await.is_none());

    pager.cancel();
    let delta = pager.results().await.unwrap();
    assert!(delta.url.ends_with("?token=token-1"));
    assert!(!delta.reset);
}

#[tokio::test]
async fn test_pagination_follows_next_link() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path(common::delta_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [ { "id": "a", "name": "a.txt", "file": {} } ],
            "@odata.nextLink": format!("{}/page-2", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                { "id": "b", "name": "b.txt", "file": {} },
                { "id": "c", "name": "c.txt", "file": {} }
            ],
            "@odata.deltaLink": format!("{}/delta-link", server.uri())
        })))
        .mount(&server)
        .await;

    let mut pager = provider.enumerate_items_delta(&common::drive_id(), "", ItemFields::Backup);

    let mut sizes = Vec::new();
    while let Some(page) = pager.next_page().await {
        sizes.push(page.items.len());
    }
    pager.cancel();

    assert_eq!(sizes, vec![1, 2]);
    let delta = pager.results().await.unwrap();
    assert_eq!(delta.url, format!("{}/delta-link", server.uri()));
}

#[tokio::test]
async fn test_expired_cursor_restarts_as_reset() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path("/expired"))
        .respond_with(ResponseTemplate::new(410).set_body_json(serde_json::json!({
            "error": { "code": "resyncRequired", "message": "token expired" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(common::delta_path()))
        .and(query_param("$select", drivesnap_graph::delta::BACKUP_SELECT))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [ { "id": "a", "name": "a.txt", "file": {} } ],
            "@odata.deltaLink": format!("{}/fresh-link", server.uri())
        })))
        .mount(&server)
        .await;

    let prev = format!("{}/expired", server.uri());
    let mut pager = provider.enumerate_items_delta(&common::drive_id(), &prev, ItemFields::Backup);

    let page = pager.next_page().await.expect("page after restart");
    assert!(page.reset);
    assert_eq!(page.items.len(), 1);

    assert!(pager.next_page().await.is_none());
    pager.cancel();

    let delta = pager.results().await.unwrap();
    assert!(delta.reset);
    assert_eq!(delta.url, format!("{}/fresh-link", server.uri()));
}

#[tokio::test]
async fn test_server_error_surfaces_in_results() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path(common::delta_path()))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let mut pager = provider.enumerate_items_delta(&common::drive_id(), "", ItemFields::Backup);

    assert!(pager.next_page().await.is_none());
    pager.cancel();

    let err = pager.results().await.unwrap_err();
    assert!(format!("{err:#}").contains("500"));
}

#[tokio::test]
async fn test_cancel_stops_enumeration() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path(common::delta_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [ { "id": "a", "name": "a.txt", "file": {} } ],
            "@odata.nextLink": format!("{}/never", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/never"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut pager = provider.enumerate_items_delta(&common::drive_id(), "", ItemFields::Backup);
    assert!(pager.next_page().await.is_some());

    pager.cancel();
    assert!(pager.next_page().await.is_none());

    let delta = pager.results().await.unwrap();
    assert!(delta.url.is_empty());
}

#[tokio::test]
async fn test_drive_listing_and_root_folder() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path(format!("/drives/{}/root", common::DRIVE_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "root-id",
            "name": "root",
            "root": {},
            "folder": { "childCount": 0 }
        })))
        .mount(&server)
        .await;

    let drives = provider.list_drives("user-1").await.unwrap();
    assert_eq!(drives.len(), 1);
    assert_eq!(drives[0].id.as_str(), common::DRIVE_ID);
    assert_eq!(drives[0].name, "OneDrive");

    let root = provider.get_root_folder(&common::drive_id()).await.unwrap();
    assert!(root.is_root());
    assert_eq!(root.id, "root-id");
}
