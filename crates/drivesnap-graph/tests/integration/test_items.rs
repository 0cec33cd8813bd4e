//! Integration tests for the item store implementation

use std::collections::HashMap;

use drivesnap_core::domain::StoreError;
use drivesnap_core::ports::ItemStore;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_get_item_returns_fresh_download_url() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path(format!("/drives/{}/items/file-001", common::DRIVE_ID)))
        .and(header("authorization", "Bearer test-access-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "file-001",
            "name": "a.txt",
            "file": {},
            "@microsoft.graph.downloadUrl": "https://download.example/a"
        })))
        .mount(&server)
        .await;

    let item = provider
        .get_item(&common::drive_id(), "file-001")
        .await
        .unwrap();

    assert_eq!(item.download_url.as_deref(), Some("https://download.example/a"));
}

#[tokio::test]
async fn test_get_item_classifies_missing_and_deleted() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path(format!("/drives/{}/items/gone", common::DRIVE_ID)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/drives/{}/items/trashed", common::DRIVE_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "trashed",
            "name": "t.txt",
            "file": {},
            "deleted": {}
        })))
        .mount(&server)
        .await;

    let err = provider.get_item(&common::drive_id(), "gone").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    let err = provider
        .get_item(&common::drive_id(), "trashed")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DeletedInFlight(_)));
}

#[tokio::test]
async fn test_get_item_permissions() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path(format!(
            "/drives/{}/items/file-001/permissions",
            common::DRIVE_ID
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                {
                    "id": "owner-perm",
                    "roles": ["owner"],
                    "grantedToV2": { "user": { "id": "u-1" } }
                },
                {
                    "id": "link-perm",
                    "roles": ["read"],
                    "link": { "scope": "organization", "type": "view" }
                }
            ]
        })))
        .mount(&server)
        .await;

    let perms = provider
        .get_item_permissions(&common::drive_id(), "file-001")
        .await
        .unwrap();

    assert_eq!(perms.len(), 2);
    assert_eq!(perms[0].roles, vec!["owner".to_string()]);
    assert!(perms[1].link.is_some());
}

#[tokio::test]
async fn test_raw_get_returns_status_and_headers() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path("/content/busy"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "5"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/content/ok"))
        .and(header("x-test", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .mount(&server)
        .await;

    let busy = provider
        .get(&format!("{}/content/busy", server.uri()), &HashMap::new())
        .await
        .unwrap();
    assert_eq!(busy.status, 503);
    assert_eq!(busy.headers.get("retry-after").map(String::as_str), Some("5"));

    let headers = HashMap::from([("x-test".to_string(), "1".to_string())]);
    let ok = provider
        .get(&format!("{}/content/ok", server.uri()), &headers)
        .await
        .unwrap();
    assert!(ok.is_success());
    assert_eq!(ok.body, b"hello");
}

#[tokio::test]
async fn test_download_detects_malware() {
    let (server, provider) = common::setup_graph_mock().await;

    Mock::given(method("GET"))
        .and(path("/content/infected"))
        .respond_with(ResponseTemplate::new(403).insert_header("x-virus-infected", "true"))
        .mount(&server)
        .await;

    let err = provider
        .download(&format!("{}/content/infected", server.uri()))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Malware(_)));
}
