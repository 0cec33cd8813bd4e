//! Shared test helpers for Graph API integration tests
//!
//! Each helper mounts mock endpoints on a wiremock server and returns a
//! provider pointing at it.

use drivesnap_core::domain::DriveId;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use drivesnap_graph::client::GraphClient;
use drivesnap_graph::provider::GraphProvider;

pub const DRIVE_ID: &str = "drive-001";

/// Starts a mock server with `GET /users/user-1/drives` mounted
pub async fn setup_graph_mock() -> (MockServer, GraphProvider) {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/users/user-1/drives"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                { "id": DRIVE_ID, "name": "OneDrive" }
            ]
        })))
        .mount(&server)
        .await;

    let provider = GraphProvider::new(GraphClient::with_base_url("test-access-token", server.uri()));

    (server, provider)
}

pub fn drive_id() -> DriveId {
    DriveId::new(DRIVE_ID.to_string()).unwrap()
}

/// Delta path of the test drive
pub fn delta_path() -> String {
    format!("/drives/{DRIVE_ID}/root/delta")
}

/// Mounts a single-page fresh delta enumeration ending in `delta_token`
pub async fn mount_delta_single_page(server: &MockServer, items: serde_json::Value, delta_token: &str) {
    Mock::given(method("GET"))
        .and(path(delta_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": items,
            "@odata.deltaLink": format!("{}{}?token={}", server.uri(), delta_path(), delta_token)
        })))
        .mount(server)
        .await;
}
