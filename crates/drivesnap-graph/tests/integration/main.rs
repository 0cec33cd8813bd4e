//! Integration tests for drivesnap-graph
//!
//! Uses wiremock to simulate the Microsoft Graph API and verifies the
//! drive source, delta pager, and item store implementations end to end.

mod common;

mod test_delta;
mod test_items;
