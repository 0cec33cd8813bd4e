//! Item sharing metadata
//!
//! Every backed-up file is accompanied by a `.meta` entry holding its
//! sharing state. [`ItemMeta::from_remote`] builds that record from the raw
//! permission list returned by the item store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role granted to the drive owner; never persisted
const OWNER_ROLE: &str = "owner";

/// Whether an item inherits its parent's sharing or defines its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    Inherited,
    Custom,
}

/// Who a remote permission is granted to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Grantee {
    pub entity_id: Option<String>,
    pub email: Option<String>,
    /// `user`, `group` or `application`
    pub entity_type: Option<String>,
}

/// Sharing link details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkShareLink {
    pub scope: Option<String>,
    #[serde(rename = "type")]
    pub link_type: Option<String>,
    pub web_url: Option<String>,
    pub prevents_download: bool,
}

/// A permission entry as returned by the item store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemotePermission {
    pub id: String,
    pub roles: Vec<String>,
    pub granted_to: Option<Grantee>,
    /// Additional grantees of a sharing link
    pub granted_to_identities: Vec<Grantee>,
    pub link: Option<LinkShareLink>,
    /// Set when the permission is inherited from an ancestor
    pub inherited_from: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub has_password: bool,
}

/// A direct permission persisted with the item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: String,
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expiration: Option<DateTime<Utc>>,
}

/// A sharing link persisted with the item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkShare {
    pub id: String,
    pub roles: Vec<String>,
    pub link: LinkShareLink,
    pub entities: Vec<Grantee>,
    pub has_password: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expiration: Option<DateTime<Utc>>,
}

/// Content of an item's `.meta` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMeta {
    pub file_name: String,
    pub sharing_mode: SharingMode,
    pub permissions: Vec<Permission>,
    pub link_shares: Vec<LinkShare>,
}

impl ItemMeta {
    /// Metadata for an item that inherits its parent's sharing.
    pub fn inherited(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            sharing_mode: SharingMode::Inherited,
            permissions: Vec::new(),
            link_shares: Vec::new(),
        }
    }

    /// Metadata for a shared item from its raw permission list.
    ///
    /// Inherited entries and owner grants are dropped; link-based entries
    /// become link shares, everything else a direct permission.
    pub fn from_remote(file_name: impl Into<String>, remote: &[RemotePermission]) -> Self {
        let mut meta = Self {
            sharing_mode: SharingMode::Custom,
            ..Self::inherited(file_name)
        };

        for perm in remote.iter().filter(|p| p.inherited_from.is_none()) {
            let roles: Vec<String> = perm
                .roles
                .iter()
                .filter(|r| r.as_str() != OWNER_ROLE)
                .cloned()
                .collect();

            if let Some(link) = &perm.link {
                meta.link_shares.push(LinkShare {
                    id: perm.id.clone(),
                    roles,
                    link: link.clone(),
                    entities: perm.granted_to_identities.clone(),
                    has_password: perm.has_password,
                    expiration: perm.expiration,
                });
                continue;
            }

            if roles.is_empty() {
                continue;
            }

            let grantee = perm.granted_to.clone().unwrap_or_default();
            meta.permissions.push(Permission {
                id: perm.id.clone(),
                roles,
                email: grantee.email,
                entity_id: grantee.entity_id,
                entity_type: grantee.entity_type,
                expiration: perm.expiration,
            });
        }

        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_perm(id: &str, role: &str) -> RemotePermission {
        RemotePermission {
            id: id.to_string(),
            roles: vec![role.to_string()],
            granted_to: Some(Grantee {
                entity_id: Some(format!("user-{id}")),
                email: Some(format!("{id}@example.com")),
                entity_type: Some("user".to_string()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_inherited_meta_json() {
        let meta = ItemMeta::inherited("a.txt");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "fileName": "a.txt",
                "sharingMode": "inherited",
                "permissions": [],
                "linkShares": []
            })
        );
    }

    #[test]
    fn test_from_remote_filters_owner_and_inherited() {
        let mut inherited = user_perm("p3", "write");
        inherited.inherited_from = Some("parent".to_string());

        let remote = vec![
            user_perm("p1", "read"),
            user_perm("p2", "owner"),
            inherited,
        ];

        let meta = ItemMeta::from_remote("a.txt", &remote);
        assert_eq!(meta.sharing_mode, SharingMode::Custom);
        assert_eq!(meta.permissions.len(), 1);
        assert_eq!(meta.permissions[0].id, "p1");
        assert_eq!(meta.permissions[0].email.as_deref(), Some("p1@example.com"));
        assert!(meta.link_shares.is_empty());
    }

    #[test]
    fn test_from_remote_splits_links() {
        let link = RemotePermission {
            id: "l1".to_string(),
            roles: vec!["read".to_string()],
            link: Some(LinkShareLink {
                scope: Some("organization".to_string()),
                link_type: Some("view".to_string()),
                web_url: Some("https://example.com/s".to_string()),
                prevents_download: false,
            }),
            granted_to_identities: vec![Grantee {
                entity_id: Some("u9".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let meta = ItemMeta::from_remote("a.txt", &[link]);
        assert!(meta.permissions.is_empty());
        assert_eq!(meta.link_shares.len(), 1);
        assert_eq!(meta.link_shares[0].entities.len(), 1);

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["linkShares"][0]["link"]["type"], "view");
    }
}
