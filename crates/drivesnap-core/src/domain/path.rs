//! Canonical backup paths
//!
//! A [`BackupPath`] is an immutable, tenant/service/owner/category scoped
//! location. Its string form joins every element with `/`; separators and
//! backslashes inside an element are escaped with a backslash so the string
//! always parses back to the same elements.
//!
//! Drive folders live under `drives/<driveID>/root:` inside the owner's
//! category, e.g. `tenant/onedrive/user/files/drives/d1/root:/Documents`.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::DriveId;

/// First folder element of every drive path
pub const DRIVES_ELEMENT: &str = "drives";

/// Folder element marking the root of a drive
pub const ROOT_ELEMENT: &str = "root:";

const SEPARATOR: char = '/';
const ESCAPE: char = '\\';

// ============================================================================
// Service / Category
// ============================================================================

/// The service a backup path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Service {
    OneDrive,
    SharePoint,
    OneDriveMetadata,
    SharePointMetadata,
}

impl Service {
    /// Wire name used inside path strings.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneDrive => "onedrive",
            Self::SharePoint => "sharepoint",
            Self::OneDriveMetadata => "onedriveMetadata",
            Self::SharePointMetadata => "sharepointMetadata",
        }
    }

    /// The metadata counterpart of this service.
    #[must_use]
    pub fn metadata(self) -> Self {
        match self {
            Self::OneDrive | Self::OneDriveMetadata => Self::OneDriveMetadata,
            Self::SharePoint | Self::SharePointMetadata => Self::SharePointMetadata,
        }
    }
}

impl Display for Service {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onedrive" => Ok(Self::OneDrive),
            "sharepoint" => Ok(Self::SharePoint),
            "onedriveMetadata" => Ok(Self::OneDriveMetadata),
            "sharepointMetadata" => Ok(Self::SharePointMetadata),
            other => Err(DomainError::InvalidPath(format!("unknown service: {other}"))),
        }
    }
}

/// Data category within a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    /// OneDrive user files
    Files,
    /// SharePoint document libraries
    Libraries,
}

impl Category {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Libraries => "libraries",
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "files" => Ok(Self::Files),
            "libraries" => Ok(Self::Libraries),
            other => Err(DomainError::InvalidPath(format!("unknown category: {other}"))),
        }
    }
}

// ============================================================================
// BackupPath
// ============================================================================

/// Canonical location of a collection in the backup
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupPath {
    tenant: String,
    service: Service,
    owner: String,
    category: Category,
    folders: Vec<String>,
}

impl BackupPath {
    /// Create a new BackupPath
    ///
    /// # Errors
    /// Returns error if the tenant, the owner, or any folder element is empty
    pub fn new(
        tenant: impl Into<String>,
        service: Service,
        owner: impl Into<String>,
        category: Category,
        folders: Vec<String>,
    ) -> Result<Self, DomainError> {
        let tenant = tenant.into();
        let owner = owner.into();

        if tenant.is_empty() {
            return Err(DomainError::InvalidPath("missing tenant".to_string()));
        }
        if owner.is_empty() {
            return Err(DomainError::InvalidPath("missing resource owner".to_string()));
        }
        if folders.iter().any(String::is_empty) {
            return Err(DomainError::EmptyPathElement(folders.join("/")));
        }

        Ok(Self {
            tenant,
            service,
            owner,
            category,
            folders,
        })
    }

    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    #[must_use]
    pub fn service(&self) -> Service {
        self.service
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    /// Folder elements after the category.
    #[must_use]
    pub fn folders(&self) -> &[String] {
        &self.folders
    }

    /// Every element of the path, prefix included.
    #[must_use]
    pub fn elements(&self) -> Vec<String> {
        let mut elements = vec![
            self.tenant.clone(),
            self.service.as_str().to_string(),
            self.owner.clone(),
            self.category.as_str().to_string(),
        ];
        elements.extend(self.folders.iter().cloned());
        elements
    }

    /// Last folder element, if any.
    #[must_use]
    pub fn folder_name(&self) -> Option<&str> {
        self.folders.last().map(String::as_str)
    }

    /// Returns a new path with `element` appended.
    ///
    /// # Errors
    /// Returns [`DomainError::EmptyPathElement`] if `element` is empty
    pub fn append(&self, element: &str) -> Result<Self, DomainError> {
        if element.is_empty() {
            return Err(DomainError::EmptyPathElement(self.to_string()));
        }

        let mut next = self.clone();
        next.folders.push(element.to_string());
        Ok(next)
    }

    /// Returns the parent path, or `None` when there are no folders left.
    #[must_use]
    pub fn dir(&self) -> Option<Self> {
        if self.folders.is_empty() {
            return None;
        }

        let mut parent = self.clone();
        parent.folders.pop();
        Some(parent)
    }

    /// True when `self` equals `other` or is one of its ancestors.
    #[must_use]
    pub fn is_prefix_of(&self, other: &BackupPath) -> bool {
        self.tenant == other.tenant
            && self.service == other.service
            && self.owner == other.owner
            && self.category == other.category
            && other.folders.starts_with(&self.folders)
    }

    /// Rewrites the `prev` prefix of this path into `curr`.
    ///
    /// Returns `false` and leaves the path untouched when `prev` is not a prefix.
    pub fn update_parent(&mut self, prev: &BackupPath, curr: &BackupPath) -> bool {
        if !prev.is_prefix_of(self) {
            return false;
        }

        let rest = self.folders.split_off(prev.folders.len());
        *self = curr.clone();
        self.folders.extend(rest);
        true
    }

    /// The folder path within the drive, without the `drives/<id>/root:` prefix.
    ///
    /// The drive root yields an empty string.
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidPath`] if the path is not a drive path
    pub fn drive_folder_path(&self) -> Result<String, DomainError> {
        if self.folders.len() < 3
            || self.folders[0] != DRIVES_ELEMENT
            || self.folders[2] != ROOT_ELEMENT
        {
            return Err(DomainError::InvalidPath(format!(
                "not a drive folder path: {self}"
            )));
        }

        Ok(self.folders[3..].join("/"))
    }
}

fn escape_element(element: &str, out: &mut String) {
    for c in element.chars() {
        if c == SEPARATOR || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

/// Splits an escaped path string into its raw elements.
fn split_escaped(s: &str) -> Result<Vec<String>, DomainError> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(next) => current.push(next),
                None => {
                    return Err(DomainError::InvalidPath(format!(
                        "trailing escape character: {s}"
                    )))
                }
            },
            SEPARATOR => elements.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    elements.push(current);

    Ok(elements)
}

impl Display for BackupPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for (i, element) in self.elements().iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            escape_element(element, &mut out);
        }
        f.write_str(&out)
    }
}

impl FromStr for BackupPath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let elements = split_escaped(s)?;
        if elements.len() < 4 {
            return Err(DomainError::InvalidPath(format!(
                "path has fewer than four elements: {s}"
            )));
        }

        let mut iter = elements.into_iter();
        let tenant = iter.next().unwrap_or_default();
        let service = iter.next().unwrap_or_default().parse()?;
        let owner = iter.next().unwrap_or_default();
        let category = iter.next().unwrap_or_default().parse()?;

        Self::new(tenant, service, owner, category, iter.collect())
    }
}

impl Serialize for BackupPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BackupPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// ResourceScope
// ============================================================================

/// The tenant, owner, service, and category a backup run operates in
///
/// Builds every canonical path the engine produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceScope {
    tenant_id: String,
    owner_id: String,
    service: Service,
    category: Category,
}

impl ResourceScope {
    /// Create a new ResourceScope
    ///
    /// # Errors
    /// Returns error if the tenant or owner is empty
    pub fn new(
        tenant_id: impl Into<String>,
        owner_id: impl Into<String>,
        service: Service,
        category: Category,
    ) -> Result<Self, DomainError> {
        let tenant_id = tenant_id.into();
        let owner_id = owner_id.into();

        if tenant_id.is_empty() {
            return Err(DomainError::ValidationFailed("tenant ID cannot be empty".to_string()));
        }
        if owner_id.is_empty() {
            return Err(DomainError::ValidationFailed("owner ID cannot be empty".to_string()));
        }

        Ok(Self {
            tenant_id,
            owner_id,
            service,
            category,
        })
    }

    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    #[must_use]
    pub fn service(&self) -> Service {
        self.service
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    /// Builds a data path with the given folder elements.
    pub fn canonical_path(&self, folders: Vec<String>) -> Result<BackupPath, DomainError> {
        BackupPath::new(
            self.tenant_id.clone(),
            self.service,
            self.owner_id.clone(),
            self.category,
            folders,
        )
    }

    /// `drives/<driveID>/root:` within this scope.
    pub fn drive_root(&self, drive_id: &DriveId) -> Result<BackupPath, DomainError> {
        self.canonical_path(vec![
            DRIVES_ELEMENT.to_string(),
            drive_id.to_string(),
            ROOT_ELEMENT.to_string(),
        ])
    }

    /// `drives/<driveID>` within this scope, used to tombstone whole drives.
    pub fn drive_prefix(&self, drive_id: &DriveId) -> Result<BackupPath, DomainError> {
        self.canonical_path(vec![DRIVES_ELEMENT.to_string(), drive_id.to_string()])
    }

    /// Root of the metadata service for this scope.
    pub fn metadata_prefix(&self) -> Result<BackupPath, DomainError> {
        BackupPath::new(
            self.tenant_id.clone(),
            self.service.metadata(),
            self.owner_id.clone(),
            self.category,
            Vec::new(),
        )
    }

    /// Converts a parent reference path such as `/drives/d1/root:/a/b` into
    /// a canonical path.
    pub fn path_from_parent_reference(&self, parent_path: &str) -> Result<BackupPath, DomainError> {
        let folders: Vec<String> = parent_path
            .split(SEPARATOR)
            .filter(|element| !element.is_empty())
            .map(str::to_string)
            .collect();

        if folders.len() < 3 || folders[0] != DRIVES_ELEMENT || folders[2] != ROOT_ELEMENT {
            return Err(DomainError::InvalidPath(format!(
                "malformed parent reference path: {parent_path}"
            )));
        }

        self.canonical_path(folders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ResourceScope {
        ResourceScope::new("tenant", "user", Service::OneDrive, Category::Files).unwrap()
    }

    fn drive() -> DriveId {
        DriveId::new("d1".to_string()).unwrap()
    }

    #[test]
    fn test_drive_root_string() {
        let root = scope().drive_root(&drive()).unwrap();
        assert_eq!(root.to_string(), "tenant/onedrive/user/files/drives/d1/root:");
        assert_eq!(root.drive_folder_path().unwrap(), "");
    }

    #[test]
    fn test_append_and_dir() {
        let root = scope().drive_root(&drive()).unwrap();
        let docs = root.append("Documents").unwrap();
        let nested = docs.append("Taxes").unwrap();

        assert_eq!(nested.drive_folder_path().unwrap(), "Documents/Taxes");
        assert_eq!(nested.folder_name(), Some("Taxes"));
        assert_eq!(nested.dir(), Some(docs.clone()));
        assert!(root.append("").is_err());
    }

    #[test]
    fn test_prefix() {
        let root = scope().drive_root(&drive()).unwrap();
        let a = root.append("a").unwrap();
        let ab = a.append("b").unwrap();
        let abc = root.append("abc").unwrap();

        assert!(root.is_prefix_of(&ab));
        assert!(a.is_prefix_of(&ab));
        assert!(a.is_prefix_of(&a));
        assert!(!a.is_prefix_of(&abc));
        assert!(!ab.is_prefix_of(&a));
    }

    #[test]
    fn test_update_parent() {
        let root = scope().drive_root(&drive()).unwrap();
        let old = root.append("old").unwrap();
        let new = root.append("new").unwrap();
        let mut child = old.append("child").unwrap();

        assert!(child.update_parent(&old, &new));
        assert_eq!(child, new.append("child").unwrap());

        let mut other = root.append("other").unwrap();
        assert!(!other.update_parent(&old, &new));
        assert_eq!(other, root.append("other").unwrap());
    }

    #[test]
    fn test_escaped_roundtrip() {
        let root = scope().drive_root(&drive()).unwrap();
        let odd = root.append("a/b").unwrap().append("c\\d").unwrap();

        let s = odd.to_string();
        assert_eq!(s, "tenant/onedrive/user/files/drives/d1/root:/a\\/b/c\\\\d");

        let parsed: BackupPath = s.parse().unwrap();
        assert_eq!(parsed, odd);
        assert_eq!(parsed.folders().len(), 5);
    }

    #[test]
    fn test_parse_errors() {
        assert!("tenant/onedrive".parse::<BackupPath>().is_err());
        assert!("tenant/bogus/user/files".parse::<BackupPath>().is_err());
        assert!("tenant/onedrive/user/files/a//b".parse::<BackupPath>().is_err());
        assert!("tenant/onedrive/user/files/a\\".parse::<BackupPath>().is_err());
    }

    #[test]
    fn test_path_from_parent_reference() {
        let p = scope()
            .path_from_parent_reference("/drives/d1/root:/Documents/Taxes")
            .unwrap();
        assert_eq!(p.drive_folder_path().unwrap(), "Documents/Taxes");

        assert!(scope().path_from_parent_reference("/drive/root:").is_err());
    }

    #[test]
    fn test_metadata_prefix() {
        let meta = scope().metadata_prefix().unwrap();
        assert_eq!(meta.to_string(), "tenant/onedriveMetadata/user/files");
        assert!(meta.drive_folder_path().is_err());
    }

    #[test]
    fn test_drive_prefix_contains_root() {
        let prefix = scope().drive_prefix(&drive()).unwrap();
        let root = scope().drive_root(&drive()).unwrap();
        assert!(prefix.is_prefix_of(&root));
    }

    #[test]
    fn test_scope_validation() {
        assert!(ResourceScope::new("", "user", Service::OneDrive, Category::Files).is_err());
        assert!(ResourceScope::new("t", "", Service::SharePoint, Category::Libraries).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let p = scope().drive_root(&drive()).unwrap().append("x").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        let back: BackupPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
