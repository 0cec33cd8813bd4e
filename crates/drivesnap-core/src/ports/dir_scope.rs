//! Directory selection port
//!
//! Decides which drive folders take part in a backup. Folder paths are
//! drive-relative (`Documents/Taxes`); the drive root is the empty string.

use crate::domain::errors::DomainError;

/// Folder selector consulted before a folder becomes a collection
pub trait DirScope: Send + Sync {
    /// True when every folder is selected
    fn is_all_pass(&self) -> bool;

    /// True when `dir` is selected
    fn includes_dir(&self, dir: &str) -> bool;
}

/// Selects every folder
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPass;

impl DirScope for AllPass {
    fn is_all_pass(&self) -> bool {
        true
    }

    fn includes_dir(&self, _dir: &str) -> bool {
        true
    }
}

/// Selects folders matching any glob pattern, together with their descendants
#[derive(Debug, Clone)]
pub struct GlobScope {
    patterns: Vec<glob::Pattern>,
}

impl GlobScope {
    /// Compiles the given patterns
    ///
    /// # Errors
    /// Returns [`DomainError::ValidationFailed`] for an invalid pattern
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, DomainError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref().trim_matches('/');
                glob::Pattern::new(p)
                    .map_err(|e| DomainError::ValidationFailed(format!("invalid pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }

    fn matches(&self, dir: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(dir))
    }
}

impl DirScope for GlobScope {
    fn is_all_pass(&self) -> bool {
        self.patterns.iter().any(|p| p.as_str() == "*" || p.as_str() == "**")
    }

    fn includes_dir(&self, dir: &str) -> bool {
        let dir = dir.trim_matches('/');
        if self.matches(dir) {
            return true;
        }

        // Descendants of a selected folder are selected too.
        dir.match_indices('/')
            .any(|(idx, _)| self.matches(&dir[..idx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_pass() {
        assert!(AllPass.is_all_pass());
        assert!(AllPass.includes_dir(""));
        assert!(AllPass.includes_dir("anything/at/all"));
    }

    #[test]
    fn test_glob_scope_includes_descendants() {
        let scope = GlobScope::new(&["Documents"]).unwrap();
        assert!(!scope.is_all_pass());
        assert!(scope.includes_dir("Documents"));
        assert!(scope.includes_dir("Documents/Taxes/2024"));
        assert!(!scope.includes_dir("Doc"));
        assert!(!scope.includes_dir("Pictures"));
        assert!(!scope.includes_dir(""));
    }

    #[test]
    fn test_glob_scope_wildcards() {
        let scope = GlobScope::new(&["Projects/*/src"]).unwrap();
        assert!(scope.includes_dir("Projects/alpha/src"));
        assert!(scope.includes_dir("Projects/alpha/src/lib"));
        assert!(!scope.includes_dir("Projects/alpha"));
    }

    #[test]
    fn test_glob_scope_star_is_all_pass() {
        let scope = GlobScope::new(&["*"]).unwrap();
        assert!(scope.is_all_pass());
    }

    #[test]
    fn test_glob_scope_invalid_pattern() {
        assert!(GlobScope::new(&["[unclosed"]).is_err());
    }
}
