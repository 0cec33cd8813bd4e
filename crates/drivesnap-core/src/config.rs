//! Configuration module for DriveSnap.
//!
//! The YAML file carries backup tuning (delta tree toggle, parallelism, query
//! budgets), preview limits, URL cache lifetime, logging and the Graph endpoint.
//! Every section has defaults, so a missing file or section is not an error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for DriveSnap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backup: BackupConfig,
    pub preview: PreviewConfig,
    pub url_cache: UrlCacheConfig,
    pub logging: LoggingConfig,
    pub graph: GraphConfig,
}

/// Backup engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Reconcile delta pages through the folder tree instead of the flat maps.
    pub use_delta_tree: bool,
    /// Items fetched concurrently while a collection streams.
    pub item_parallelism: usize,
    /// Upper bound on consecutive delta queries while waiting for a quiet drive.
    pub max_delta_queries: u32,
    /// Treat the first recoverable error as a failure.
    pub fail_fast: bool,
    /// Item extensions applied to streamed content: `bytes`, `sha256`.
    pub extensions: Vec<String>,
}

/// Preview (sampled) backup limits. Zero means "use the built-in default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub enabled: bool,
    pub max_items: usize,
    pub max_items_per_container: usize,
    pub max_containers: usize,
    pub max_bytes: u64,
    pub max_pages: usize,
}

/// Download URL cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlCacheConfig {
    /// Drives below this size get a URL cache.
    pub drive_item_threshold: usize,
    /// Seconds before a populated cache is refreshed.
    pub refresh_interval_secs: u64,
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// Microsoft Graph settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub base_url: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Like [`Config::load`], but any read or parse failure yields the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Typically `$XDG_CONFIG_HOME/drivesnap/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("drivesnap")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            use_delta_tree: true,
            item_parallelism: 4,
            max_delta_queries: 100,
            fail_fast: false,
            extensions: Vec::new(),
        }
    }
}

impl Default for UrlCacheConfig {
    fn default() -> Self {
        Self {
            drive_item_threshold: 300_000,
            refresh_interval_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// One invalid field, addressed by its dotted YAML path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"backup.item_parallelism"`.
    pub field: String,
    /// What is wrong with the value
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `backup.extensions`.
pub const VALID_EXTENSIONS: &[&str] = &["bytes", "sha256"];

impl Config {
    /// Checks every section and collects all problems.
    ///
    /// Returns an empty vector for a usable configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- backup ---
        if self.backup.item_parallelism == 0 || self.backup.item_parallelism > 64 {
            errors.push(ValidationError {
                field: "backup.item_parallelism".into(),
                message: "must be in range 1..=64".into(),
            });
        }
        if self.backup.max_delta_queries == 0 {
            errors.push(ValidationError {
                field: "backup.max_delta_queries".into(),
                message: "must be greater than 0".into(),
            });
        }
        for ext in &self.backup.extensions {
            if !VALID_EXTENSIONS.contains(&ext.as_str()) {
                errors.push(ValidationError {
                    field: "backup.extensions".into(),
                    message: format!(
                        "invalid extension '{}'; valid options: {}",
                        ext,
                        VALID_EXTENSIONS.join(", ")
                    ),
                });
            }
        }

        // --- url_cache ---
        if self.url_cache.refresh_interval_secs == 0 {
            errors.push(ValidationError {
                field: "url_cache.refresh_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        // --- graph ---
        if !self.graph.base_url.starts_with("http://") && !self.graph.base_url.starts_with("https://")
        {
            errors.push(ValidationError {
                field: "graph.base_url".into(),
                message: format!("must be an http(s) URL: {}", self.graph.base_url),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Used by tests and embedders that do not read a file.
///
/// # Example
///
/// ```rust,no_run
/// use drivesnap_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .use_delta_tree(false)
///     .preview_enabled(true)
///     .preview_max_items(100)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Starts from the defaults.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- backup ---

    pub fn use_delta_tree(mut self, enabled: bool) -> Self {
        self.config.backup.use_delta_tree = enabled;
        self
    }

    pub fn item_parallelism(mut self, n: usize) -> Self {
        self.config.backup.item_parallelism = n;
        self
    }

    pub fn max_delta_queries(mut self, n: u32) -> Self {
        self.config.backup.max_delta_queries = n;
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.config.backup.fail_fast = enabled;
        self
    }

    pub fn extension(mut self, name: impl Into<String>) -> Self {
        self.config.backup.extensions.push(name.into());
        self
    }

    // --- preview ---

    pub fn preview_enabled(mut self, enabled: bool) -> Self {
        self.config.preview.enabled = enabled;
        self
    }

    pub fn preview_max_items(mut self, n: usize) -> Self {
        self.config.preview.max_items = n;
        self
    }

    pub fn preview_max_items_per_container(mut self, n: usize) -> Self {
        self.config.preview.max_items_per_container = n;
        self
    }

    pub fn preview_max_containers(mut self, n: usize) -> Self {
        self.config.preview.max_containers = n;
        self
    }

    pub fn preview_max_bytes(mut self, n: u64) -> Self {
        self.config.preview.max_bytes = n;
        self
    }

    pub fn preview_max_pages(mut self, n: usize) -> Self {
        self.config.preview.max_pages = n;
        self
    }

    // --- url_cache ---

    pub fn url_cache_drive_item_threshold(mut self, n: usize) -> Self {
        self.config.url_cache.drive_item_threshold = n;
        self
    }

    pub fn url_cache_refresh_interval_secs(mut self, secs: u64) -> Self {
        self.config.url_cache.refresh_interval_secs = secs;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- graph ---

    pub fn graph_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.graph.base_url = url.into();
        self
    }

    // --- build ---

    /// Returns the configuration without validating it.
    pub fn build(self) -> Config {
        self.config
    }

    /// # Errors
    /// Returns every [`ValidationError`] found by [`Config::validate`]
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
