//! Preview backup limits
//!
//! A preview backup samples a drive instead of copying all of it. The
//! [`Limiter`] answers whether running counters have reached the configured
//! caps; callers decide whether that means stopping enumeration, skipping an
//! item, or refusing a new container. A disabled limiter never reports a
//! limit.

use drivesnap_core::config::PreviewConfig;

pub const DEFAULT_PREVIEW_MAX_CONTAINERS: usize = 50;
pub const DEFAULT_PREVIEW_MAX_ITEMS_PER_CONTAINER: usize = 50;
pub const DEFAULT_PREVIEW_MAX_ITEMS: usize = 500;
pub const DEFAULT_PREVIEW_MAX_BYTES: u64 = 500 * 1024 * 1024;
pub const DEFAULT_PREVIEW_MAX_PAGES: usize = 50;

/// Effective caps after default substitution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewLimits {
    pub max_containers: usize,
    pub max_items_per_container: usize,
    pub max_items: usize,
    pub max_bytes: u64,
    pub max_pages: usize,
}

/// Running counters of one drive's enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    /// Files accepted so far
    pub files: usize,
    /// Live containers so far
    pub containers: usize,
    /// Pages that carried at least one item
    pub pages: usize,
    /// Bytes accepted so far. Callers pass the prospective total when
    /// asking whether one more file still fits.
    pub bytes: u64,
}

/// Preview limit policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limiter {
    enabled: bool,
    limits: PreviewLimits,
}

fn or_default<T: Default + PartialEq>(value: T, default: T) -> T {
    if value == T::default() {
        default
    } else {
        value
    }
}

impl Limiter {
    /// Builds a limiter; zero-valued caps fall back to the defaults.
    pub fn new(config: &PreviewConfig) -> Self {
        Self {
            enabled: config.enabled,
            limits: PreviewLimits {
                max_containers: or_default(config.max_containers, DEFAULT_PREVIEW_MAX_CONTAINERS),
                max_items_per_container: or_default(
                    config.max_items_per_container,
                    DEFAULT_PREVIEW_MAX_ITEMS_PER_CONTAINER,
                ),
                max_items: or_default(config.max_items, DEFAULT_PREVIEW_MAX_ITEMS),
                max_bytes: or_default(config.max_bytes, DEFAULT_PREVIEW_MAX_BYTES),
                max_pages: or_default(config.max_pages, DEFAULT_PREVIEW_MAX_PAGES),
            },
        }
    }

    /// A limiter that never reports a limit.
    pub fn disabled() -> Self {
        Self::new(&PreviewConfig::default())
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn effective_limits(&self) -> PreviewLimits {
        self.limits
    }

    #[must_use]
    pub fn at_item_limit(&self, stats: &LimiterStats) -> bool {
        self.enabled && stats.files >= self.limits.max_items
    }

    /// `current_count` is the number of items already in the container.
    /// Callers must not ask for items the container already holds.
    #[must_use]
    pub fn at_container_items_limit(&self, current_count: usize) -> bool {
        self.enabled && current_count >= self.limits.max_items_per_container
    }

    #[must_use]
    pub fn at_page_limit(&self, stats: &LimiterStats) -> bool {
        self.enabled && stats.pages >= self.limits.max_pages
    }

    #[must_use]
    pub fn at_container_limit(&self, stats: &LimiterStats) -> bool {
        self.enabled && stats.containers >= self.limits.max_containers
    }

    #[must_use]
    pub fn at_byte_limit(&self, stats: &LimiterStats) -> bool {
        self.enabled && stats.bytes > self.limits.max_bytes
    }

    /// Any of the item, page, container, or byte limits.
    #[must_use]
    pub fn at_limit(&self, stats: &LimiterStats) -> bool {
        self.at_item_limit(stats)
            || self.at_page_limit(stats)
            || self.at_container_limit(stats)
            || self.at_byte_limit(stats)
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::disabled()
    }
}
