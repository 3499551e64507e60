//! Per-library monitoring thresholds with a scoped override layer.
//!
//! This module provides [`MonitoringConfig`], the single source of monitoring
//! thresholds for every library the downloader talks to. It is constructed
//! once at startup, wrapped in `Arc`, and handed to the progress engine, the
//! timeout calculator, and the integration adapter.
//!
//! # Layers
//!
//! Lookups resolve in this order:
//! 1. Runtime overrides (installed with [`MonitoringConfig::update_library_config`])
//! 2. Built-in per-library table
//! 3. Conservative default for unrecognized libraries
//!
//! Overrides return a [`ConfigOverrideGuard`] which restores the prior value
//! when dropped, so a temporary override cannot leak into unrelated callers.
//!
//! # Example
//!
//! ```
//! use manuscript_monitor::config::{LibraryConfigPatch, MonitoringConfig};
//!
//! let config = MonitoringConfig::new();
//! let before = config.get_library_config("gallica");
//! {
//!     let _guard = config
//!         .update_library_config(
//!             "gallica",
//!             LibraryConfigPatch {
//!                 stuck_threshold_minutes: Some(0.5),
//!                 ..LibraryConfigPatch::default()
//!             },
//!         )
//!         .unwrap();
//!     assert_eq!(config.get_library_config("gallica").stuck_threshold_minutes, 0.5);
//! }
//! assert_eq!(config.get_library_config("gallica"), before);
//! ```

mod error;
mod file;
mod libraries;
mod recommendation;

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

pub use error::ConfigError;
pub use recommendation::{DownloadRecommendation, RecommendationAction};

use libraries::{BUILTIN_LIBRARIES, DEFAULT_LIBRARY_CONFIG};

/// Monitoring thresholds for one library.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LibraryMonitoringConfig {
    /// Base session timeout before multipliers are applied.
    pub base_timeout_minutes: f64,
    /// Library-specific scaling applied to every timeout.
    pub timeout_multiplier: f64,
    /// Average speed (pages/min) under which a session counts as slow.
    pub slow_progress_threshold: f64,
    /// Minutes without an advancing snapshot before a session counts as stuck.
    pub stuck_threshold_minutes: f64,
    /// Manuscripts above this page count are candidates for splitting.
    pub auto_split_threshold_pages: u32,
}

impl LibraryMonitoringConfig {
    /// Creates a config from raw values. Use [`validate`](Self::validate) before trusting input.
    #[must_use]
    pub const fn new(
        base_timeout_minutes: f64,
        timeout_multiplier: f64,
        slow_progress_threshold: f64,
        stuck_threshold_minutes: f64,
        auto_split_threshold_pages: u32,
    ) -> Self {
        Self {
            base_timeout_minutes,
            timeout_multiplier,
            slow_progress_threshold,
            stuck_threshold_minutes,
            auto_split_threshold_pages,
        }
    }

    /// Stuck threshold as a [`Duration`].
    #[must_use]
    pub fn stuck_threshold(&self) -> Duration {
        minutes_to_duration(self.stuck_threshold_minutes)
    }

    /// Session timeout for a manuscript with the given page-count multiplier.
    ///
    /// `base_timeout_minutes * timeout_multiplier * page_count_multiplier` minutes.
    #[must_use]
    pub fn effective_timeout(&self, page_count_multiplier: u32) -> Duration {
        minutes_to_duration(
            self.base_timeout_minutes * self.timeout_multiplier * f64::from(page_count_multiplier),
        )
    }

    /// Checks that every threshold is finite and strictly positive.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending field.
    pub fn validate(&self, library: &str) -> Result<(), ConfigError> {
        validate_positive(library, "base_timeout_minutes", self.base_timeout_minutes)?;
        validate_positive(library, "timeout_multiplier", self.timeout_multiplier)?;
        validate_positive(
            library,
            "slow_progress_threshold",
            self.slow_progress_threshold,
        )?;
        validate_positive(
            library,
            "stuck_threshold_minutes",
            self.stuck_threshold_minutes,
        )?;
        if self.auto_split_threshold_pages == 0 {
            return Err(ConfigError::invalid_value(
                library,
                "auto_split_threshold_pages",
                self.auto_split_threshold_pages,
                "an integer >= 1",
            ));
        }
        Ok(())
    }
}

fn validate_positive(library: &str, field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(
            library,
            field,
            value,
            "a finite number > 0",
        ))
    }
}

fn minutes_to_duration(minutes: f64) -> Duration {
    Duration::try_from_secs_f64(minutes * 60.0).unwrap_or(Duration::MAX)
}

/// Partial update for a [`LibraryMonitoringConfig`]; `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LibraryConfigPatch {
    pub base_timeout_minutes: Option<f64>,
    pub timeout_multiplier: Option<f64>,
    pub slow_progress_threshold: Option<f64>,
    pub stuck_threshold_minutes: Option<f64>,
    pub auto_split_threshold_pages: Option<u32>,
}

impl LibraryConfigPatch {
    /// Returns `base` with every `Some` field of this patch applied.
    #[must_use]
    pub fn apply(&self, base: LibraryMonitoringConfig) -> LibraryMonitoringConfig {
        LibraryMonitoringConfig {
            base_timeout_minutes: self
                .base_timeout_minutes
                .unwrap_or(base.base_timeout_minutes),
            timeout_multiplier: self.timeout_multiplier.unwrap_or(base.timeout_multiplier),
            slow_progress_threshold: self
                .slow_progress_threshold
                .unwrap_or(base.slow_progress_threshold),
            stuck_threshold_minutes: self
                .stuck_threshold_minutes
                .unwrap_or(base.stuck_threshold_minutes),
            auto_split_threshold_pages: self
                .auto_split_threshold_pages
                .unwrap_or(base.auto_split_threshold_pages),
        }
    }
}

impl From<LibraryMonitoringConfig> for LibraryConfigPatch {
    fn from(config: LibraryMonitoringConfig) -> Self {
        Self {
            base_timeout_minutes: Some(config.base_timeout_minutes),
            timeout_multiplier: Some(config.timeout_multiplier),
            slow_progress_threshold: Some(config.slow_progress_threshold),
            stuck_threshold_minutes: Some(config.stuck_threshold_minutes),
            auto_split_threshold_pages: Some(config.auto_split_threshold_pages),
        }
    }
}

/// Effective monitoring settings for one manuscript download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedMonitoringConfig {
    /// Normalized library name.
    pub library: String,
    /// Page count the settings were generated for.
    pub total_pages: u32,
    /// Library thresholds in effect at generation time.
    pub config: LibraryMonitoringConfig,
    /// Step multiplier derived from `total_pages`.
    pub page_count_multiplier: u32,
    /// Session timeout after all multipliers.
    pub effective_timeout: Duration,
}

/// Step function scaling timeouts by manuscript size.
///
/// | Pages | Multiplier |
/// |-------|------------|
/// | ≤ 100 | 1 |
/// | ≤ 300 | 2 |
/// | ≤ 450 | 3 |
/// | ≤ 700 | 4 |
/// | > 700 | 5 |
#[must_use]
pub fn page_count_multiplier(total_pages: u32) -> u32 {
    match total_pages {
        0..=100 => 1,
        101..=300 => 2,
        301..=450 => 3,
        451..=700 => 4,
        _ => 5,
    }
}

/// Normalizes a library identifier: trimmed, lower-case, `-`, `.` and spaces mapped to `_`.
///
/// ```
/// use manuscript_monitor::config::normalize_library;
///
/// assert_eq!(normalize_library("Internet-Culturale"), "internet_culturale");
/// assert_eq!(normalize_library("manuscripta.se"), "manuscripta_se");
/// ```
#[must_use]
pub fn normalize_library(library: &str) -> String {
    library
        .trim()
        .chars()
        .map(|c| match c {
            '-' | '.' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Process-wide library monitoring configuration.
///
/// Built-in values are immutable; runtime changes live in a separate override
/// layer backed by `DashMap` so lookups never block session updates.
#[derive(Debug)]
pub struct MonitoringConfig {
    default: LibraryMonitoringConfig,
    builtin: HashMap<String, LibraryMonitoringConfig>,
    overrides: DashMap<String, LibraryMonitoringConfig>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitoringConfig {
    /// Creates the config with the built-in library table and no overrides.
    #[must_use]
    pub fn new() -> Self {
        let builtin = BUILTIN_LIBRARIES
            .iter()
            .map(|(name, config)| ((*name).to_string(), *config))
            .collect();
        Self {
            default: DEFAULT_LIBRARY_CONFIG,
            builtin,
            overrides: DashMap::new(),
        }
    }

    /// Returns the conservative config applied to unrecognized libraries.
    #[must_use]
    pub fn default_config(&self) -> LibraryMonitoringConfig {
        self.default
    }

    /// Names of libraries with a dedicated built-in entry, sorted.
    #[must_use]
    pub fn known_libraries(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builtin.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the effective config for `library`, falling back to the default.
    #[must_use]
    pub fn get_library_config(&self, library: &str) -> LibraryMonitoringConfig {
        let key = normalize_library(library);
        if let Some(entry) = self.overrides.get(&key) {
            return *entry;
        }
        self.builtin.get(&key).copied().unwrap_or(self.default)
    }

    /// Merges `patch` over the current effective config for `library`.
    ///
    /// The override is effective immediately for newly created sessions.
    /// Sessions created earlier keep the timeout computed at their creation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the merged config is invalid;
    /// state is left untouched in that case.
    #[instrument(skip(self, patch), fields(library = %library))]
    pub fn update_library_config(
        &self,
        library: &str,
        patch: LibraryConfigPatch,
    ) -> Result<ConfigOverrideGuard<'_>, ConfigError> {
        let key = normalize_library(library);
        let merged = patch.apply(self.get_library_config(&key));
        merged.validate(&key)?;

        let previous = self.overrides.insert(key.clone(), merged);
        debug!(?merged, had_previous = previous.is_some(), "library config overridden");

        Ok(ConfigOverrideGuard {
            config: self,
            library: key,
            previous,
            active: true,
        })
    }

    /// Drops every runtime override for `library`, reverting to the built-in value.
    pub fn clear_override(&self, library: &str) -> bool {
        self.overrides.remove(&normalize_library(library)).is_some()
    }

    /// Generates the effective monitoring settings for a manuscript.
    #[must_use]
    pub fn generate_monitoring_config(
        &self,
        library: &str,
        total_pages: u32,
    ) -> GeneratedMonitoringConfig {
        let config = self.get_library_config(library);
        let multiplier = page_count_multiplier(total_pages);
        GeneratedMonitoringConfig {
            library: normalize_library(library),
            total_pages,
            config,
            page_count_multiplier: multiplier,
            effective_timeout: config.effective_timeout(multiplier),
        }
    }

    fn install_persistent(&self, library: String, config: LibraryMonitoringConfig) {
        info!(library = %library, ?config, "installing library config override");
        self.overrides.insert(library, config);
    }
}

/// Restores a library's previous override state when dropped.
///
/// Returned by [`MonitoringConfig::update_library_config`]. Call
/// [`persist`](Self::persist) to keep the override for the process lifetime.
#[must_use = "dropping the guard immediately restores the previous config"]
#[derive(Debug)]
pub struct ConfigOverrideGuard<'a> {
    config: &'a MonitoringConfig,
    library: String,
    previous: Option<LibraryMonitoringConfig>,
    active: bool,
}

impl ConfigOverrideGuard<'_> {
    /// Normalized name of the overridden library.
    #[must_use]
    pub fn library(&self) -> &str {
        &self.library
    }

    /// Keeps the override in place after the guard goes away.
    pub fn persist(mut self) {
        self.active = false;
    }

    /// Restores the previous value now.
    pub fn restore(self) {
        drop(self);
    }
}

impl Drop for ConfigOverrideGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match self.previous.take() {
            Some(previous) => {
                self.config.overrides.insert(self.library.clone(), previous);
            }
            None => {
                self.config.overrides.remove(&self.library);
            }
        }
        debug!(library = %self.library, "library config override restored");
    }
}
