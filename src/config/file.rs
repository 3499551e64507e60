//! JSON override files for library monitoring config.
//!
//! Format: a top-level object keyed by library name, each value a partial
//! config. Unknown fields are rejected so typos fail at startup.
//!
//! ```json
//! {
//!   "gallica": { "stuck_threshold_minutes": 3.0 },
//!   "internet-culturale": { "timeout_multiplier": 3.0, "auto_split_threshold_pages": 250 }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{info, instrument};

use super::{ConfigError, LibraryConfigPatch, MonitoringConfig, normalize_library};

impl MonitoringConfig {
    /// Loads persistent overrides from a JSON file.
    ///
    /// All entries are validated before any is installed, so a bad file
    /// leaves the config untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`], [`ConfigError::Parse`], or
    /// [`ConfigError::InvalidValue`].
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load_overrides_from_file(&self, path: &Path) -> Result<usize, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let patches: BTreeMap<String, LibraryConfigPatch> =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        self.apply_overrides(patches)
    }

    /// Same as [`load_overrides_from_file`](Self::load_overrides_from_file) for an in-memory string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::InvalidValue`].
    pub fn load_overrides_from_str(&self, raw: &str) -> Result<usize, ConfigError> {
        let patches: BTreeMap<String, LibraryConfigPatch> =
            serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
                path: std::path::PathBuf::new(),
                source,
            })?;
        self.apply_overrides(patches)
    }

    fn apply_overrides(
        &self,
        patches: BTreeMap<String, LibraryConfigPatch>,
    ) -> Result<usize, ConfigError> {
        let mut merged = Vec::with_capacity(patches.len());
        for (library, patch) in patches {
            let key = normalize_library(&library);
            let config = patch.apply(self.get_library_config(&key));
            config.validate(&key)?;
            merged.push((key, config));
        }

        let count = merged.len();
        for (library, config) in merged {
            self.install_persistent(library, config);
        }
        info!(count, "library config overrides loaded");
        Ok(count)
    }
}
