//! Core configuration
//!
//! Recognized options and their defaults mirror the discovery core's
//! documented configuration surface. Configuration is loaded from a JSON
//! file when one exists and falls back to defaults otherwise.

use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PmError, Result};

/// Selector scoring weights
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SelectorWeights {
    /// Score per matched capability tag
    #[serde(default = "default_w_cap")]
    pub w_cap: f64,

    /// Scale applied to the keyword match ratio
    #[serde(default = "default_w_kw")]
    pub w_kw: f64,

    /// Score per intersecting specialization tag
    #[serde(default = "default_w_spec")]
    pub w_spec: f64,
}

fn default_w_cap() -> f64 {
    3.0
}

fn default_w_kw() -> f64 {
    2.0
}

fn default_w_spec() -> f64 {
    4.0
}

impl Default for SelectorWeights {
    fn default() -> Self {
        Self {
            w_cap: default_w_cap(),
            w_kw: default_w_kw(),
            w_spec: default_w_spec(),
        }
    }
}

/// Configuration for the discovery core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Name of the hidden directory searched in each tier
    #[serde(default = "default_framework_dir_name")]
    pub framework_dir_name: String,

    /// Max depth for the ancestor walk
    #[serde(default = "default_ancestor_walk_cap")]
    pub ancestor_walk_cap: u32,

    /// Max files per directory considered by the scanner
    #[serde(default = "default_scanner_max_entries")]
    pub scanner_max_entries: usize,

    /// Prompt cache byte budget
    #[serde(default = "default_cache_byte_cap")]
    pub cache_byte_cap: usize,

    /// Prompt cache TTL in seconds
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Modification coalescing window in milliseconds
    #[serde(default = "default_tracker_debounce_ms")]
    pub tracker_debounce_ms: u64,

    /// Poll interval when no filesystem notifier is available
    #[serde(default = "default_tracker_poll_fallback_seconds")]
    pub tracker_poll_fallback_seconds: u64,

    /// Activity queue bound
    #[serde(default = "default_reporter_queue_cap")]
    pub reporter_queue_cap: usize,

    /// Selector weight overrides
    #[serde(default)]
    pub selector_weights: SelectorWeights,

    /// Bundled system-tier agents directory, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub system_agents_dir: Option<PathBuf>,

    /// Deadline for `list_agents` in milliseconds
    #[serde(default = "default_list_deadline_ms")]
    pub list_deadline_ms: u64,

    /// Deadline for `load_agent` in milliseconds
    #[serde(default = "default_load_deadline_ms")]
    pub load_deadline_ms: u64,

    /// Deadline for `select_agent` in milliseconds
    #[serde(default = "default_select_deadline_ms")]
    pub select_deadline_ms: u64,

    /// Reporter flush budget on `stop`, in milliseconds
    #[serde(default = "default_stop_flush_ms")]
    pub stop_flush_ms: u64,
}

fn default_framework_dir_name() -> String {
    ".claude-pm".to_string()
}

fn default_ancestor_walk_cap() -> u32 {
    8
}

fn default_scanner_max_entries() -> usize {
    1000
}

fn default_cache_byte_cap() -> usize {
    16 * 1024 * 1024
}

fn default_cache_ttl_seconds() -> u64 {
    600
}

fn default_tracker_debounce_ms() -> u64 {
    200
}

fn default_tracker_poll_fallback_seconds() -> u64 {
    30
}

fn default_reporter_queue_cap() -> usize {
    10_000
}

fn default_list_deadline_ms() -> u64 {
    5000
}

fn default_load_deadline_ms() -> u64 {
    2000
}

fn default_select_deadline_ms() -> u64 {
    500
}

fn default_stop_flush_ms() -> u64 {
    2000
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            framework_dir_name: default_framework_dir_name(),
            ancestor_walk_cap: default_ancestor_walk_cap(),
            scanner_max_entries: default_scanner_max_entries(),
            cache_byte_cap: default_cache_byte_cap(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            tracker_debounce_ms: default_tracker_debounce_ms(),
            tracker_poll_fallback_seconds: default_tracker_poll_fallback_seconds(),
            reporter_queue_cap: default_reporter_queue_cap(),
            selector_weights: SelectorWeights::default(),
            system_agents_dir: None,
            list_deadline_ms: default_list_deadline_ms(),
            load_deadline_ms: default_load_deadline_ms(),
            select_deadline_ms: default_select_deadline_ms(),
            stop_flush_ms: default_stop_flush_ms(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a specific path
    ///
    /// A missing file yields defaults; unknown fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| PmError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let config: Self = serde_json::from_str(&contents).map_err(|e| PmError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate option ranges
    ///
    /// # Errors
    ///
    /// Returns an error when a bound that must be positive is zero.
    pub fn validate(&self) -> Result<()> {
        if self.framework_dir_name.is_empty() {
            return Err(PmError::ConfigValidation(
                "framework_dir_name must not be empty".to_string(),
            ));
        }
        if self.cache_byte_cap == 0 {
            return Err(PmError::ConfigValidation(
                "cache_byte_cap must be positive".to_string(),
            ));
        }
        if self.reporter_queue_cap == 0 {
            return Err(PmError::ConfigValidation(
                "reporter_queue_cap must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Relative path of the agents directory under a tier root
    #[must_use]
    pub fn agents_subdir(&self) -> PathBuf {
        PathBuf::from(&self.framework_dir_name).join("agents")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.framework_dir_name, ".claude-pm");
        assert_eq!(config.ancestor_walk_cap, 8);
        assert_eq!(config.scanner_max_entries, 1000);
        assert_eq!(config.cache_byte_cap, 16 * 1024 * 1024);
        assert_eq!(config.cache_ttl_seconds, 600);
        assert_eq!(config.tracker_debounce_ms, 200);
        assert_eq!(config.tracker_poll_fallback_seconds, 30);
        assert_eq!(config.reporter_queue_cap, 10_000);
        assert_eq!(config.selector_weights, SelectorWeights::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = CoreConfig::load_from_path(&temp.path().join("nope.json")).unwrap();
        assert_eq!(config.ancestor_walk_cap, 8);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("core.json");
        std::fs::write(&path, r#"{"ancestor_walk_cap": 2, "unknown_key": true}"#).unwrap();

        let config = CoreConfig::load_from_path(&path).unwrap();
        assert_eq!(config.ancestor_walk_cap, 2);
        assert_eq!(config.framework_dir_name, ".claude-pm");
    }

    #[test]
    fn malformed_file_is_config_parse() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("core.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = CoreConfig::load_from_path(&path).unwrap_err();
        assert_eq!(err.kind(), "config_parse");
    }

    #[test]
    fn zero_cache_cap_rejected() {
        let config = CoreConfig {
            cache_byte_cap: 0,
            ..CoreConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), "config_validation");
    }

    #[test]
    fn weight_overrides_apply() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("core.json");
        std::fs::write(&path, r#"{"selector_weights": {"w_cap": 5.0}}"#).unwrap();

        let config = CoreConfig::load_from_path(&path).unwrap();
        assert_eq!(config.selector_weights.w_cap, 5.0);
        assert_eq!(config.selector_weights.w_kw, 2.0);
    }
}
