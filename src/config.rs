//! Optimizer configuration.
//!
//! Handles loading, validating, and merging `first-packet.toml`. Stock
//! defaults are the base layer; a user config file only needs the keys it
//! wants to change, and CLI flags override both.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [paths]
//! static_dir = "static"       # Asset root scanned for CSS/JS/images
//! templates_dir = "templates" # HTML templates to optimize
//! output_dir = "dist"         # Bundles, rewritten templates, reports
//! cache_dir = ".first-packet-cache"
//!
//! [build]
//! enable_build_cache = true
//! watch_mode = false
//! watch_interval_secs = 2
//! build_timeout_secs = 300
//! stage_timeout_secs = 60
//! max_retries = 2
//! parallel_stages = true
//! validate_compliance = true
//!
//! [budget]
//! critical_bytes = 14336      # Compressed ceiling for critical bundles and pages
//! chunk_bytes = 32768         # Split size for non-critical bundles
//! hash_suffix = true          # Append content hash to bundle file names
//!
//! [assets]
//! extensions = ["css", "js", "png", "jpg", "jpeg", "gif", "webp", "svg"]
//! critical_patterns = ["critical", "main", "hero"]
//!
//! [compression]
//! algorithm = "brotli"        # "gzip" or "brotli"
//! level = 9                   # gzip 0-9, brotli 0-11
//!
//! [cache]
//! ttl_secs = 86400
//! max_entries = 512
//! sweep_interval_secs = 300
//!
//! [processing]
//! max_processes = 4           # Max parallel workers (omit for auto = CPU cores)
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::compress::Algorithm;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name looked up in the working directory when no `--config` is given.
pub const CONFIG_FILENAME: &str = "first-packet.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Top-level optimizer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    pub paths: PathsConfig,
    pub build: BuildConfig,
    pub budget: BudgetConfig,
    pub assets: AssetsConfig,
    pub compression: CompressionConfig,
    pub cache: CacheConfig,
    pub processing: ProcessingConfig,
}

impl OptimizerConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_level = self.compression.algorithm.max_level();
        if self.compression.level > max_level {
            return Err(ConfigError::Validation(format!(
                "compression.level must be 0-{} for {}",
                max_level, self.compression.algorithm
            )));
        }
        if self.budget.critical_bytes == 0 {
            return Err(ConfigError::Validation(
                "budget.critical_bytes must be non-zero".into(),
            ));
        }
        if self.budget.chunk_bytes == 0 {
            return Err(ConfigError::Validation(
                "budget.chunk_bytes must be non-zero".into(),
            ));
        }
        if self.assets.extensions.is_empty() {
            return Err(ConfigError::Validation(
                "assets.extensions must not be empty".into(),
            ));
        }
        if self.build.build_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "build.build_timeout_secs must be non-zero".into(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Validation(
                "cache.max_entries must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build.build_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.build.stage_timeout_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.build.watch_interval_secs.max(1))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.paths.output_dir.join("reports")
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.paths.output_dir.join("bundles")
    }

    pub fn templates_output_dir(&self) -> PathBuf {
        self.paths.output_dir.join("templates")
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub static_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            static_dir: PathBuf::from("static"),
            templates_dir: PathBuf::from("templates"),
            output_dir: PathBuf::from("dist"),
            cache_dir: PathBuf::from(".first-packet-cache"),
        }
    }
}

/// Pipeline execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub enable_build_cache: bool,
    /// Poll the static and template trees and rebuild on change.
    pub watch_mode: bool,
    pub watch_interval_secs: u64,
    /// Ceiling for the whole build; each stage gets at most what is left.
    pub build_timeout_secs: u64,
    pub stage_timeout_secs: u64,
    /// Retries per stage after the first attempt.
    pub max_retries: u32,
    /// Run consecutive parallelizable stages concurrently.
    pub parallel_stages: bool,
    pub validate_compliance: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enable_build_cache: true,
            watch_mode: false,
            watch_interval_secs: 2,
            build_timeout_secs: 300,
            stage_timeout_secs: 60,
            max_retries: 2,
            parallel_stages: true,
            validate_compliance: true,
        }
    }
}

/// The first-packet byte budget and chunking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    /// Compressed ceiling for critical bundles and optimized pages.
    pub critical_bytes: usize,
    /// Uncompressed ceiling for each chunk of a non-critical bundle.
    pub chunk_bytes: usize,
    /// Append a short content hash to bundle file names for cache-busting.
    pub hash_suffix: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            critical_bytes: 14336,
            chunk_bytes: 32768,
            hash_suffix: true,
        }
    }
}

/// Asset discovery and classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AssetsConfig {
    /// File extensions (without dot) included in the catalog.
    pub extensions: Vec<String>,
    /// Substrings of the relative path that mark an asset critical. Earlier
    /// entries rank higher when the critical bundle has to shed assets.
    pub critical_patterns: Vec<String>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            extensions: ["css", "js", "png", "jpg", "jpeg", "gif", "webp", "svg"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            critical_patterns: ["critical", "main", "hero"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CompressionConfig {
    pub algorithm: Algorithm,
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Brotli,
            level: 9,
        }
    }
}

/// Build cache retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
    /// How often the background sweep prunes expired entries.
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86400,
            max_entries: 512,
            sweep_interval_secs: 300,
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel hashing/compression workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_processes
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    toml::Value::try_from(OptimizerConfig::default())
        .map_err(|e| ConfigError::Validation(format!("default config must serialize: {e}")))
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value. `Ok(None)` when it doesn't exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto the stock defaults, then deserialize and validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<OptimizerConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: OptimizerConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a TOML file, falling back to defaults when it is absent.
pub fn load_config(path: &Path) -> Result<OptimizerConfig, ConfigError> {
    resolve_config(load_raw_config(path)?)
}

/// Returns a fully-commented stock `first-packet.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# first-packet configuration
# ==========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Filesystem locations
# ---------------------------------------------------------------------------
[paths]
static_dir = "static"
templates_dir = "templates"
# Receives bundles/, templates/ and reports/.
output_dir = "dist"
cache_dir = ".first-packet-cache"

# ---------------------------------------------------------------------------
# Pipeline execution
# ---------------------------------------------------------------------------
[build]
enable_build_cache = true
# Poll the static and template trees and rebuild on change.
watch_mode = false
watch_interval_secs = 2
# Ceiling for the whole build; each stage gets at most what is left.
build_timeout_secs = 300
stage_timeout_secs = 60
# Retries per stage after the first attempt (linear backoff, 1s per attempt).
max_retries = 2
# Run consecutive parallelizable stages (content rewrites) concurrently.
parallel_stages = true
validate_compliance = true

# ---------------------------------------------------------------------------
# First-packet budget
# ---------------------------------------------------------------------------
[budget]
# Compressed ceiling for critical bundles and optimized pages.
critical_bytes = 14336
# Uncompressed ceiling for each chunk of a non-critical bundle.
chunk_bytes = 32768
hash_suffix = true

# ---------------------------------------------------------------------------
# Asset discovery
# ---------------------------------------------------------------------------
[assets]
extensions = ["css", "js", "png", "jpg", "jpeg", "gif", "webp", "svg"]
# Path substrings marking an asset critical; earlier entries rank higher.
critical_patterns = ["critical", "main", "hero"]

# ---------------------------------------------------------------------------
# Compression
# ---------------------------------------------------------------------------
[compression]
# "gzip" (level 0-9) or "brotli" (level 0-11)
algorithm = "brotli"
level = 9

# ---------------------------------------------------------------------------
# Build cache
# ---------------------------------------------------------------------------
[cache]
ttl_secs = 86400
max_entries = 512
sweep_interval_secs = 300

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel hashing/compression workers.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_processes = 4
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_budget() {
        let config = OptimizerConfig::default();
        assert_eq!(config.budget.critical_bytes, 14336);
        assert_eq!(config.budget.chunk_bytes, 32768);
    }

    #[test]
    fn default_extensions_cover_web_assets() {
        let config = OptimizerConfig::default();
        for ext in ["css", "js", "png", "jpg", "jpeg", "gif", "webp", "svg"] {
            assert!(config.assets.extensions.iter().any(|e| e == ext), "{ext}");
        }
    }

    #[test]
    fn default_config_validates() {
        OptimizerConfig::default().validate().unwrap();
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[budget]
critical_bytes = 10000
"#;
        let config: OptimizerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.budget.critical_bytes, 10000);
        // Defaults preserved
        assert_eq!(config.budget.chunk_bytes, 32768);
        assert!(config.build.parallel_stages);
    }

    #[test]
    fn unknown_keys_rejected() {
        let toml = r#"
[budget]
critical_kb = 14
"#;
        let result: Result<OptimizerConfig, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_gzip_level() {
        let mut config = OptimizerConfig::default();
        config.compression.algorithm = Algorithm::Gzip;
        config.compression.level = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn validate_accepts_brotli_eleven() {
        let mut config = OptimizerConfig::default();
        config.compression.algorithm = Algorithm::Brotli;
        config.compression.level = 11;
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_budget() {
        let mut config = OptimizerConfig::default();
        config.budget.critical_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn merge_overlay_keeps_base_keys() {
        let base: toml::Value = toml::from_str("[a]\nx = 1\ny = 2").unwrap();
        let overlay: toml::Value = toml::from_str("[a]\ny = 3").unwrap();
        let merged = merge_toml(base, overlay);
        assert_eq!(merged["a"]["x"].as_integer(), Some(1));
        assert_eq!(merged["a"]["y"].as_integer(), Some(3));
    }

    #[test]
    fn load_config_returns_default_when_no_file() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join(CONFIG_FILENAME)).unwrap();
        assert_eq!(config, OptimizerConfig::default());
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILENAME);
        fs::write(
            &path,
            r#"
[compression]
algorithm = "gzip"
level = 6

[build]
parallel_stages = false
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.compression.algorithm, Algorithm::Gzip);
        assert_eq!(config.compression.level, 6);
        assert!(!config.build.parallel_stages);
        assert!(config.build.enable_build_cache);
    }

    #[test]
    fn load_config_invalid_values_fail_validation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILENAME);
        fs::write(&path, "[budget]\nchunk_bytes = 0\n").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn stock_config_toml_parses_to_defaults() {
        let config: OptimizerConfig = toml::from_str(stock_config_toml()).unwrap();
        assert_eq!(config, OptimizerConfig::default());
    }

    #[test]
    fn effective_threads_clamps_to_cores() {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let config = ProcessingConfig {
            max_processes: Some(cores + 64),
        };
        assert_eq!(effective_threads(&config), cores);
        let auto = ProcessingConfig::default();
        assert_eq!(effective_threads(&auto), cores);
    }
}
