use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;

use crate::clock::date_label;
use crate::error::EngineError;
use crate::fsutil;

/// Root configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TallyConfig {
    /// HTTP API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Allow cross-origin requests on the HTTP API.
    #[serde(default)]
    pub cors_enabled: bool,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub access: AccessConfig,
}

fn default_api_port() -> u16 {
    9200
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            cors_enabled: false,
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            archive: ArchiveConfig::default(),
            access: AccessConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Storage
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory: `<file_dir>/<date>/<name>.csv`, `<file_dir>/<date>.zip`.
    #[serde(default = "default_file_dir")]
    pub file_dir: PathBuf,
    /// chrono format string for date labels.
    #[serde(default = "default_date_format")]
    pub date_format: String,
}

fn default_file_dir() -> PathBuf {
    PathBuf::from("data/statistics")
}
fn default_date_format() -> String {
    "%Y%m%d".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_dir: default_file_dir(),
            date_format: default_date_format(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Cache (write buffer + flush scheduler)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Flush tick period.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Live key count above which size-bound eviction kicks in.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Share of live keys drained by one eviction pass.
    #[serde(default = "default_eviction_fraction")]
    pub eviction_fraction: f64,
    /// Upper bound for the final drain on shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    60_000
}
fn default_max_size() -> usize {
    10_000
}
fn default_eviction_fraction() -> f64 {
    0.25
}
fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            max_size: default_max_size(),
            eviction_fraction: default_eviction_fraction(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl CacheConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Archive
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Consecutive failures after which a pending label is dropped. 0 = never.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base retry delay, doubled per consecutive failure (capped at 64x).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_retry_backoff_ms() -> u64 {
    60_000
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ArchiveConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Access guard
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// When false every request is allowed and the poller is not started.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Allowlist file (TOML `ips = [...]`, or JSON when it ends in `.json`).
    #[serde(default = "default_allowlist_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Always admit loopback addresses.
    #[serde(default = "default_true")]
    pub allow_localhost: bool,
}

fn default_true() -> bool {
    true
}
fn default_allowlist_path() -> PathBuf {
    PathBuf::from("config/ips.toml")
}
fn default_poll_interval_ms() -> u64 {
    5_000
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config_path: default_allowlist_path(),
            poll_interval_ms: default_poll_interval_ms(),
            allow_localhost: true,
        }
    }
}

impl AccessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Loading
// ═══════════════════════════════════════════════════════════════

impl TallyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content).map_err(|e| e.with_context(path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.storage.file_dir.as_os_str().is_empty() {
            return Err(EngineError::Config("storage.file_dir must not be empty".into()));
        }
        if self.storage.date_format.is_empty() {
            return Err(EngineError::Config("storage.date_format must not be empty".into()));
        }
        validate_date_format(&self.storage.date_format)?;
        if self.cache.max_size == 0 {
            return Err(EngineError::Config("cache.max_size must be > 0".into()));
        }
        if !(self.cache.eviction_fraction > 0.0 && self.cache.eviction_fraction <= 1.0) {
            return Err(EngineError::Config(format!(
                "cache.eviction_fraction must be in (0, 1], got {}",
                self.cache.eviction_fraction
            )));
        }
        if self.cache.flush_interval_ms == 0 {
            return Err(EngineError::Config("cache.flush_interval_ms must be > 0".into()));
        }
        if self.access.enabled && self.access.poll_interval_ms == 0 {
            return Err(EngineError::Config("access.poll_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// A date label names a directory under `file_dir`, so the format must
/// render as a single plain, non-hidden path segment.
fn validate_date_format(format: &str) -> Result<(), EngineError> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(EngineError::Config(format!(
            "storage.date_format '{format}' has an invalid specifier"
        )));
    }
    let sample = date_label(&Local::now(), format);
    fsutil::validate_segment(&sample, "storage.date_format")
        .map_err(|e| EngineError::Config(e.to_string()))?;
    if sample.starts_with('.') {
        return Err(EngineError::Config(format!(
            "storage.date_format '{format}' renders a hidden name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = TallyConfig::parse("").unwrap();
        assert_eq!(cfg.api_port, 9200);
        assert_eq!(cfg.storage.date_format, "%Y%m%d");
        assert_eq!(cfg.cache.max_size, 10_000);
        assert_eq!(cfg.archive.max_attempts, 10);
        assert!(cfg.access.enabled);
        assert!(cfg.access.allow_localhost);
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = TallyConfig::parse(
            r#"
            api_port = 8080

            [storage]
            file_dir = "/var/lib/tally"

            [cache]
            flush_interval_ms = 1000
            max_size = 50
            eviction_fraction = 0.5

            [access]
            enabled = false
            config_path = "ips.json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.api_port, 8080);
        assert_eq!(cfg.storage.file_dir, PathBuf::from("/var/lib/tally"));
        assert_eq!(cfg.cache.flush_interval(), Duration::from_secs(1));
        assert_eq!(cfg.cache.max_size, 50);
        assert!(!cfg.access.enabled);
        assert_eq!(cfg.access.config_path, PathBuf::from("ips.json"));
    }

    #[test]
    fn rejects_bad_eviction_fraction() {
        let err = TallyConfig::parse("[cache]\neviction_fraction = 1.5").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn rejects_zero_max_size() {
        assert!(TallyConfig::parse("[cache]\nmax_size = 0").is_err());
    }

    #[test]
    fn date_format_must_render_one_segment() {
        for bad in ["%Y/%m/%d", "%Y\\%m", "..", ".%Y", "%Y%"] {
            let doc = format!("[storage]\ndate_format = '{bad}'");
            let err = TallyConfig::parse(&doc).unwrap_err();
            assert!(matches!(err, EngineError::Config(_)), "{bad}");
        }
        let cfg = TallyConfig::parse("[storage]\ndate_format = '%Y-%m-%d'").unwrap();
        assert_eq!(cfg.storage.date_format, "%Y-%m-%d");
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = TallyConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
