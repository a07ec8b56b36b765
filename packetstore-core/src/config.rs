//! Configuration for storage backend selection and tuning
//!
//! The configuration is a plain value: load it once at startup with
//! [`AppConfig::load`] or [`AppConfig::load_or_default`] and pass it by
//! reference to [`crate::open_store`] and the backup scheduler. The JSON keys
//! match the deployed `config/config.json` files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

const DEFAULT_PACKETS_FILE: &str = "./packets";
const DEFAULT_MAX_OPEN: u32 = 20;
const DEFAULT_MAX_IDLE: u32 = 10;
const DEFAULT_CONN_LIFETIME_MIN: u64 = 30;
const DEFAULT_CACHE_TTL_MS: u64 = 500;
const DEFAULT_SLOW_QUERY_MS: u64 = 200;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 3000;
const DEFAULT_BACKUP_INTERVAL_SECS: u64 = 60;

/// Shortest backup interval; snapshot names only resolve to the minute
pub const MIN_BACKUP_INTERVAL_SECS: u64 = 60;

/// Enumeration of supported storage media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StorageMedia {
    /// One JSON document on the local filesystem
    #[default]
    #[serde(rename = "lfs", alias = "file", alias = "local")]
    LocalFile,
    /// Two related tables in a relational database
    #[serde(rename = "relational", alias = "mysql", alias = "sqlite")]
    Relational,
}

/// Relational backend settings
///
/// Zero values mean "use the default", so a partially filled file still works.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
    /// Primary (write) database URL
    #[serde(rename = "DSN")]
    pub dsn: String,
    /// Optional secondary (read) database URL
    #[serde(rename = "ReadDSN")]
    pub read_dsn: String,
    #[serde(rename = "MaxOpen")]
    pub max_open: u32,
    #[serde(rename = "MaxIdle")]
    pub max_idle: u32,
    #[serde(rename = "ConnMaxLifetimeMin")]
    pub conn_max_lifetime_min: u64,
    #[serde(rename = "QueryCacheTTLms")]
    pub query_cache_ttl_ms: u64,
    #[serde(rename = "SlowQueryMs")]
    pub slow_query_ms: u64,
    #[serde(rename = "QueryTimeoutMs")]
    pub query_timeout_ms: u64,
}

impl RelationalConfig {
    /// Primary URL, if configured
    pub fn primary_url(&self) -> Option<&str> {
        non_empty(&self.dsn)
    }

    /// Secondary URL, if configured
    pub fn read_url(&self) -> Option<&str> {
        non_empty(&self.read_dsn)
    }

    pub fn max_open(&self) -> u32 {
        or_default(self.max_open, DEFAULT_MAX_OPEN)
    }

    pub fn max_idle(&self) -> u32 {
        or_default(self.max_idle, DEFAULT_MAX_IDLE)
    }

    pub fn conn_max_lifetime(&self) -> Duration {
        Duration::from_secs(60 * or_default(self.conn_max_lifetime_min, DEFAULT_CONN_LIFETIME_MIN))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(or_default(self.query_cache_ttl_ms, DEFAULT_CACHE_TTL_MS))
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(or_default(self.slow_query_ms, DEFAULT_SLOW_QUERY_MS))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(or_default(self.query_timeout_ms, DEFAULT_QUERY_TIMEOUT_MS))
    }
}

/// Backup scheduler settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Seconds between snapshot/reset ticks
    #[serde(rename = "IntervalSecs")]
    pub interval_secs: u64,
    /// Directory that receives dated snapshot files; empty means the working directory
    #[serde(rename = "SnapshotDir")]
    pub snapshot_dir: String,
}

impl BackupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(or_default(self.interval_secs, DEFAULT_BACKUP_INTERVAL_SECS))
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        PathBuf::from(non_empty(&self.snapshot_dir).unwrap_or("."))
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(rename = "StorageMedia")]
    pub storage_media: StorageMedia,
    #[serde(rename = "PacketsFilePath")]
    pub packets_file_path: String,
    #[serde(rename = "MySQL")]
    pub relational: RelationalConfig,
    #[serde(rename = "Backup")]
    pub backup: BackupConfig,
}

impl AppConfig {
    /// Read and parse a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: AppConfig = serde_json::from_slice(&bytes)?;
        debug!(path = %path.as_ref().display(), media = ?config.storage_media, "Loaded configuration");
        Ok(config)
    }

    /// Read a configuration file, or fall back to defaults plus environment
    ///
    /// Environment fallbacks are applied either way, but only fill fields the
    /// file left empty.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let mut config = match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "Configuration file unavailable, using defaults"
                );
                Self::default()
            }
        };
        config.apply_env_fallbacks();
        config
    }

    /// Fill empty fields from process environment variables
    pub fn apply_env_fallbacks(&mut self) {
        self.apply_fallbacks_from(|key| std::env::var(key).ok());
    }

    /// Fill empty fields from an arbitrary variable lookup
    ///
    /// Recognised keys: `PACKETS_FILE_PATH`, `PACKETSTORE_DB_URL`,
    /// `PACKETSTORE_DB_READ_URL`, `PACKETSTORE_DB_MAX_OPEN`,
    /// `PACKETSTORE_DB_MAX_IDLE`, `PACKETSTORE_DB_CONN_LIFETIME_MIN`.
    /// `MYSQL_DSN` and `MYSQL_READ_DSN` are accepted for the two URLs when the
    /// `PACKETSTORE_` names are unset.
    pub fn apply_fallbacks_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if self.packets_file_path.is_empty() {
            if let Some(path) = lookup("PACKETS_FILE_PATH") {
                self.packets_file_path = path;
            }
        }

        let db = &mut self.relational;
        if db.dsn.is_empty() {
            if let Some(url) = lookup("PACKETSTORE_DB_URL").or_else(|| lookup("MYSQL_DSN")) {
                db.dsn = url;
            }
        }
        if db.read_dsn.is_empty() {
            if let Some(url) =
                lookup("PACKETSTORE_DB_READ_URL").or_else(|| lookup("MYSQL_READ_DSN"))
            {
                db.read_dsn = url;
            }
        }
        if db.max_open == 0 {
            db.max_open = parse_or_zero(lookup("PACKETSTORE_DB_MAX_OPEN"));
        }
        if db.max_idle == 0 {
            db.max_idle = parse_or_zero(lookup("PACKETSTORE_DB_MAX_IDLE"));
        }
        if db.conn_max_lifetime_min == 0 {
            db.conn_max_lifetime_min = parse_or_zero(lookup("PACKETSTORE_DB_CONN_LIFETIME_MIN"));
        }
    }

    /// Path of the file backend's document
    pub fn packets_file(&self) -> PathBuf {
        PathBuf::from(non_empty(&self.packets_file_path).unwrap_or(DEFAULT_PACKETS_FILE))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        match self.storage_media {
            StorageMedia::Relational => {
                if self.relational.primary_url().is_none() {
                    return Err(crate::StoreError::configuration_missing(
                        "relational backend requires a primary database URL",
                    ));
                }
            }
            StorageMedia::LocalFile => {}
        }
        if self.backup.interval() < Duration::from_secs(MIN_BACKUP_INTERVAL_SECS) {
            return Err(crate::StoreError::validation(format!(
                "IntervalSecs ({}) must be at least {MIN_BACKUP_INTERVAL_SECS}",
                self.backup.interval_secs
            )));
        }
        if self.relational.max_idle() > self.relational.max_open() {
            return Err(crate::StoreError::validation(format!(
                "MaxIdle ({}) cannot exceed MaxOpen ({})",
                self.relational.max_idle(),
                self.relational.max_open()
            )));
        }
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn or_default<T: PartialEq + Default>(value: T, default: T) -> T {
    if value == T::default() {
        default
    } else {
        value
    }
}

fn parse_or_zero<T: std::str::FromStr + Default>(value: Option<String>) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.storage_media, StorageMedia::LocalFile);
        assert_eq!(config.packets_file(), PathBuf::from("./packets"));
        assert_eq!(config.relational.max_open(), 20);
        assert_eq!(config.relational.max_idle(), 10);
        assert_eq!(config.relational.conn_max_lifetime(), Duration::from_secs(1800));
        assert_eq!(config.relational.cache_ttl(), Duration::from_millis(500));
        assert_eq!(config.relational.slow_query_threshold(), Duration::from_millis(200));
        assert_eq!(config.relational.query_timeout(), Duration::from_millis(3000));
        assert_eq!(config.backup.interval(), Duration::from_secs(60));
        assert_eq!(config.backup.snapshot_dir(), PathBuf::from("."));
    }

    #[test]
    fn test_parse_original_file_layout() {
        let json = r#"{
            "StorageMedia": "mysql",
            "PacketsFilePath": "/data/packets",
            "MySQL": {
                "DSN": "sqlite:///data/packets.db",
                "ReadDSN": "",
                "MaxOpen": 8,
                "QueryCacheTTLms": 250,
                "QueryTimeoutMs": 0
            }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.storage_media, StorageMedia::Relational);
        assert_eq!(config.packets_file(), PathBuf::from("/data/packets"));
        assert_eq!(config.relational.primary_url(), Some("sqlite:///data/packets.db"));
        assert_eq!(config.relational.read_url(), None);
        assert_eq!(config.relational.max_open(), 8);
        assert_eq!(config.relational.cache_ttl(), Duration::from_millis(250));
        assert_eq!(config.relational.query_timeout(), Duration::from_millis(3000));
    }

    #[test]
    fn test_storage_media_names() {
        let lfs: StorageMedia = serde_json::from_str(r#""lfs""#).unwrap();
        assert_eq!(lfs, StorageMedia::LocalFile);
        let relational: StorageMedia = serde_json::from_str(r#""relational""#).unwrap();
        assert_eq!(relational, StorageMedia::Relational);
        assert!(serde_json::from_str::<StorageMedia>(r#""s3""#).is_err());
    }

    #[test]
    fn test_env_fallbacks_fill_only_empty_fields() {
        let vars: HashMap<&str, &str> = [
            ("PACKETS_FILE_PATH", "/env/packets"),
            ("PACKETSTORE_DB_URL", "sqlite://env.db"),
            ("PACKETSTORE_DB_READ_URL", "sqlite://env-read.db"),
            ("PACKETSTORE_DB_MAX_OPEN", "40"),
            ("PACKETSTORE_DB_MAX_IDLE", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.relational.dsn = "sqlite://file.db".to_string();
        config.apply_fallbacks_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.packets_file(), PathBuf::from("/env/packets"));
        assert_eq!(config.relational.primary_url(), Some("sqlite://file.db"));
        assert_eq!(config.relational.read_url(), Some("sqlite://env-read.db"));
        assert_eq!(config.relational.max_open(), 40);
        assert_eq!(config.relational.max_idle(), 10);
    }

    #[test]
    fn test_legacy_dsn_variables_are_aliases() {
        let legacy: HashMap<&str, &str> = [
            ("MYSQL_DSN", "sqlite://legacy.db"),
            ("MYSQL_READ_DSN", "sqlite://legacy-read.db"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_fallbacks_from(|k| legacy.get(k).map(|v| v.to_string()));
        assert_eq!(config.relational.primary_url(), Some("sqlite://legacy.db"));
        assert_eq!(config.relational.read_url(), Some("sqlite://legacy-read.db"));

        let both: HashMap<&str, &str> = [
            ("MYSQL_DSN", "sqlite://legacy.db"),
            ("PACKETSTORE_DB_URL", "sqlite://current.db"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_fallbacks_from(|k| both.get(k).map(|v| v.to_string()));
        assert_eq!(config.relational.primary_url(), Some("sqlite://current.db"));
    }

    #[test]
    fn test_load_and_fallback() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"StorageMedia":"lfs","PacketsFilePath":"p.json"}"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.packets_file(), PathBuf::from("p.json"));

        assert!(AppConfig::load(temp_dir.path().join("missing.json")).is_err());
        let fallback = AppConfig::load_or_default(temp_dir.path().join("missing.json"));
        assert_eq!(fallback.storage_media, StorageMedia::LocalFile);
    }

    #[test]
    fn test_validate_relational_requires_url() {
        let mut config = AppConfig {
            storage_media: StorageMedia::Relational,
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConfigurationMissing);

        config.relational.dsn = "sqlite://packets.db".to_string();
        assert!(config.validate().is_ok());

        config.relational.max_open = 2;
        config.relational.max_idle = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_sub_minute_backup_interval() {
        let mut config = AppConfig::default();
        config.backup.interval_secs = 30;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);

        config.backup.interval_secs = MIN_BACKUP_INTERVAL_SECS;
        assert!(config.validate().is_ok());
    }
}
