//! Configuration module for rapidstore.

use serde::Deserialize;
use std::path::Path;

use crate::file::DEFAULT_SHARD_FANOUT;
use crate::{Result, StorageError};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/rapidstore.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for public blobs (served by a web server).
    #[serde(default = "default_public_root")]
    pub public_root: String,
    /// Root directory for private blobs.
    #[serde(default = "default_private_root")]
    pub private_root: String,
    /// URL prefix the public root is served under.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Scheme and host prepended to public URLs when an absolute URL is requested.
    #[serde(default)]
    pub base_public_url: String,
    /// Number of children per shard directory.
    #[serde(default = "default_shard_fanout")]
    pub shard_fanout: u64,
}

fn default_public_root() -> String {
    "data/public".to_string()
}

fn default_private_root() -> String {
    "data/private".to_string()
}

fn default_public_url() -> String {
    "/files".to_string()
}

fn default_shard_fanout() -> u64 {
    DEFAULT_SHARD_FANOUT
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            public_root: default_public_root(),
            private_root: default_private_root(),
            public_url: default_public_url(),
            base_public_url: String::new(),
            shard_fanout: default_shard_fanout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/rapidstore.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Blob storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(StorageError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| StorageError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `RAPIDSTORE_DATABASE_PATH`: Override the database path
    /// - `RAPIDSTORE_BASE_PUBLIC_URL`: Override the absolute URL base
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("RAPIDSTORE_DATABASE_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
        if let Ok(base) = std::env::var("RAPIDSTORE_BASE_PUBLIC_URL") {
            if !base.is_empty() {
                self.storage.base_public_url = base;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - the shard fanout is below 2
    /// - the public and private roots are the same directory
    /// - `base_public_url` is set but is not an absolute URL
    pub fn validate(&self) -> Result<()> {
        if self.storage.shard_fanout < 2 {
            return Err(StorageError::Config(format!(
                "shard_fanout must be at least 2, got {}",
                self.storage.shard_fanout
            )));
        }
        if Path::new(&self.storage.public_root) == Path::new(&self.storage.private_root) {
            return Err(StorageError::Config(
                "public_root and private_root must be different directories".to_string(),
            ));
        }
        if !self.storage.base_public_url.is_empty() {
            url::Url::parse(&self.storage.base_public_url).map_err(|e| {
                StorageError::Config(format!(
                    "base_public_url {:?} is not an absolute URL: {e}",
                    self.storage.base_public_url
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.database.path, "data/rapidstore.db");

        assert_eq!(config.storage.public_root, "data/public");
        assert_eq!(config.storage.private_root, "data/private");
        assert_eq!(config.storage.public_url, "/files");
        assert!(config.storage.base_public_url.is_empty());
        assert_eq!(config.storage.shard_fanout, 4096);

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/rapidstore.log");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[database]
path = "custom/meta.sqlite"

[storage]
public_root = "/srv/blobs/public"
private_root = "/srv/blobs/private"
public_url = "/static"
base_public_url = "https://cdn.example.com"
shard_fanout = 1024

[logging]
level = "debug"
file = "/var/log/rapidstore.log"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.database.path, "custom/meta.sqlite");
        assert_eq!(config.storage.public_root, "/srv/blobs/public");
        assert_eq!(config.storage.private_root, "/srv/blobs/private");
        assert_eq!(config.storage.public_url, "/static");
        assert_eq!(config.storage.base_public_url, "https://cdn.example.com");
        assert_eq!(config.storage.shard_fanout, 1024);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, "/var/log/rapidstore.log");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[storage]
shard_fanout = 256
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.storage.shard_fanout, 256);
        assert_eq!(config.storage.public_root, "data/public");
        assert_eq!(config.database.path, "data/rapidstore.db");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.database.path, "data/rapidstore.db");
        assert_eq!(config.storage.shard_fanout, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Config::parse("this is not valid toml [[[");

        if let Err(StorageError::Config(msg)) = result {
            assert!(msg.contains("config parse error"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("nonexistent.toml");
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[test]
    fn test_validate_small_fanout() {
        let mut config = Config::default();
        config.storage.shard_fanout = 1;
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_validate_same_roots() {
        let mut config = Config::default();
        config.storage.private_root = config.storage.public_root.clone();
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_validate_relative_base_url() {
        let mut config = Config::default();
        config.storage.base_public_url = "cdn.example.com".to_string();
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));

        config.storage.base_public_url = "http://cdn.example.com".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_env_overrides() {
        let original = std::env::var("RAPIDSTORE_BASE_PUBLIC_URL").ok();

        std::env::set_var("RAPIDSTORE_BASE_PUBLIC_URL", "https://files.example.org");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.storage.base_public_url, "https://files.example.org");

        std::env::set_var("RAPIDSTORE_BASE_PUBLIC_URL", "");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert!(config.storage.base_public_url.is_empty());

        match original {
            Some(val) => std::env::set_var("RAPIDSTORE_BASE_PUBLIC_URL", val),
            None => std::env::remove_var("RAPIDSTORE_BASE_PUBLIC_URL"),
        }
    }
}
