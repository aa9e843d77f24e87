//! Configuration management for sitesync.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the local site.
    pub site: String,
    /// Reconciliation tuning.
    pub reconcile: ReconcileConfig,
    /// Listing store configuration.
    pub store: StoreConfig,
    /// Storage driver configuration.
    pub driver: DriverConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site: "site-a".to_string(),
            reconcile: ReconcileConfig::default(),
            store: StoreConfig::default(),
            driver: DriverConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the defaults when none is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: Option<&std::path::Path>) -> crate::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or validated.
    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make reconciliation misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> crate::Result<()> {
        if self.site.trim().is_empty() {
            return Err(crate::Error::Config("site must not be empty".to_string()));
        }
        if self.reconcile.batch_size == 0 {
            return Err(crate::Error::Config("reconcile.batch_size must be positive".to_string()));
        }
        if self.reconcile.sites.iter().any(|s| s.trim().is_empty()) {
            return Err(crate::Error::Config(
                "reconcile.sites must not contain empty names".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reconciliation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Operations buffered before a bulk write is flushed.
    pub batch_size: usize,
    /// Promote repaired rows using the backend's metadata.
    pub refresh_from_driver: bool,
    /// Every site of the deployment, used when a request names none.
    pub sites: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { batch_size: 1000, refresh_from_driver: false, sites: Vec::new() }
    }
}

/// Listing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb file.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("./sitesync.redb") }
    }
}

/// Storage driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Root directory; buckets are its subdirectories.
    pub root: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { root: PathBuf::from("./data") }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// JSON lines.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site, "site-a");
        assert_eq!(config.reconcile.batch_size, 1000);
        assert!(!config.reconcile.refresh_from_driver);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
site = "paris"

[reconcile]
batch_size = 250
refresh_from_driver = true
sites = ["paris", "lyon", "nice"]

[store]
path = "/var/lib/sitesync/listing.redb"

[logging]
level = "debug"
format = "json"
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.site, "paris");
        assert_eq!(config.reconcile.batch_size, 250);
        assert!(config.reconcile.refresh_from_driver);
        assert_eq!(config.reconcile.sites.len(), 3);
        assert_eq!(config.store.path, PathBuf::from("/var/lib/sitesync/listing.redb"));
        assert_eq!(config.driver.root, PathBuf::from("./data"));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_rejects_zero_batch() {
        let err = Config::parse("[reconcile]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_rejects_empty_site() {
        assert!(Config::parse("site = \"  \"\n").is_err());
    }
}
