//! Fulfillment configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::FulfillmentError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix for license requests
    pub license_base_url: String,
    /// Prefix for book artifacts, followed by `/<isbn>/<relative path>`
    pub content_base_url: String,
    /// Default destination directory
    pub library_dir: PathBuf,
    /// Path to the ledger database
    pub database_path: PathBuf,
    pub request_timeout_secs: u64,
    pub max_fetch_attempts: u32,
    /// Width of the asset download fan-out
    pub max_concurrent_downloads: usize,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            license_base_url: "https://license.axisdrm.example/api".to_string(),
            content_base_url: "https://content.axisdrm.example/books".to_string(),
            library_dir: data_dir.join("AxisLibrary"),
            database_path: data_dir.join("axis.db"),
            request_timeout_secs: 30,
            max_fetch_attempts: 3,
            max_concurrent_downloads: 4,
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("Axis"))
            .unwrap_or_else(|| PathBuf::from(".axis"))
    }

    /// Read a JSON configuration file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FulfillmentError::Config(format!("{}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| FulfillmentError::Config(format!("{}: {e}", path.display())))?;

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FulfillmentError::Config(format!("{}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| FulfillmentError::Config(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| FulfillmentError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("license_base_url", &self.license_base_url),
            ("content_base_url", &self.content_base_url),
        ] {
            let url = url::Url::parse(value)
                .map_err(|e| FulfillmentError::Config(format!("{name}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(FulfillmentError::Config(format!(
                    "{name} must be an http(s) URL"
                )));
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(FulfillmentError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_fetch_attempts == 0 {
            return Err(FulfillmentError::Config(
                "max_fetch_attempts must be positive".to_string(),
            ));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(FulfillmentError::Config(
                "max_concurrent_downloads must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::new(PathBuf::from("/data"));
        config.validate().unwrap();
        assert_eq!(config.max_fetch_attempts, 3);
        assert_eq!(config.library_dir, PathBuf::from("/data/AxisLibrary"));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_data_dir_is_app_scoped() {
        let dir = Config::data_dir();
        assert!(dir.ends_with("Axis") || dir == PathBuf::from(".axis"));
        assert_eq!(Config::default().database_path, dir.join("axis.db"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::new(PathBuf::from("/data"));
        config.max_concurrent_downloads = 0;
        assert!(matches!(config.validate(), Err(FulfillmentError::Config(_))));

        let mut config = Config::new(PathBuf::from("/data"));
        config.content_base_url = "ftp://content.example/books".to_string();
        assert!(matches!(config.validate(), Err(FulfillmentError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/axis.json");

        let mut config = Config::new(dir.path().to_path_buf());
        config.max_concurrent_downloads = 8;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("axis.json");
        std::fs::write(&path, r#"{"request_timeout_secs": 5}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.request_timeout_secs, 5);
        assert_eq!(config.max_fetch_attempts, 3);
    }
}
