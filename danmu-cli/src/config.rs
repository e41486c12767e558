use crate::error::{CliError, Result};
use danmaku_live::batcher::DEFAULT_BATCH_WINDOW_MS;
use danmaku_live::{ClientConfig, MergeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Colorize pretty output
    pub colored: bool,
    /// Length of a merge batch window in milliseconds
    pub batch_window_ms: i64,
    pub client: ClientConfig,
    pub merge: MergeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            colored: true,
            batch_window_ms: DEFAULT_BATCH_WINDOW_MS,
            client: ClientConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, or the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|e| CliError::config(format!("{}: {}", path.display(), e)))
    }

    /// Overwrite the configuration file with defaults.
    pub fn reset(path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()
                .ok_or_else(|| CliError::config("no configuration directory on this system"))?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, Self::default().show()?)?;
        Ok(path)
    }

    pub fn show(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CliError::config(e.to_string()))
    }

    fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("danmu").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "batch_window_ms = 2000\n\n[merge]\nwindow_ms = 800\n\n[client.reconnect]\nmax_delay_ms = 5000\n",
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.batch_window_ms, 2000);
        assert_eq!(config.merge.window_ms, 800);
        assert_eq!(config.merge.promotion_threshold, 5);
        assert_eq!(config.client.reconnect.max_delay_ms, 5000);
        assert_eq!(config.client.reconnect.base_delay_ms, 1000);
    }

    #[test]
    fn test_reset_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        AppConfig::reset(Some(&path)).unwrap();
        assert_eq!(AppConfig::load(Some(&path)).unwrap(), AppConfig::default());
    }
}
