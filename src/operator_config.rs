use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::logging::LoggingConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct OperatorConfig {
    pub operator_id: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    pub controller_url: String,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Server data directories live at `<data_directory>/<server uuid>`.
    pub data_directory: PathBuf,
    pub cache_directory: PathBuf,
    #[serde(default = "default_workers")]
    pub download_workers: usize,
    #[serde(default = "default_workers")]
    pub validation_workers: usize,
    /// Abort an update when installed files no longer match the artefact
    /// being removed. When false the mismatch is only logged.
    #[serde(default = "default_strict_validation")]
    pub strict_validation: bool,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_workers() -> usize {
    4
}

fn default_strict_validation() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContainerConfig {
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Grace period docker gives a server before killing it on stop.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_name_prefix() -> String {
    "fleetdeck-".to_string()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl OperatorConfig {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: OperatorConfig =
            serde_yaml_ng::from_str(contents).context("Failed to parse operator config")?;
        if config.download_workers == 0 || config.validation_workers == 0 {
            anyhow::bail!("download_workers and validation_workers must be at least 1");
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OperatorConfig::from_yaml(
            "operator_id: host-a\ncontroller_url: http://controller:3000\ndata_directory: /srv/games\ncache_directory: /var/cache/fleetdeck\n",
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:3001");
        assert_eq!(config.download_workers, 4);
        assert!(config.strict_validation);
        assert_eq!(config.container.name_prefix, "fleetdeck-");
        assert_eq!(config.container.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.logging.rotation, crate::logging::LogRotation::Daily);
    }

    #[test]
    fn zero_workers_rejected() {
        let e = OperatorConfig::from_yaml(
            "operator_id: a\ncontroller_url: u\ndata_directory: d\ncache_directory: c\ndownload_workers: 0\n",
        )
        .unwrap_err();
        assert!(e.to_string().contains("at least 1"));
    }
}
