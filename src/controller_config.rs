use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::logging::LoggingConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// JSON file backing the state store.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    pub artefact_storage: ArtefactStorageConfig,
    #[serde(default = "default_s3_retry_count")]
    pub s3_retry_count: u32,
    #[serde(default = "default_s3_retry_delay_ms")]
    pub s3_retry_delay_ms: u64,
    /// Operator id -> base URL, e.g. `host-a: http://10.0.0.5:3001`.
    #[serde(default)]
    pub operators: BTreeMap<String, String>,
    #[serde(default = "default_operator_timeout", with = "humantime_serde")]
    pub operator_timeout: Duration,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("controller_state.json")
}

fn default_s3_retry_count() -> u32 {
    3
}

fn default_s3_retry_delay_ms() -> u64 {
    1000
}

// Updates run synchronously on the operator and may take a while.
fn default_operator_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArtefactStorageConfig {
    Local { directory: PathBuf },
    S3(BucketConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct BucketConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default)]
    pub path_style: bool,
    pub prefix: String, // alphanumerics, hyphens and underscores only
}

impl BucketConfig {
    /// Prefix is required and limited to alphanumerics, `-` and `_`.
    pub fn validate_prefix(prefix: &str) -> Result<(), String> {
        if prefix.is_empty() {
            return Err("Prefix is required and cannot be empty".to_string());
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(
                "Prefix can only contain alphanumerics (a-z, A-Z, 0-9), hyphens (-), and underscores (_)"
                    .to_string(),
            );
        }
        Ok(())
    }

    pub fn full_key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CronConfig {
    #[serde(default = "default_lifecycle_actions_cooldown", with = "humantime_serde")]
    pub lifecycle_actions_cooldown: Duration,
    #[serde(default = "default_history_prune_cooldown", with = "humantime_serde")]
    pub history_prune_cooldown: Duration,
    #[serde(default = "default_history_retention", with = "humantime_serde")]
    pub history_retention: Duration,
    #[serde(default = "default_cache_clear_cooldown", with = "humantime_serde")]
    pub cache_clear_cooldown: Duration,
    #[serde(default = "default_cache_max_age", with = "humantime_serde")]
    pub cache_max_age: Duration,
    /// Pause before retrying a job that failed.
    #[serde(default = "default_failure_backoff", with = "humantime_serde")]
    pub failure_backoff: Duration,
    /// Pause after a whole pass failed, e.g. the state file was unreadable.
    #[serde(default = "default_fallback_retry", with = "humantime_serde")]
    pub fallback_retry: Duration,
}

fn default_lifecycle_actions_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_history_prune_cooldown() -> Duration {
    Duration::from_secs(3600)
}

fn default_history_retention() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

fn default_cache_clear_cooldown() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_cache_max_age() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_failure_backoff() -> Duration {
    crate::cron::DEFAULT_FAILURE_BACKOFF
}

fn default_fallback_retry() -> Duration {
    crate::cron::FALLBACK_RETRY
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            lifecycle_actions_cooldown: default_lifecycle_actions_cooldown(),
            history_prune_cooldown: default_history_prune_cooldown(),
            history_retention: default_history_retention(),
            cache_clear_cooldown: default_cache_clear_cooldown(),
            cache_max_age: default_cache_max_age(),
            failure_backoff: default_failure_backoff(),
            fallback_retry: default_fallback_retry(),
        }
    }
}

impl ControllerConfig {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: ControllerConfig =
            serde_yaml_ng::from_str(contents).context("Failed to parse controller config")?;
        if let ArtefactStorageConfig::S3(bucket) = &config.artefact_storage {
            BucketConfig::validate_prefix(&bucket.prefix).map_err(anyhow::Error::msg)?;
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
    fn minimal_local_config_gets_defaults() {
        let config = ControllerConfig::from_yaml(
            "artefact_storage:\n  kind: local\n  directory: /var/lib/fleetdeck/artefacts\n",
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:3000");
        assert_eq!(config.s3_retry_count, 3);
        assert_eq!(config.cron.history_prune_cooldown, Duration::from_secs(3600));
        assert_eq!(config.cron.failure_backoff, Duration::from_secs(5));
        assert_eq!(config.cron.fallback_retry, Duration::from_secs(60));
        assert!(config.operators.is_empty());
        assert!(matches!(
            config.artefact_storage,
            ArtefactStorageConfig::Local { .. }
        ));
    }

    #[test]
    fn s3_config_with_humantime_durations() {
        let yaml = r#"
listen: 127.0.0.1:8080
artefact_storage:
  kind: s3
  endpoint: http://minio:9000
  access_key: minio
  secret_key: minio123
  bucket: fleet
  path_style: true
  prefix: prod_eu-1
operators:
  host-a: http://10.0.0.5:3001
cron:
  history_retention: 14days
  cache_max_age: 2h
  failure_backoff: 30s
"#;
        let config = ControllerConfig::from_yaml(yaml).unwrap();
        let ArtefactStorageConfig::S3(bucket) = &config.artefact_storage else {
            panic!("expected s3 storage");
        };
        assert_eq!(bucket.full_key("artefacts/a.tar.gz"), "prod_eu-1/artefacts/a.tar.gz");
        assert_eq!(config.cron.history_retention, Duration::from_secs(14 * 24 * 3600));
        assert_eq!(config.cron.cache_max_age, Duration::from_secs(7200));
        assert_eq!(config.cron.failure_backoff, Duration::from_secs(30));
        assert_eq!(config.operators["host-a"], "http://10.0.0.5:3001");
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let yaml = "artefact_storage:\n  kind: s3\n  endpoint: e\n  access_key: a\n  secret_key: s\n  bucket: b\n  prefix: a/b\n";
        let e = ControllerConfig::from_yaml(yaml).unwrap_err();
        assert!(format!("{e:#}").contains("Prefix can only contain"));
        assert!(BucketConfig::validate_prefix("").is_err());
    }
}
