//! Container control through the docker engine API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use regex::Regex;
use tracing::info;
use uuid::Uuid;

use crate::model::ServerModel;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn is_running(&self, server: Uuid) -> Result<bool>;
    /// Start the server's container, creating it first if needed.
    async fn start(&self, server: &ServerModel, data_dir: &Path) -> Result<()>;
    async fn stop(&self, server: Uuid) -> Result<()>;
}

/// Mount point of the server data directory inside the container.
pub const DATA_MOUNT: &str = "/data";

pub struct DockerRuntime {
    docker: Docker,
    name_prefix: String,
    stop_timeout: Duration,
}

impl DockerRuntime {
    /// Connect through the local socket and check the daemon answers.
    pub async fn connect(name_prefix: impl Into<String>, stop_timeout: Duration) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        let version = docker.version().await.context("Docker daemon is not answering")?;
        info!(
            "🐳 Connected to Docker {}",
            version.version.as_deref().unwrap_or("(unknown version)")
        );
        Ok(Self {
            docker,
            name_prefix: name_prefix.into(),
            stop_timeout,
        })
    }

    pub fn container_name(&self, server: Uuid) -> String {
        format!("{}{}", self.name_prefix, server)
    }

    /// `Some(running)` for an existing container, `None` when absent.
    async fn state(&self, server: Uuid) -> Result<Option<bool>> {
        let name = self.container_name(server);
        match self.docker.inspect_container(&name, None).await {
            Ok(inspect) => Ok(Some(
                inspect.state.and_then(|s| s.running).unwrap_or(false),
            )),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to inspect container {}", name)),
        }
    }

    async fn create(&self, server: &ServerModel, data_dir: &Path) -> Result<()> {
        let name = self.container_name(server.uuid);
        info!("🐳 Creating container {} from {}", name, server.image);
        let options = CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        };
        self.docker
            .create_container(Some(options), container_config(server, data_dir)?)
            .await
            .with_context(|| format!("Failed to create container {}", name))?;

        // create only takes one network; the rest are connected afterwards
        for network in server.networks.iter().skip(1) {
            self.docker
                .connect_network(
                    network,
                    ConnectNetworkOptions {
                        container: name.clone(),
                        endpoint_config: Default::default(),
                    },
                )
                .await
                .with_context(|| format!("Failed to connect {} to network {}", name, network))?;
        }
        Ok(())
    }
}

/// Container definition for `server`, with its data directory bound at
/// [`DATA_MOUNT`] and the first network as network mode.
pub fn container_config(server: &ServerModel, data_dir: &Path) -> Result<Config<String>> {
    let memory = server
        .memory_limit
        .as_deref()
        .filter(|m| !m.is_empty())
        .map(parse_memory)
        .transpose()?;
    let nano_cpus = server
        .cpu_limit
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(parse_nano_cpus)
        .transpose()?;
    let host_config = HostConfig {
        memory,
        nano_cpus,
        binds: Some(vec![format!("{}:{}", data_dir.display(), DATA_MOUNT)]),
        network_mode: server.networks.first().cloned(),
        ..Default::default()
    };
    let labels = HashMap::from([
        ("fleetdeck.environment".to_string(), server.environment.clone()),
        ("fleetdeck.name".to_string(), server.name.clone()),
        ("fleetdeck.server".to_string(), server.uuid.to_string()),
    ]);
    Ok(Config {
        image: Some(server.image.clone()),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    })
}

fn memory_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)?)\s*([kKmMgGtT])?[iI]?[bB]?$").expect("static regex")
    })
}

/// Docker style memory size ("512m", "4g", "1.5GiB") in bytes.
pub fn parse_memory(value: &str) -> Result<i64> {
    let caps = memory_pattern()
        .captures(value.trim())
        .with_context(|| format!("invalid memory limit '{}'", value))?;
    let amount: f64 = caps[1]
        .parse()
        .with_context(|| format!("invalid memory limit '{}'", value))?;
    let unit: f64 = match caps.get(2).map(|u| u.as_str().to_ascii_lowercase()).as_deref() {
        None => 1.0,
        Some("k") => 1024.0,
        Some("m") => 1024.0 * 1024.0,
        Some("g") => 1024.0 * 1024.0 * 1024.0,
        _ => 1024.0 * 1024.0 * 1024.0 * 1024.0,
    };
    let bytes = (amount * unit).round();
    if bytes < 1.0 || bytes > i64::MAX as f64 {
        anyhow::bail!("memory limit '{}' out of range", value);
    }
    Ok(bytes as i64)
}

/// Fractional cpu count ("1.5") in units of 1e-9 cpus.
pub fn parse_nano_cpus(value: &str) -> Result<i64> {
    let cpus: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("invalid cpu limit '{}'", value))?;
    if !cpus.is_finite() || cpus <= 0.0 || cpus > 1_000_000.0 {
        anyhow::bail!("cpu limit '{}' out of range", value);
    }
    Ok((cpus * 1_000_000_000.0).round() as i64)
}

/// 304 from start/stop means the container already was in that state.
fn not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn is_running(&self, server: Uuid) -> Result<bool> {
        Ok(self.state(server).await?.unwrap_or(false))
    }

    async fn start(&self, server: &ServerModel, data_dir: &Path) -> Result<()> {
        let name = self.container_name(server.uuid);
        match self.state(server.uuid).await? {
            Some(true) => {
                info!("Container {} already running", name);
                return Ok(());
            }
            Some(false) => {}
            None => {
                tokio::fs::create_dir_all(data_dir)
                    .await
                    .with_context(|| format!("Failed to create {}", data_dir.display()))?;
                self.create(server, data_dir).await?;
            }
        }
        info!("▶️  Starting container {}", name);
        match self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            Err(e) if !not_modified(&e) => {
                Err(e).with_context(|| format!("Failed to start container {}", name))
            }
            _ => Ok(()),
        }
    }

    async fn stop(&self, server: Uuid) -> Result<()> {
        let name = self.container_name(server);
        if self.state(server).await? != Some(true) {
            info!("Container {} is not running", name);
            return Ok(());
        }
        info!("⏹️  Stopping container {}", name);
        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs().try_into().unwrap_or(i64::MAX),
        };
        match self.docker.stop_container(&name, Some(options)).await {
            Err(e) if !not_modified(&e) => {
                Err(e).with_context(|| format!("Failed to stop container {}", name))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn survival(memory: Option<&str>, cpus: Option<&str>) -> ServerModel {
        ServerModel {
            uuid: Uuid::nil(),
            environment: "prod".to_string(),
            name: "survival-1".to_string(),
            operator: "host-a".to_string(),
            memory_limit: memory.map(str::to_string),
            cpu_limit: cpus.map(str::to_string),
            image: "games/survival:1.20".to_string(),
            networks: vec!["games".to_string(), "metrics".to_string()],
        }
    }

    #[test]
    fn config_follows_the_server_model() {
        let config =
            container_config(&survival(Some("4g"), Some("1.5")), Path::new("/srv/games/x")).unwrap();
        assert_eq!(config.image.as_deref(), Some("games/survival:1.20"));
        assert_eq!(config.labels.as_ref().unwrap()["fleetdeck.name"], "survival-1");

        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(4 * 1024 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(1_500_000_000));
        assert_eq!(host.binds, Some(vec!["/srv/games/x:/data".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("games"));
    }

    #[test]
    fn empty_limits_are_left_unset() {
        let config = container_config(&survival(None, Some("")), Path::new("/srv/x")).unwrap();
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, None);
        assert_eq!(host.nano_cpus, None);
    }

    #[test]
    fn memory_sizes() {
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1.5GiB").unwrap(), 1536 * 1024 * 1024);
        assert_eq!(parse_memory("2048").unwrap(), 2048);
        assert_eq!(parse_memory("64kb").unwrap(), 64 * 1024);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("4x").is_err());
        assert!(parse_memory("0").is_err());
    }

    #[test]
    fn cpu_limits() {
        assert_eq!(parse_nano_cpus("2").unwrap(), 2_000_000_000);
        assert_eq!(parse_nano_cpus("0.25").unwrap(), 250_000_000);
        assert!(parse_nano_cpus("-1").is_err());
        assert!(parse_nano_cpus("NaN").is_err());
        assert!(container_config(&survival(None, Some("many")), Path::new("/srv/x")).is_err());
    }
}
