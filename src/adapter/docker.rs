//! Local-container backend built on the Docker daemon.
//!
//! Provides container-based sandboxes with resource limits, named volumes,
//! and pause/resume via the daemon's stop/start. In-place reconfiguration
//! is not expressible for a created container, so `update` keeps its
//! unsupported default and pool `claim` is unavailable on this backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerStateStatusEnum;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::Utc;
use futures_util::StreamExt;
use tracing::{debug, warn};

use super::{
    Adapter, ExecOpts, ExecOutput, SandboxConfig, SandboxHandle, SandboxStatus,
    METADATA_HEALTH_URL, METADATA_PRIVATE_IP,
};
use crate::error::{Error, Result};

/// Environment key a sandbox image can set to advertise its health port.
const HEALTH_PORT_ENV: &str = "TIDEPOOL_HEALTH_PORT";

const STOP_TIMEOUT_SECS: i64 = 10;

/// Runs sandboxes as local Docker containers.
pub struct DockerAdapter {
    docker: Docker,
}

impl DockerAdapter {
    /// Connects to the local Docker daemon and verifies it is reachable.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::backend(format!("failed to connect to Docker: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| Error::backend(format!("cannot ping Docker daemon: {e}")))?;
        Ok(Self { docker })
    }

    fn build_container_config(config: &SandboxConfig) -> Result<ContainerConfig<String>> {
        let binds: Vec<String> = config
            .volumes
            .iter()
            .map(|spec| format!("{}:{}", spec.name, spec.mount_path))
            .collect();

        let memory = if config.memory.is_empty() {
            None
        } else {
            Some(parse_memory_limit(&config.memory)?)
        };
        let nano_cpus = if config.cpus.is_empty() {
            None
        } else {
            let cpus: f64 = config
                .cpus
                .parse()
                .map_err(|_| Error::invalid_config(format!("invalid cpu limit: {}", config.cpus)))?;
            Some((cpus * 1_000_000_000.0) as i64)
        };

        Ok(ContainerConfig {
            image: Some(config.image.clone()),
            env: Some(format_env(&config.env)),
            host_config: Some(bollard::service::HostConfig {
                binds: if binds.is_empty() { None } else { Some(binds) },
                memory,
                nano_cpus,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Reads the container's bridge address and builds probe metadata.
    async fn discover_metadata(
        &self,
        id: &str,
        config: &SandboxConfig,
    ) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        let inspect = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) => {
                debug!(id, error = %e, "could not inspect container for metadata");
                return metadata;
            }
        };

        let ip = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| {
                networks
                    .into_values()
                    .find_map(|endpoint| endpoint.ip_address.filter(|ip| !ip.is_empty()))
            });

        if let Some(ip) = ip {
            metadata.insert(METADATA_PRIVATE_IP.to_string(), ip.clone());
            if let Some(port) = config.env.get(HEALTH_PORT_ENV) {
                metadata.insert(
                    METADATA_HEALTH_URL.to_string(),
                    format!("http://{ip}:{port}/health"),
                );
            }
        }
        metadata
    }
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle> {
        let name = container_name();
        let volumes = self.provision_volumes(config).await?;
        let container_config = Self::build_container_config(config)?;

        debug!(container = %name, image = %config.image, "creating container");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await;
        if let Err(e) = created {
            let _ = self.delete_volumes(&volumes).await;
            return Err(e.into());
        }

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.terminate(&name).await;
            let _ = self.delete_volumes(&volumes).await;
            return Err(e.into());
        }

        let metadata = self.discover_metadata(&name, config).await;
        Ok(SandboxHandle {
            id: name,
            backend: self.name().to_string(),
            config: config.clone(),
            metadata,
            created_at: Utc::now(),
        })
    }

    async fn exec(&self, id: &str, command: &[String], opts: &ExecOpts) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    env: if opts.env.is_empty() {
                        None
                    } else {
                        Some(format_env(&opts.env))
                    },
                    working_dir: opts.workdir.clone(),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        warn!(id, error = %e, "error reading exec output");
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        let result = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            // Already gone counts as success.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, id: &str) -> Result<SandboxStatus> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(map_status(inspect.state.and_then(|s| s.status))),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(SandboxStatus::Terminated),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await?;
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn await_ready(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        // The daemon knows the container state before any health endpoint
        // comes up; check it first so a crashed container fails fast.
        let status = self.status(&handle.id).await?;
        if status != SandboxStatus::Running {
            return Err(Error::unexpected_status(&handle.id, status.to_string()));
        }
        if let Some(url) = handle.metadata.get(METADATA_HEALTH_URL) {
            let client = reqwest::Client::new();
            crate::health::poll(&client, url, timeout, interval).await?;
        }
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn delete_volumes(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            let result = self
                .docker
                .remove_volume(id, Some(RemoveVolumeOptions { force: true }))
                .await;
            match result {
                Ok(())
                | Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn container_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("tidepool-{}", &suffix[..8])
}

fn format_env(env: &HashMap<String, String>) -> Vec<String> {
    let mut formatted: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    formatted.sort();
    formatted
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> SandboxStatus {
    match status {
        Some(ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::RESTARTING) => {
            SandboxStatus::Running
        }
        Some(
            ContainerStateStatusEnum::CREATED
            | ContainerStateStatusEnum::PAUSED
            | ContainerStateStatusEnum::EXITED,
        ) => SandboxStatus::Stopped,
        // DEAD, REMOVING, EMPTY, or no state at all.
        _ => SandboxStatus::Unknown,
    }
}

/// Parse a memory limit string (e.g. "8g", "512m") to bytes.
fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num
            .parse()
            .map_err(|_| Error::invalid_config(format!("invalid memory limit: {limit}")))?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num
            .parse()
            .map_err(|_| Error::invalid_config(format!("invalid memory limit: {limit}")))?;
        Ok(megs * 1024 * 1024)
    } else {
        limit
            .parse()
            .map_err(|_| Error::invalid_config(format!("invalid memory limit: {limit}")))
    }
}
