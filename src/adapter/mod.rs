//! Backend adapters for sandbox lifecycle operations.
//!
//! An [`Adapter`] owns everything backend-specific about one sandbox:
//! creating and destroying it, executing commands inside it, and probing its
//! readiness. The pool and runner only ever talk to this trait, so backends
//! (local containers, a remote machine API) are swappable without touching
//! the coordination logic.

mod docker;
pub mod mock;
mod throttled;

pub use docker::DockerAdapter;
pub use throttled::Throttled;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::health;

/// Metadata key carrying the URL the readiness poller should probe.
pub const METADATA_HEALTH_URL: &str = "health_url";
/// Metadata key carrying the sandbox's fast-path private address.
pub const METADATA_PRIVATE_IP: &str = "private_ip";

/// Desired shape of a sandbox: image, environment, resources, volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container image to run.
    pub image: String,
    /// Environment variables set inside the sandbox.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Memory limit (e.g. "2g", "512m"). Empty means backend default.
    #[serde(default)]
    pub memory: String,
    /// CPU limit (e.g. "2"). Empty means backend default.
    #[serde(default)]
    pub cpus: String,
    /// Volumes to provision and attach.
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

/// A named volume and where to mount it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub mount_path: String,
}

/// Caller-visible reference to a sandbox. Immutable once created; replaced,
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Backend-specific identifier.
    pub id: String,
    /// Name of the adapter that owns this sandbox.
    pub backend: String,
    /// The configuration the sandbox was created with.
    pub config: SandboxConfig,
    /// Adapter-populated metadata (health URL, private address, ...).
    pub metadata: HashMap<String, String>,
    /// When the sandbox was created.
    pub created_at: DateTime<Utc>,
}

/// Options for a single exec call.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    /// Working directory inside the sandbox.
    pub workdir: Option<String>,
    /// Extra environment for this command only.
    pub env: HashMap<String, String>,
}

/// Captured output of one command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    /// Returns true if the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Observed lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Running,
    Stopped,
    Terminated,
    Unknown,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Terminated => write!(f, "terminated"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Backend contract consumed by the pool and runner.
///
/// `stop`/`start`/`update`/`delete_volumes` are optional; backends that
/// cannot express them inherit defaults returning [`Error::Unsupported`].
/// `await_ready` and the file operations have working defaults built on the
/// health poller and on exec respectively.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Backend name, used in handles and error messages.
    fn name(&self) -> &'static str;

    /// Creates a sandbox and returns its handle. The sandbox may not be
    /// reachable yet; pair with `await_ready`.
    async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle>;

    /// Runs `command` (argv form) inside the sandbox and captures output.
    async fn exec(&self, id: &str, command: &[String], opts: &ExecOpts) -> Result<ExecOutput>;

    /// Destroys the sandbox. Idempotent: an already-gone sandbox is success.
    async fn terminate(&self, id: &str) -> Result<()>;

    /// Reports the sandbox's current lifecycle state.
    async fn status(&self, id: &str) -> Result<SandboxStatus>;

    /// Pauses the sandbox without destroying its state.
    async fn stop(&self, _id: &str) -> Result<()> {
        Err(Error::unsupported("stop", self.name()))
    }

    /// Resumes a stopped sandbox.
    async fn start(&self, _id: &str) -> Result<()> {
        Err(Error::unsupported("start", self.name()))
    }

    /// Reconfigures the sandbox in place, preserving attachments.
    async fn update(&self, _id: &str, _config: &SandboxConfig) -> Result<()> {
        Err(Error::unsupported("update", self.name()))
    }

    /// Waits until the sandbox is actually reachable.
    ///
    /// Default: poll the health URL discovered in the handle's metadata. A
    /// sandbox that advertises no health URL is considered ready as soon as
    /// creation returned.
    async fn await_ready(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        match handle.metadata.get(METADATA_HEALTH_URL) {
            Some(url) => {
                let client = reqwest::Client::new();
                health::poll(&client, url, timeout, interval).await?;
                Ok(())
            }
            None => {
                debug!(id = %handle.id, "no health URL advertised, treating as ready");
                Ok(())
            }
        }
    }

    /// Reads a file out of the sandbox. Default transfers via exec + base64.
    async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("base64 < {}", shell_words::quote(path)),
        ];
        let output = self.exec(id, &command, &ExecOpts::default()).await?;
        if !output.success() {
            return Err(Error::backend(format!(
                "reading {path} failed: {}",
                output.stderr.trim()
            )));
        }
        let compact: String = output.stdout.split_whitespace().collect();
        BASE64
            .decode(compact)
            .map_err(|e| Error::backend(format!("reading {path} returned invalid base64: {e}")))
    }

    /// Writes a file into the sandbox. Default transfers via exec + base64.
    async fn write_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<()> {
        let encoded = BASE64.encode(contents);
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "printf '%s' {encoded} | base64 -d > {}",
                shell_words::quote(path)
            ),
        ];
        let output = self.exec(id, &command, &ExecOpts::default()).await?;
        if !output.success() {
            return Err(Error::backend(format!(
                "writing {path} failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Writes several files. Default loops over `write_file`.
    async fn write_files(&self, id: &str, files: &[(String, Vec<u8>)]) -> Result<()> {
        for (path, contents) in files {
            self.write_file(id, path, contents).await?;
        }
        Ok(())
    }

    /// Creates one named volume.
    async fn create_volume(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported("create_volume", self.name()))
    }

    /// Creates the volumes in `config`, in order.
    ///
    /// If any creation fails, volumes already created in this sequence are
    /// deleted best-effort before the error is returned, to avoid leaking
    /// billed resources.
    async fn provision_volumes(&self, config: &SandboxConfig) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for spec in &config.volumes {
            if let Err(e) = self.create_volume(&spec.name).await {
                warn!(volume = %spec.name, error = %e, "volume creation failed, rolling back");
                let _ = self.delete_volumes(&created).await;
                return Err(e);
            }
            created.push(spec.name.clone());
        }
        Ok(created)
    }

    /// Deletes the given volumes.
    async fn delete_volumes(&self, _ids: &[String]) -> Result<()> {
        Err(Error::unsupported("delete_volumes", self.name()))
    }
}
