//! Per-configuration sandbox runtime.
//!
//! A [`Runner`] serves two traffic shapes over one adapter: stateless
//! ephemeral execution (borrow from an in-process warm list, return on
//! completion) and session-bound execution (one durable sandbox, optionally
//! with a volume, per session key, stopped between uses rather than
//! destroyed). All state lives inside a single actor task; leases hand
//! sandboxes out and a drop guard returns them on every exit path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, ExecOpts, ExecOutput, SandboxConfig, SandboxHandle, SandboxStatus, VolumeSpec};
use crate::config::{HealthSettings, RunnerSettings};
use crate::error::{Error, Result};
use crate::telemetry::{OperationEvent, Telemetry};

/// Where a session volume is mounted inside the sandbox.
pub const SESSION_VOLUME_MOUNT: &str = "/workspace";

/// Static configuration for one runner.
#[derive(Clone)]
pub struct RunnerConfig {
    /// Template configuration for every sandbox this runner creates.
    pub sandbox: SandboxConfig,
    /// Region used when a session carries no explicit region.
    pub default_region: String,
    /// Target size of the warm list for stateless runs.
    pub warm_target: usize,
    /// Volume name template for sessions; `{session_id}` is substituted.
    pub session_volume: Option<String>,
    /// Per-command execution timeout.
    pub command_timeout: Duration,
    /// Fixed grace period added on top of the command timeout.
    pub grace: Duration,
    /// Deadline for a fresh sandbox to become reachable.
    pub health_timeout: Duration,
    /// Delay between readiness probes.
    pub health_interval: Duration,
}

impl RunnerConfig {
    /// Builds a runner configuration from the loaded settings sections.
    pub fn from_settings(
        sandbox: SandboxConfig,
        runner: &RunnerSettings,
        health: &HealthSettings,
    ) -> Self {
        Self {
            sandbox,
            default_region: runner.default_region.clone(),
            warm_target: runner.warm_target,
            session_volume: runner.session_volume.clone(),
            command_timeout: Duration::from_secs(runner.command_timeout_secs),
            grace: Duration::from_secs(runner.grace_secs),
            health_timeout: Duration::from_millis(health.timeout_ms),
            health_interval: Duration::from_millis(health.interval_ms),
        }
    }
}

/// Options for one `run` or `transaction` call.
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    /// Session key; absent means the stateless ephemeral path.
    pub session: Option<String>,
    /// Region for session keying; falls back to the configured default.
    pub region: Option<String>,
    /// Exec options forwarded to the adapter.
    pub exec: ExecOpts,
}

/// Options for `end_session`.
#[derive(Debug, Clone, Default)]
pub struct EndSessionOpts {
    /// Region the session was keyed under; falls back to the default.
    pub region: Option<String>,
    /// Also delete the session's volumes through the adapter.
    pub delete_volume: bool,
}

/// Snapshot of runner occupancy.
#[derive(Debug, Clone)]
pub struct RunnerStatus {
    pub warm: usize,
    pub in_use: usize,
    pub sessions: usize,
    pub pending_warmups: usize,
}

enum Command {
    Lease {
        session: Option<SessionRef>,
        reply: oneshot::Sender<Result<Lease>>,
    },
    Checkin {
        lease_id: u64,
    },
    EndSession {
        key: String,
        delete_volume: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<RunnerStatus>,
    },
    WarmupDone {
        result: Result<SandboxHandle>,
    },
}

struct SessionRef {
    session_id: String,
    region: String,
}

impl SessionRef {
    fn key(&self) -> String {
        format!("{}:{}", self.session_id, self.region)
    }
}

/// A borrowed sandbox, returned to the runner when dropped.
///
/// Ephemeral leases go back on the warm list; session leases stop the
/// session's sandbox so its volume keeps state for the next call.
pub struct Lease {
    id: u64,
    handle: SandboxHandle,
    adapter: Arc<dyn Adapter>,
    // Unbounded so the drop guard can send without awaiting.
    tx: mpsc::UnboundedSender<Command>,
}

impl Lease {
    /// The sandbox this lease holds.
    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// Runs a command inside the leased sandbox.
    pub async fn exec(&self, command: &[String], opts: &ExecOpts) -> Result<ExecOutput> {
        self.adapter.exec(&self.handle.id, command, opts).await
    }

    /// Reads a file out of the leased sandbox.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.adapter.read_file(&self.handle.id, path).await
    }

    /// Writes a file into the leased sandbox.
    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.adapter.write_file(&self.handle.id, path, contents).await
    }

    /// Writes several files into the leased sandbox.
    pub async fn write_files(&self, files: &[(String, Vec<u8>)]) -> Result<()> {
        self.adapter.write_files(&self.handle.id, files).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // If the actor is gone the sandbox is unrecoverable anyway.
        let _ = self.tx.send(Command::Checkin { lease_id: self.id });
    }
}

/// Handle to a runner actor. Cheap to clone.
#[derive(Clone)]
pub struct Runner {
    tx: mpsc::UnboundedSender<Command>,
    call_timeout: Duration,
    default_region: String,
}

impl Runner {
    /// Starts a runner actor over the given adapter.
    pub fn start(adapter: Arc<dyn Adapter>, config: RunnerConfig, telemetry: Telemetry) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let call_timeout = config.command_timeout + config.grace;
        let default_region = config.default_region.clone();
        let actor = RunnerActor {
            adapter,
            config,
            telemetry,
            tx: tx.clone(),
            warm: Vec::new(),
            in_use: HashMap::new(),
            sessions: HashMap::new(),
            pending_warmups: 0,
            next_lease: 0,
        };
        tokio::spawn(actor.run(rx));
        Self {
            tx,
            call_timeout,
            default_region,
        }
    }

    /// Runs one shell command and returns its captured output.
    ///
    /// Without a session in `opts` the command runs on an ephemeral sandbox
    /// from the warm list (cold-created if the list is empty, which this
    /// call then pays for). With a session it runs on that session's durable
    /// sandbox. The wait is bounded by the command timeout plus grace.
    pub async fn run(&self, command_line: &str, opts: RunOpts) -> Result<ExecOutput> {
        let command = shell_words::split(command_line)
            .map_err(|e| Error::invalid_config(format!("unparseable command: {e}")))?;
        let lease = self.lease(&opts).await?;
        match tokio::time::timeout(self.call_timeout, lease.exec(&command, &opts.exec)).await {
            Ok(result) => result,
            // The lease drops here, so the sandbox is still returned; the
            // in-flight exec continues server-side.
            Err(_) => Err(Error::timeout(self.call_timeout)),
        }
    }

    /// Leases a sandbox, passes it to `f`, and returns it when the future
    /// completes on any path.
    pub async fn transaction<F, Fut, T>(&self, opts: RunOpts, f: F) -> Result<T>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.lease(&opts).await?;
        f(lease).await
    }

    /// Removes and terminates a session's sandbox.
    ///
    /// An unknown session yields [`Error::SessionNotFound`], a normal
    /// negative result rather than a failure.
    pub async fn end_session(&self, session_id: &str, opts: EndSessionOpts) -> Result<()> {
        let region = opts.region.as_deref().unwrap_or(&self.default_region);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::EndSession {
                key: format!("{session_id}:{region}"),
                delete_volume: opts.delete_volume,
                reply: reply_tx,
            })
            .map_err(|_| Error::backend("runner has shut down"))?;
        reply_rx
            .await
            .map_err(|_| Error::backend("runner dropped the request"))?
    }

    /// Current warm, in-use, and session counts.
    pub async fn status(&self) -> Result<RunnerStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply: reply_tx })
            .map_err(|_| Error::backend("runner has shut down"))?;
        reply_rx
            .await
            .map_err(|_| Error::backend("runner dropped the request"))
    }

    async fn lease(&self, opts: &RunOpts) -> Result<Lease> {
        let session = opts.session.as_ref().map(|session_id| SessionRef {
            session_id: session_id.clone(),
            region: opts
                .region
                .clone()
                .unwrap_or_else(|| self.default_region.clone()),
        });
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Lease {
                session,
                reply: reply_tx,
            })
            .map_err(|_| Error::backend("runner has shut down"))?;
        reply_rx
            .await
            .map_err(|_| Error::backend("runner dropped the request"))?
    }
}

enum Borrowed {
    Ephemeral(SandboxHandle),
    Session { id: String },
}

struct RunnerActor {
    adapter: Arc<dyn Adapter>,
    config: RunnerConfig,
    telemetry: Telemetry,
    tx: mpsc::UnboundedSender<Command>,
    warm: Vec<SandboxHandle>,
    in_use: HashMap<u64, Borrowed>,
    sessions: HashMap<String, SandboxHandle>,
    pending_warmups: usize,
    next_lease: u64,
}

impl RunnerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Lease { session, reply } => {
                    let result = match session {
                        None => self.lease_ephemeral().await,
                        Some(session) => self.lease_session(&session).await,
                    };
                    let _ = reply.send(result);
                }
                Command::Checkin { lease_id } => self.checkin(lease_id).await,
                Command::EndSession {
                    key,
                    delete_volume,
                    reply,
                } => {
                    let _ = reply.send(self.end_session(&key, delete_volume).await);
                }
                Command::Status { reply } => {
                    let _ = reply.send(RunnerStatus {
                        warm: self.warm.len(),
                        in_use: self.in_use.len(),
                        sessions: self.sessions.len(),
                        pending_warmups: self.pending_warmups,
                    });
                }
                Command::WarmupDone { result } => {
                    self.pending_warmups = self.pending_warmups.saturating_sub(1);
                    match result {
                        Ok(handle) => {
                            debug!(id = %handle.id, "warm-up sandbox ready");
                            self.warm.push(handle);
                        }
                        Err(e) => warn!(error = %e, "warm-up failed"),
                    }
                }
            }
        }
        debug!("runner stopped");
    }

    async fn lease_ephemeral(&mut self) -> Result<Lease> {
        if let Some(handle) = self.warm.pop() {
            debug!(id = %handle.id, "serving from warm list");
            return Ok(self.issue(handle.clone(), Borrowed::Ephemeral(handle)));
        }
        // Cold path: this caller pays the full creation latency, and the
        // warm list is refilled in the background for the next one.
        let started = Instant::now();
        let result = self.create_ready(self.config.sandbox.clone()).await;
        self.telemetry.emit(OperationEvent::new(
            "cold_create",
            "ephemeral",
            started.elapsed(),
            match &result {
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
        ));
        let handle = result?;
        self.spawn_warmups();
        Ok(self.issue(handle.clone(), Borrowed::Ephemeral(handle)))
    }

    async fn lease_session(&mut self, session: &SessionRef) -> Result<Lease> {
        let key = session.key();
        if let Some(handle) = self.sessions.get(&key).cloned() {
            match self.adapter.status(&handle.id).await? {
                SandboxStatus::Running => {}
                SandboxStatus::Stopped => {
                    info!(session = %key, id = %handle.id, "resuming session sandbox");
                    self.adapter.start(&handle.id).await?;
                }
                status => {
                    return Err(Error::unexpected_status(&handle.id, status.to_string()));
                }
            }
            return Ok(self.issue(handle.clone(), Borrowed::Session { id: handle.id }));
        }

        let started = Instant::now();
        let result = self
            .create_ready(self.session_config(&session.session_id))
            .await;
        self.telemetry.emit(OperationEvent::new(
            "session_create",
            key.as_str(),
            started.elapsed(),
            match &result {
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
        ));
        let handle = result?;
        info!(session = %key, id = %handle.id, "created session sandbox");
        self.sessions.insert(key, handle.clone());
        Ok(self.issue(handle.clone(), Borrowed::Session { id: handle.id }))
    }

    async fn checkin(&mut self, lease_id: u64) {
        match self.in_use.remove(&lease_id) {
            Some(Borrowed::Ephemeral(handle)) => {
                debug!(id = %handle.id, "returning sandbox to warm list");
                self.warm.push(handle);
            }
            Some(Borrowed::Session { id }) => {
                // Stopped, never destroyed: the volume keeps state for the
                // next call under the same session key. The stop runs inline
                // so the next lease of this key observes the stopped state
                // instead of racing a detached stop.
                if let Err(e) = self.adapter.stop(&id).await {
                    warn!(id = %id, error = %e, "failed to stop session sandbox");
                }
            }
            None => warn!(lease_id, "checkin for unknown lease"),
        }
    }

    async fn end_session(&mut self, key: &str, delete_volume: bool) -> Result<()> {
        let started = Instant::now();
        let Some(handle) = self.sessions.remove(key) else {
            return Err(Error::session_not_found(key));
        };
        self.adapter.terminate(&handle.id).await?;
        if delete_volume && !handle.config.volumes.is_empty() {
            let volumes: Vec<String> = handle
                .config
                .volumes
                .iter()
                .map(|volume| volume.name.clone())
                .collect();
            self.adapter.delete_volumes(&volumes).await?;
        }
        self.telemetry.emit(OperationEvent::new(
            "end_session",
            key,
            started.elapsed(),
            "ok",
        ));
        info!(session = %key, id = %handle.id, "session ended");
        Ok(())
    }

    fn issue(&mut self, handle: SandboxHandle, borrowed: Borrowed) -> Lease {
        self.next_lease += 1;
        let id = self.next_lease;
        self.in_use.insert(id, borrowed);
        Lease {
            id,
            handle,
            adapter: self.adapter.clone(),
            tx: self.tx.clone(),
        }
    }

    fn session_config(&self, session_id: &str) -> SandboxConfig {
        let mut config = self.config.sandbox.clone();
        if let Some(template) = &self.config.session_volume {
            config.volumes.push(VolumeSpec {
                name: template.replace("{session_id}", session_id),
                mount_path: SESSION_VOLUME_MOUNT.to_string(),
            });
        }
        config
    }

    async fn create_ready(&self, config: SandboxConfig) -> Result<SandboxHandle> {
        let handle = self.adapter.create(&config).await?;
        if let Err(e) = self
            .adapter
            .await_ready(&handle, self.config.health_timeout, self.config.health_interval)
            .await
        {
            let _ = self.adapter.terminate(&handle.id).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Tops the warm list back up to target with independent background
    /// creations; the actor keeps serving while they run.
    fn spawn_warmups(&mut self) {
        let deficit = self
            .config
            .warm_target
            .saturating_sub(self.warm.len() + self.pending_warmups);
        for _ in 0..deficit {
            self.pending_warmups += 1;
            let adapter = self.adapter.clone();
            let config = self.config.sandbox.clone();
            let health_timeout = self.config.health_timeout;
            let health_interval = self.config.health_interval;
            let telemetry = self.telemetry.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = async {
                    let handle = adapter.create(&config).await?;
                    if let Err(e) = adapter
                        .await_ready(&handle, health_timeout, health_interval)
                        .await
                    {
                        let _ = adapter.terminate(&handle.id).await;
                        return Err(e);
                    }
                    Ok(handle)
                }
                .await;
                telemetry.emit(OperationEvent::new(
                    "warmup",
                    "ephemeral",
                    started.elapsed(),
                    match &result {
                        Ok(_) => "ok".to_string(),
                        Err(e) => e.to_string(),
                    },
                ));
                let _ = tx.send(Command::WarmupDone { result });
            });
        }
    }
}
