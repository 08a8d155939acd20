//! Mock adapter for testing.
//!
//! Provides a scriptable in-memory backend that tracks every lifecycle call
//! so pool and runner tests can assert on exactly which operations reached
//! the backend, without a container runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{Adapter, ExecOpts, ExecOutput, SandboxConfig, SandboxHandle, SandboxStatus};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    next_id: usize,
    statuses: HashMap<String, SandboxStatus>,
    created_configs: Vec<SandboxConfig>,
    updated_configs: Vec<(String, SandboxConfig)>,
    exec_log: Vec<Vec<String>>,
    scripted_stdout: VecDeque<String>,
    scripted_create_failures: VecDeque<String>,
    volume_failures: HashMap<String, String>,
    created_volumes: Vec<String>,
    deleted_volumes: Vec<String>,
}

/// A mock backend adapter.
///
/// Every sandbox it "creates" is a map entry; statuses move through
/// running/stopped/terminated exactly as the lifecycle calls dictate, and
/// exec output can be scripted per call.
#[derive(Clone, Default)]
pub struct MockAdapter {
    inner: Arc<Mutex<Inner>>,
    create_count: Arc<AtomicUsize>,
    exec_count: Arc<AtomicUsize>,
    terminate_count: Arc<AtomicUsize>,
    stop_count: Arc<AtomicUsize>,
    start_count: Arc<AtomicUsize>,
    update_count: Arc<AtomicUsize>,
    create_delay: Option<Duration>,
}

impl MockAdapter {
    /// Creates a mock with no latency and empty scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock whose `create` calls take `delay` to complete, for
    /// exercising overlap between concurrent callers.
    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queues stdout for the next unscripted exec call.
    pub fn script_exec_stdout(&self, stdout: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .scripted_stdout
            .push_back(stdout.into());
    }

    /// Makes the next `create` call fail with the given message.
    pub fn script_create_failure(&self, message: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .scripted_create_failures
            .push_back(message.into());
    }

    /// Number of `create` calls that reached the backend.
    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    /// Number of `exec` calls that reached the backend.
    pub fn exec_count(&self) -> usize {
        self.exec_count.load(Ordering::SeqCst)
    }

    /// Number of `terminate` calls that reached the backend.
    pub fn terminate_count(&self) -> usize {
        self.terminate_count.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls that reached the backend.
    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Number of `start` calls that reached the backend.
    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Number of `update` calls that reached the backend.
    pub fn update_count(&self) -> usize {
        self.update_count.load(Ordering::SeqCst)
    }

    /// Configurations passed to `create`, in call order.
    pub fn created_configs(&self) -> Vec<SandboxConfig> {
        self.inner.lock().unwrap().created_configs.clone()
    }

    /// Configurations passed to `update`, in call order.
    pub fn updated_configs(&self) -> Vec<(String, SandboxConfig)> {
        self.inner.lock().unwrap().updated_configs.clone()
    }

    /// The most recent exec argv, if any.
    pub fn last_exec_command(&self) -> Option<Vec<String>> {
        self.inner.lock().unwrap().exec_log.last().cloned()
    }

    /// Makes `create_volume` fail for the named volume.
    pub fn fail_volume_creation(&self, name: impl Into<String>, message: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .volume_failures
            .insert(name.into(), message.into());
    }

    /// Volume names successfully created, in call order.
    pub fn created_volumes(&self) -> Vec<String> {
        self.inner.lock().unwrap().created_volumes.clone()
    }

    /// Volume ids passed to `delete_volumes`.
    pub fn deleted_volumes(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted_volumes.clone()
    }

    /// Current status of a sandbox as the mock tracks it.
    pub fn status_of(&self, id: &str) -> SandboxStatus {
        self.inner
            .lock()
            .unwrap()
            .statuses
            .get(id)
            .copied()
            .unwrap_or(SandboxStatus::Unknown)
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        self.create_count.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.scripted_create_failures.pop_front() {
            return Err(Error::backend(message));
        }
        inner.next_id += 1;
        let id = format!("mock-{}", inner.next_id);
        inner.statuses.insert(id.clone(), SandboxStatus::Running);
        inner.created_configs.push(config.clone());

        Ok(SandboxHandle {
            id,
            backend: self.name().to_string(),
            config: config.clone(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        })
    }

    async fn exec(&self, id: &str, command: &[String], _opts: &ExecOpts) -> Result<ExecOutput> {
        self.exec_count.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        match inner.statuses.get(id) {
            Some(SandboxStatus::Running) => {}
            Some(status) => {
                return Err(Error::backend(format!("sandbox {id} is {status}, not running")))
            }
            None => return Err(Error::backend(format!("no such sandbox: {id}"))),
        }
        inner.exec_log.push(command.to_vec());
        let stdout = inner.scripted_stdout.pop_front().unwrap_or_default();
        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        self.terminate_count.fetch_add(1, Ordering::SeqCst);
        // Idempotent: terminating an unknown sandbox is success.
        self.inner
            .lock()
            .unwrap()
            .statuses
            .insert(id.to_string(), SandboxStatus::Terminated);
        Ok(())
    }

    async fn status(&self, id: &str) -> Result<SandboxStatus> {
        Ok(self.status_of(id))
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        match inner.statuses.get_mut(id) {
            Some(status @ SandboxStatus::Running) => {
                *status = SandboxStatus::Stopped;
                Ok(())
            }
            Some(SandboxStatus::Stopped) => Ok(()),
            _ => Err(Error::backend(format!("cannot stop sandbox {id}"))),
        }
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        match inner.statuses.get_mut(id) {
            Some(status @ (SandboxStatus::Running | SandboxStatus::Stopped)) => {
                *status = SandboxStatus::Running;
                Ok(())
            }
            _ => Err(Error::backend(format!("cannot start sandbox {id}"))),
        }
    }

    async fn update(&self, id: &str, config: &SandboxConfig) -> Result<()> {
        self.update_count.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .updated_configs
            .push((id.to_string(), config.clone()));
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.volume_failures.get(name) {
            return Err(Error::backend(message.clone()));
        }
        inner.created_volumes.push(name.to_string());
        Ok(())
    }

    async fn delete_volumes(&self, ids: &[String]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .deleted_volumes
            .extend(ids.iter().cloned());
        Ok(())
    }
}
