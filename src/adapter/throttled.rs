//! Rate-limited adapter decorator.
//!
//! Wraps any [`Adapter`] so that every call acquires a token from the shared
//! rate limiter before reaching the backend. This is the single choke point
//! for outbound control-plane traffic: pools and runners are handed a
//! `Throttled` adapter and never talk to the raw backend directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Adapter, ExecOpts, ExecOutput, SandboxConfig, SandboxHandle, SandboxStatus};
use crate::error::Result;
use crate::limiter::{ActionClass, RateLimiter};

/// An [`Adapter`] that gates every backend call through a [`RateLimiter`].
#[derive(Clone)]
pub struct Throttled {
    inner: Arc<dyn Adapter>,
    limiter: RateLimiter,
}

impl Throttled {
    /// Wraps `inner` with the given limiter.
    pub fn new(inner: Arc<dyn Adapter>, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }

    /// Wraps `inner` with the process-wide shared limiter.
    pub fn shared(inner: Arc<dyn Adapter>) -> Self {
        Self::new(inner, RateLimiter::shared().clone())
    }
}

#[async_trait]
impl Adapter for Throttled {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle> {
        self.limiter.acquire(ActionClass::Mutation).await;
        self.inner.create(config).await
    }

    async fn exec(&self, id: &str, command: &[String], opts: &ExecOpts) -> Result<ExecOutput> {
        self.limiter.acquire(ActionClass::Read).await;
        self.inner.exec(id, command, opts).await
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        self.limiter.acquire(ActionClass::Mutation).await;
        self.inner.terminate(id).await
    }

    async fn status(&self, id: &str) -> Result<SandboxStatus> {
        self.limiter.acquire(ActionClass::Read).await;
        self.inner.status(id).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.limiter.acquire(ActionClass::Mutation).await;
        self.inner.stop(id).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.limiter.acquire(ActionClass::Mutation).await;
        self.inner.start(id).await
    }

    async fn update(&self, id: &str, config: &SandboxConfig) -> Result<()> {
        self.limiter.acquire(ActionClass::Mutation).await;
        self.inner.update(id, config).await
    }

    async fn await_ready(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        // Readiness probes hit the sandbox itself, not the control plane,
        // so they take no token.
        self.inner.await_ready(handle, timeout, interval).await
    }

    async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        self.limiter.acquire(ActionClass::Read).await;
        self.inner.read_file(id, path).await
    }

    async fn write_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.limiter.acquire(ActionClass::Read).await;
        self.inner.write_file(id, path, contents).await
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.limiter.acquire(ActionClass::Mutation).await;
        self.inner.create_volume(name).await
    }

    async fn delete_volumes(&self, ids: &[String]) -> Result<()> {
        self.limiter.acquire(ActionClass::Mutation).await;
        self.inner.delete_volumes(ids).await
    }
}
