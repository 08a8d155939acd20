//! Warm sandbox pools and session-bound execution.
//!
//! `tidepool` provisions, pools, and recycles short-lived isolated execution
//! environments ("sandboxes") so callers can run untrusted or bursty
//! workloads without paying a cold start on every request. Four pieces do
//! the coordination work:
//!
//! - [`limiter::RateLimiter`]: a shared token-bucket gate in front of every
//!   outbound control-plane call.
//! - [`health::poll`]: a one-shot readiness poller that detects when a
//!   freshly created or resumed sandbox is actually reachable.
//! - [`pool::Pool`]: a coordinator that keeps each partition stocked with
//!   pre-warmed, stopped sandboxes.
//! - [`runner::Runner`]: a per-configuration runtime serving both stateless
//!   ephemeral execution and durable per-session sandboxes.
//!
//! Backends plug in through the [`adapter::Adapter`] trait; a
//! bollard-backed local Docker adapter ships in the crate, wrapped in
//! [`adapter::Throttled`] so every call goes through the limiter.

pub mod adapter;
pub mod config;
pub mod error;
pub mod health;
pub mod limiter;
pub mod pool;
pub mod runner;
pub mod store;
pub mod telemetry;

pub use adapter::{
    Adapter, DockerAdapter, ExecOpts, ExecOutput, SandboxConfig, SandboxHandle, SandboxStatus,
    Throttled, VolumeSpec,
};
pub use config::Config;
pub use error::{Error, Result};
pub use limiter::{ActionClass, RateLimiter};
pub use pool::{Pool, PoolConfig, PoolStatus};
pub use runner::{EndSessionOpts, Lease, RunOpts, Runner, RunnerConfig, RunnerStatus};
pub use store::{EntryStore, MemoryStore, PoolEntry};
pub use telemetry::{OperationEvent, Telemetry};
