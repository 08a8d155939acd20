//! Warm-pool coordinator.
//!
//! Keeps each registered partition stocked with a target number of
//! pre-warmed, stopped sandboxes so callers can skip the cold-start path.
//! All pool state lives inside a single message-processing actor task;
//! sandbox creation and readiness waiting run on spawned tasks that report
//! back by message, so the actor stays responsive while creations are in
//! flight.
//!
//! The pool deliberately does not terminate its warm sandboxes on shutdown:
//! orphaned warm sandboxes are reconciled by an external process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, SandboxConfig, SandboxHandle};
use crate::error::{Error, Result};
use crate::store::{EntryStore, PoolEntry};
use crate::telemetry::{OperationEvent, Telemetry};

/// Environment marker injected into pool-created sandboxes. Replaced with
/// the caller's real configuration when an entry is claimed.
pub const POOL_MARKER_ENV: &str = "TIDEPOOL_POOL";
/// Environment key carrying the partition a warm sandbox was stocked for.
pub const POOL_PARTITION_ENV: &str = "TIDEPOOL_PARTITION";

/// Checkout replies quickly or not at all; the pool never creates
/// synchronously on this path.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);
/// Claim additionally waits on the adapter's config-update round trip.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the sandbox configuration for a warm entry in a given partition.
pub type ConfigBuilder = Arc<dyn Fn(&str) -> SandboxConfig + Send + Sync>;

/// Static configuration for one pool coordinator.
#[derive(Clone)]
pub struct PoolConfig {
    /// Partitions to stock at startup; more can be registered at runtime.
    pub partitions: Vec<String>,
    /// Target number of warm entries per partition.
    pub target_per_partition: usize,
    /// Entries older than this at pop time are discarded.
    pub max_age: Duration,
    /// How often the replenishment pass runs.
    pub replenish_interval: Duration,
    /// Deadline for a fresh sandbox to become reachable.
    pub health_timeout: Duration,
    /// Delay between readiness probes.
    pub health_interval: Duration,
    /// Per-partition sandbox configuration builder.
    pub config_builder: ConfigBuilder,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Warm entry count per managed partition.
    pub per_partition: HashMap<String, usize>,
    /// Partitions with a creation currently in flight.
    pub pending_creations: usize,
}

enum Command {
    Checkout {
        partition: String,
        reply: oneshot::Sender<Result<Option<PoolEntry>>>,
    },
    Claim {
        partition: String,
        config: SandboxConfig,
        reply: oneshot::Sender<Result<Option<SandboxHandle>>>,
    },
    Status {
        reply: oneshot::Sender<Result<PoolStatus>>,
    },
    RegisterPartition {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    UnregisterPartition {
        key: String,
        drain: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    WarmReady {
        partition: String,
        entry: PoolEntry,
    },
    WarmFailed {
        partition: String,
        message: String,
    },
}

/// Handle to a pool coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    tx: mpsc::Sender<Command>,
}

impl Pool {
    /// Starts a pool actor over the given adapter and inventory store.
    pub fn start(
        adapter: Arc<dyn Adapter>,
        store: Arc<dyn EntryStore>,
        config: PoolConfig,
        telemetry: Telemetry,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let actor = PoolActor {
            adapter,
            store,
            partitions: config.partitions.clone(),
            config,
            telemetry,
            tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Pops a warm entry for `partition`, or reports the pool empty.
    ///
    /// Never creates synchronously; an empty result means this caller takes
    /// the cold path while the pool replenishes in the background.
    pub async fn checkout(&self, partition: &str) -> Result<Option<PoolEntry>> {
        self.call(CHECKOUT_TIMEOUT, |reply| Command::Checkout {
            partition: partition.to_string(),
            reply,
        })
        .await
    }

    /// Checkout plus an in-place adapter reconfiguration, so the returned
    /// handle already carries the caller's configuration instead of the
    /// pool's placeholder markers.
    pub async fn claim(
        &self,
        partition: &str,
        config: SandboxConfig,
    ) -> Result<Option<SandboxHandle>> {
        self.call(CLAIM_TIMEOUT, |reply| Command::Claim {
            partition: partition.to_string(),
            config,
            reply,
        })
        .await
    }

    /// Current warm counts and in-flight creations.
    pub async fn status(&self) -> Result<PoolStatus> {
        self.call(CHECKOUT_TIMEOUT, |reply| Command::Status { reply })
            .await
    }

    /// Adds a partition to the managed set. Registering an existing
    /// partition is a no-op.
    pub async fn register_partition(&self, key: &str) -> Result<()> {
        self.call(CHECKOUT_TIMEOUT, |reply| Command::RegisterPartition {
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Removes a partition from the managed set. With `drain`, its warm
    /// sandboxes are terminated best-effort; without, they are left for
    /// external reconciliation.
    pub async fn unregister_partition(&self, key: &str, drain: bool) -> Result<()> {
        self.call(CLAIM_TIMEOUT, |reply| Command::UnregisterPartition {
            key: key.to_string(),
            drain,
            reply,
        })
        .await
    }

    async fn call<T>(
        &self,
        timeout: Duration,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::backend("pool coordinator has shut down"))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::backend("pool coordinator dropped the request")),
            Err(_) => Err(Error::timeout(timeout)),
        }
    }
}

struct PoolActor {
    adapter: Arc<dyn Adapter>,
    store: Arc<dyn EntryStore>,
    partitions: Vec<String>,
    config: PoolConfig,
    telemetry: Telemetry,
    tx: mpsc::Sender<Command>,
}

impl PoolActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.replenish_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.replenish().await,
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        // Warm sandboxes are intentionally left running for external
        // reconciliation; nothing to tear down here.
        debug!("pool coordinator stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Checkout { partition, reply } => {
                let result = self.checkout(&partition).await;
                let _ = reply.send(result);
            }
            Command::Claim {
                partition,
                config,
                reply,
            } => {
                let result = self.claim(&partition, config).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status().await);
            }
            Command::RegisterPartition { key, reply } => {
                if !self.partitions.contains(&key) {
                    info!(partition = %key, "registering partition");
                    self.partitions.push(key);
                }
                let _ = reply.send(Ok(()));
            }
            Command::UnregisterPartition { key, drain, reply } => {
                let result = self.unregister(&key, drain).await;
                let _ = reply.send(result);
            }
            Command::WarmReady { partition, entry } => {
                info!(partition = %partition, id = %entry.id, "warm sandbox ready");
                if let Err(e) = self.store.push(entry).await {
                    warn!(partition = %partition, error = %e, "failed to store warm entry");
                }
                // Cleared unconditionally, success or failure.
                let _ = self.store.set_pending(&partition, false).await;
            }
            Command::WarmFailed { partition, message } => {
                // No retry backoff: the partition stays under target until
                // the next replenish cycle.
                warn!(partition = %partition, error = %message, "warm creation failed");
                let _ = self.store.set_pending(&partition, false).await;
            }
        }
    }

    async fn checkout(&mut self, partition: &str) -> Result<Option<PoolEntry>> {
        let started = Instant::now();
        let popped = self.store.pop(partition, self.config.max_age).await?;
        let outcome = if popped.is_some() { "warm" } else { "empty" };
        self.telemetry.emit(OperationEvent::new(
            "checkout",
            partition,
            started.elapsed(),
            outcome,
        ));
        if popped.is_some() {
            // Unconditional top-up after every successful checkout; a no-op
            // when the partition is already at target.
            self.replenish().await;
        }
        Ok(popped)
    }

    async fn claim(
        &mut self,
        partition: &str,
        config: SandboxConfig,
    ) -> Result<Option<SandboxHandle>> {
        let Some(entry) = self.checkout(partition).await? else {
            return Ok(None);
        };
        self.adapter.update(&entry.id, &config).await?;
        Ok(Some(SandboxHandle {
            id: entry.id,
            backend: self.adapter.name().to_string(),
            config,
            metadata: entry.data,
            created_at: entry.created_at,
        }))
    }

    async fn status(&self) -> Result<PoolStatus> {
        let mut per_partition = HashMap::new();
        for partition in &self.partitions {
            per_partition.insert(partition.clone(), self.store.count(partition).await?);
        }
        Ok(PoolStatus {
            per_partition,
            pending_creations: self.store.pending_count().await?,
        })
    }

    async fn unregister(&mut self, key: &str, drain: bool) -> Result<()> {
        info!(partition = %key, drain, "unregistering partition");
        self.partitions.retain(|partition| partition != key);
        if !drain {
            return Ok(());
        }
        // Drain everything regardless of age; these sandboxes are going away.
        while let Some(entry) = self.store.pop(key, Duration::MAX).await? {
            let adapter = self.adapter.clone();
            tokio::spawn(async move {
                if let Err(e) = adapter.terminate(&entry.id).await {
                    warn!(id = %entry.id, error = %e, "failed to terminate drained sandbox");
                }
            });
        }
        Ok(())
    }

    /// One replenishment pass: for every managed partition under target with
    /// no creation pending, kick off exactly one background creation.
    async fn replenish(&mut self) {
        for partition in self.partitions.clone() {
            match self.store.pending(&partition).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(partition = %partition, error = %e, "pending lookup failed");
                    continue;
                }
            }
            let count = match self.store.count(&partition).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(partition = %partition, error = %e, "count lookup failed");
                    continue;
                }
            };
            if count >= self.config.target_per_partition {
                continue;
            }
            if let Err(e) = self.store.set_pending(&partition, true).await {
                warn!(partition = %partition, error = %e, "failed to mark creation pending");
                continue;
            }
            debug!(partition = %partition, count, target = self.config.target_per_partition,
                "spawning warm creation");
            self.spawn_warm_create(partition);
        }
    }

    fn spawn_warm_create(&self, partition: String) {
        let adapter = self.adapter.clone();
        let telemetry = self.telemetry.clone();
        let tx = self.tx.clone();
        let builder = self.config.config_builder.clone();
        let health_timeout = self.config.health_timeout;
        let health_interval = self.config.health_interval;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut config = (builder)(&partition);
            config
                .env
                .insert(POOL_MARKER_ENV.to_string(), "warm".to_string());
            config
                .env
                .insert(POOL_PARTITION_ENV.to_string(), partition.clone());

            let result = warm_create(&*adapter, &config, health_timeout, health_interval).await;
            let outcome = match &result {
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            };
            telemetry.emit(OperationEvent::new(
                "warm_create",
                partition.as_str(),
                started.elapsed(),
                outcome,
            ));

            let message = match result {
                Ok(handle) => Command::WarmReady {
                    entry: PoolEntry {
                        id: handle.id,
                        partition: partition.clone(),
                        data: handle.metadata,
                        created_at: handle.created_at,
                    },
                    partition,
                },
                Err(e) => Command::WarmFailed {
                    partition,
                    message: e.to_string(),
                },
            };
            let _ = tx.send(message).await;
        });
    }
}

/// Create a sandbox, wait until it is reachable, then stop it so it holds
/// no compute while parked in the pool. A sandbox that fails readiness or
/// refuses to stop is terminated best-effort rather than pooled broken.
async fn warm_create(
    adapter: &dyn Adapter,
    config: &SandboxConfig,
    health_timeout: Duration,
    health_interval: Duration,
) -> Result<SandboxHandle> {
    let handle = adapter.create(config).await?;
    if let Err(e) = adapter
        .await_ready(&handle, health_timeout, health_interval)
        .await
    {
        let _ = adapter.terminate(&handle.id).await;
        return Err(e);
    }
    if let Err(e) = adapter.stop(&handle.id).await {
        let _ = adapter.terminate(&handle.id).await;
        return Err(e);
    }
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;
    use crate::store::MemoryStore;

    fn pool_config(replenish_interval: Duration, target: usize, max_age: Duration) -> PoolConfig {
        PoolConfig {
            partitions: vec!["ord".to_string()],
            target_per_partition: target,
            max_age,
            replenish_interval,
            health_timeout: Duration::from_secs(1),
            health_interval: Duration::from_millis(10),
            config_builder: Arc::new(|_| SandboxConfig::default()),
        }
    }

    fn start_pool(adapter: MockAdapter, config: PoolConfig) -> Pool {
        Pool::start(
            Arc::new(adapter),
            Arc::new(MemoryStore::new()),
            config,
            Telemetry::disabled(),
        )
    }

    #[tokio::test]
    async fn test_replenish_fills_to_target() {
        let adapter = MockAdapter::new();
        let pool = start_pool(
            adapter.clone(),
            pool_config(Duration::from_millis(20), 1, Duration::from_secs(60)),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = pool.status().await.unwrap();
        assert_eq!(status.per_partition.get("ord"), Some(&1));
        assert_eq!(status.pending_creations, 0);
        // Exactly one creation, parked stopped.
        assert_eq!(adapter.create_count(), 1);
        assert_eq!(adapter.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_checkout_drains_and_restores() {
        let adapter = MockAdapter::new();
        let pool = start_pool(
            adapter.clone(),
            pool_config(Duration::from_millis(20), 1, Duration::from_secs(60)),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let entry = pool.checkout("ord").await.unwrap().unwrap();
        assert_eq!(entry.partition, "ord");
        assert!(pool.checkout("ord").await.unwrap().is_none());

        // Background replenishment restores the partition to target.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = pool.status().await.unwrap();
        assert_eq!(status.per_partition.get("ord"), Some(&1));
    }

    #[tokio::test]
    async fn test_checkout_empty_partition_is_none() {
        let pool = start_pool(
            MockAdapter::new(),
            pool_config(Duration::from_secs(60), 0, Duration::from_secs(60)),
        );
        assert!(pool.checkout("ord").await.unwrap().is_none());
        assert!(pool.checkout("never-registered").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_flag_dedups_creations() {
        let adapter = MockAdapter::with_create_delay(Duration::from_millis(500));
        let _pool = start_pool(
            adapter.clone(),
            pool_config(Duration::from_millis(10), 1, Duration::from_secs(60)),
        );

        // Many replenish ticks elapse while the first creation is still in
        // flight; the pending flag keeps it to a single backend call.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(adapter.create_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_applies_caller_config() {
        let adapter = MockAdapter::new();
        let pool = start_pool(
            adapter.clone(),
            pool_config(Duration::from_millis(20), 1, Duration::from_secs(60)),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let config = SandboxConfig {
            image: "caller/image:1".to_string(),
            ..SandboxConfig::default()
        };
        let handle = pool.claim("ord", config.clone()).await.unwrap().unwrap();
        assert_eq!(handle.backend, "mock");
        assert_eq!(handle.config.image, "caller/image:1");

        let updates = adapter.updated_configs();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, handle.id);
        assert_eq!(updates[0].1.image, "caller/image:1");
    }

    #[tokio::test]
    async fn test_stale_entry_is_not_returned() {
        let adapter = MockAdapter::new();
        let pool = start_pool(
            adapter.clone(),
            pool_config(Duration::from_millis(20), 1, Duration::from_millis(1)),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Whatever was stocked is long past the 1ms budget by now.
        assert!(pool.checkout("ord").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_warm_config_carries_pool_markers() {
        let adapter = MockAdapter::new();
        let _pool = start_pool(
            adapter.clone(),
            pool_config(Duration::from_millis(20), 1, Duration::from_secs(60)),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let configs = adapter.created_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].env.get(POOL_MARKER_ENV).map(String::as_str), Some("warm"));
        assert_eq!(
            configs[0].env.get(POOL_PARTITION_ENV).map(String::as_str),
            Some("ord")
        );
    }

    #[tokio::test]
    async fn test_unregister_with_drain_terminates_entries() {
        let adapter = MockAdapter::new();
        let pool = start_pool(
            adapter.clone(),
            pool_config(Duration::from_millis(20), 1, Duration::from_secs(60)),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        pool.unregister_partition("ord", true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.terminate_count(), 1);

        let status = pool.status().await.unwrap();
        assert!(!status.per_partition.contains_key("ord"));
    }

    #[tokio::test]
    async fn test_register_partition_extends_managed_set() {
        let adapter = MockAdapter::new();
        let pool = start_pool(
            adapter.clone(),
            pool_config(Duration::from_millis(20), 1, Duration::from_secs(60)),
        );
        pool.register_partition("fra").await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = pool.status().await.unwrap();
        assert_eq!(status.per_partition.get("ord"), Some(&1));
        assert_eq!(status.per_partition.get("fra"), Some(&1));
    }

    #[tokio::test]
    async fn test_failed_creation_retried_next_cycle() {
        let adapter = MockAdapter::new();
        adapter.script_create_failure("quota exceeded");
        let pool = start_pool(
            adapter.clone(),
            pool_config(Duration::from_millis(20), 1, Duration::from_secs(60)),
        );

        // First attempt fails; the pending flag clears and a later cycle
        // succeeds.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(adapter.create_count() >= 2);
        let status = pool.status().await.unwrap();
        assert_eq!(status.per_partition.get("ord"), Some(&1));
    }
}
