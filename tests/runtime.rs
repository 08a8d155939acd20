//! End-to-end scenarios wiring the pool and runner to a mock backend
//! through the rate-limited adapter, the same shape the binary assembles.

use std::sync::Arc;
use std::time::Duration;

use tidepool::adapter::mock::MockAdapter;
use tidepool::{
    EndSessionOpts, Pool, PoolConfig, RateLimiter, RunOpts, Runner, RunnerConfig, SandboxConfig,
    MemoryStore, Telemetry, Throttled,
};

fn throttled(mock: &MockAdapter) -> Arc<Throttled> {
    // A fresh limiter per test; the process-wide shared one would couple
    // test cases through its token state.
    Arc::new(Throttled::new(Arc::new(mock.clone()), RateLimiter::new()))
}

fn pool_config(target: usize) -> PoolConfig {
    PoolConfig {
        partitions: vec!["ord".to_string()],
        target_per_partition: target,
        max_age: Duration::from_secs(60),
        replenish_interval: Duration::from_millis(20),
        health_timeout: Duration::from_secs(1),
        health_interval: Duration::from_millis(10),
        config_builder: Arc::new(|_| SandboxConfig::default()),
    }
}

fn runner_config(warm_target: usize) -> RunnerConfig {
    RunnerConfig {
        sandbox: SandboxConfig {
            image: "worker:test".to_string(),
            ..SandboxConfig::default()
        },
        default_region: "ord".to_string(),
        warm_target,
        session_volume: Some("vol-{session_id}".to_string()),
        command_timeout: Duration::from_secs(30),
        grace: Duration::from_secs(5),
        health_timeout: Duration::from_secs(1),
        health_interval: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn test_pool_cycle_over_throttled_backend() {
    let mock = MockAdapter::new();
    let pool = Pool::start(
        throttled(&mock),
        Arc::new(MemoryStore::new()),
        pool_config(1),
        Telemetry::disabled(),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pool.status().await.unwrap().per_partition.get("ord"), Some(&1));

    let entry = pool.checkout("ord").await.unwrap().unwrap();
    assert_eq!(entry.partition, "ord");

    // The checkout drained the partition; the background pass restores it.
    // The second create-and-stop pair also has to wait out a mutation-token
    // refill, so give it well over a second.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(pool.status().await.unwrap().per_partition.get("ord"), Some(&1));

    // Every warm sandbox was created, readied, and parked stopped.
    assert_eq!(mock.create_count(), 2);
    assert_eq!(mock.stop_count(), 2);
}

#[tokio::test]
async fn test_runner_session_lifecycle_over_throttled_backend() {
    let mock = MockAdapter::new();
    let runner = Runner::start(throttled(&mock), runner_config(0), Telemetry::disabled());

    let opts = RunOpts {
        session: Some("job-7".to_string()),
        ..RunOpts::default()
    };
    runner.run("make build", opts.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The second stop is the fourth mutation and waits for a token refill.
    runner.run("make test", opts).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    // One durable sandbox served both calls, stopped in between.
    assert_eq!(mock.create_count(), 1);
    assert_eq!(mock.exec_count(), 2);
    assert_eq!(mock.stop_count(), 2);
    assert_eq!(mock.start_count(), 1);

    runner
        .end_session(
            "job-7",
            EndSessionOpts {
                delete_volume: true,
                ..EndSessionOpts::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(mock.terminate_count(), 1);
    assert_eq!(mock.deleted_volumes(), vec!["vol-job-7".to_string()]);

    // The session is gone; ending it again is the expected negative result.
    let err = runner
        .end_session("job-7", EndSessionOpts::default())
        .await
        .unwrap_err();
    assert!(err.is_session_not_found());
}

#[tokio::test]
async fn test_ephemeral_and_session_paths_are_independent() {
    let mock = MockAdapter::new();
    let runner = Runner::start(throttled(&mock), runner_config(1), Telemetry::disabled());

    let session = RunOpts {
        session: Some("job-1".to_string()),
        ..RunOpts::default()
    };
    runner.run("true", session).await.unwrap();
    runner.run("true", RunOpts::default()).await.unwrap();
    // The background warm-up create is the fourth mutation and waits for a
    // token refill before it lands in the warm list.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let status = runner.status().await.unwrap();
    assert_eq!(status.sessions, 1);
    // The ephemeral sandbox went back to the warm list plus one warm-up;
    // the session sandbox never mixes into it.
    assert_eq!(status.warm, 2);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn test_pool_claim_feeds_caller_config() {
    let mock = MockAdapter::new();
    let pool = Pool::start(
        throttled(&mock),
        Arc::new(MemoryStore::new()),
        pool_config(1),
        Telemetry::disabled(),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    let wanted = SandboxConfig {
        image: "tenant/app:9".to_string(),
        ..SandboxConfig::default()
    };
    let handle = pool.claim("ord", wanted).await.unwrap().unwrap();
    assert_eq!(handle.config.image, "tenant/app:9");

    // The placeholder pool config was swapped in place on the backend.
    let updates = mock.updated_configs();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, handle.id);

    // Claiming from the now-empty partition reports cold.
    assert!(pool.claim("ord", SandboxConfig::default()).await.unwrap().is_none());
}
