use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const CONFIG_FILE: &str = "tidepool.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

/// Warm-pool configuration - how many pre-warmed sandboxes to keep per
/// partition and when entries go stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Partitions the pool stocks independently (e.g. regions)
    #[serde(default = "default_partitions")]
    pub partitions: Vec<String>,

    /// Target number of warm entries per partition
    #[serde(default = "default_target")]
    pub target_per_partition: usize,

    /// Entries older than this at pop time are discarded, not reused
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,

    /// How often the replenishment pass runs
    #[serde(default = "default_replenish_interval_ms")]
    pub replenish_interval_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            target_per_partition: default_target(),
            max_age_ms: default_max_age_ms(),
            replenish_interval_ms: default_replenish_interval_ms(),
        }
    }
}

/// Runner configuration - ephemeral warm list sizing, session volumes, and
/// command timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Region used when a session carries no explicit region
    #[serde(default = "default_region")]
    pub default_region: String,

    /// Target size of the in-process warm list for stateless runs
    #[serde(default = "default_warm_target")]
    pub warm_target: usize,

    /// Volume name template for session sandboxes; `{session_id}` is
    /// substituted. No template means sessions get no volume.
    #[serde(default)]
    pub session_volume: Option<String>,

    /// Per-command timeout in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Fixed grace period added on top of the command timeout
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            default_region: default_region(),
            warm_target: default_warm_target(),
            session_volume: None,
            command_timeout_secs: default_command_timeout(),
            grace_secs: default_grace(),
        }
    }
}

/// Template for the sandboxes this process creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Container image to run
    #[serde(default = "default_image")]
    pub image: String,

    /// Environment variables injected into every sandbox
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,

    /// Memory limit (e.g. "2g", "512m")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g. "2")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            env: std::collections::HashMap::new(),
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

/// Readiness probing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Overall deadline for a sandbox to become reachable, in milliseconds
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,

    /// Delay between probes, in milliseconds
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_health_timeout_ms(),
            interval_ms: default_health_interval_ms(),
        }
    }
}

/// Telemetry sink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Optional webhook URL; operation events are POSTed here best-effort
    #[serde(default)]
    pub webhook: Option<String>,
}

// Default value functions

fn default_partitions() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_target() -> usize {
    2
}

fn default_max_age_ms() -> u64 {
    30 * 60 * 1000
}

fn default_replenish_interval_ms() -> u64 {
    15_000
}

fn default_region() -> String {
    "default".to_string()
}

fn default_warm_target() -> usize {
    1
}

fn default_command_timeout() -> u64 {
    300
}

fn default_grace() -> u64 {
    5
}

fn default_image() -> String {
    "tidepool:latest".to_string()
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

fn default_health_timeout_ms() -> u64 {
    60_000
}

fn default_health_interval_ms() -> u64 {
    500
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.target_per_partition, 2);
        assert_eq!(config.pool.partitions, vec!["default".to_string()]);
        assert_eq!(config.runner.default_region, "default");
        assert!(config.runner.session_volume.is_none());
        assert!(config.telemetry.webhook.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[pool]
partitions = ["ord", "fra"]
target_per_partition = 3
max_age_ms = 60000

[runner]
default_region = "ord"
session_volume = "session-{session_id}"

[sandbox]
image = "worker:v2"
memory = "4g"

[telemetry]
webhook = "https://example.com/events"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.pool.partitions, vec!["ord", "fra"]);
        assert_eq!(config.pool.target_per_partition, 3);
        assert_eq!(config.pool.max_age_ms, 60_000);
        assert_eq!(config.runner.default_region, "ord");
        assert_eq!(
            config.runner.session_volume.as_deref(),
            Some("session-{session_id}")
        );
        assert_eq!(config.sandbox.image, "worker:v2");
        assert_eq!(config.sandbox.memory, "4g");
        assert_eq!(
            config.telemetry.webhook.as_deref(),
            Some("https://example.com/events")
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml = r"
[pool]
target_per_partition = 5
";
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.pool.target_per_partition, 5);
        // Everything else falls back to defaults
        assert_eq!(config.pool.replenish_interval_ms, 15_000);
        assert_eq!(config.runner.warm_target, 1);
        assert_eq!(config.health.interval_ms, 500);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.pool.target_per_partition, 2);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[runner]\ndefault_region = \"fra\"\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.runner.default_region, "fra");
    }
}
