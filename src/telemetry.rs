//! Operation telemetry for pool and runner lifecycles.
//!
//! Emits structured start/stop/error events around checkout and creation.
//! Events always land in the tracing stream; an optional webhook sink gets
//! a JSON copy. Emission is fire-and-forget and never affects control flow.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::config::TelemetrySettings;

/// One completed pool or runner operation.
#[derive(Debug, Clone)]
pub struct OperationEvent {
    /// Operation name, e.g. "checkout" or "warm_create".
    pub operation: &'static str,
    /// Partition or session the operation ran against.
    pub scope: String,
    /// How long the operation took.
    pub duration: Duration,
    /// "ok", "empty", or an error summary.
    pub outcome: String,
}

impl OperationEvent {
    pub fn new(
        operation: &'static str,
        scope: impl Into<String>,
        duration: Duration,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            scope: scope.into(),
            duration,
            outcome: outcome.into(),
        }
    }
}

/// Telemetry sink handle. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    webhook: Option<String>,
    client: reqwest::Client,
}

impl Telemetry {
    /// Creates a sink from configuration.
    pub fn new(settings: &TelemetrySettings) -> Self {
        Self {
            webhook: settings.webhook.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// A sink that only writes to the tracing stream.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Records an operation event.
    pub fn emit(&self, event: OperationEvent) {
        info!(
            event = "operation",
            operation = event.operation,
            scope = %event.scope,
            duration_ms = event.duration.as_millis() as u64,
            outcome = %event.outcome,
        );

        let Some(url) = self.webhook.clone() else {
            return;
        };
        let client = self.client.clone();
        let payload = json!({
            "operation": event.operation,
            "scope": event.scope,
            "duration_ms": event.duration.as_millis() as u64,
            "outcome": event.outcome,
            "timestamp": Utc::now().to_rfc3339(),
        });
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(status = %response.status(), "telemetry webhook rejected event");
                }
                Err(e) => {
                    warn!(error = %e, "failed to send telemetry event");
                }
            }
        });
    }
}
