//! One-shot readiness polling for freshly created or resumed sandboxes.
//!
//! A disposable worker probes the sandbox's health endpoint until it answers
//! 2xx; the caller races that worker against its own deadline instead of
//! sleeping in a loop, so it stays responsive while the sandbox boots.

use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Polls `url` until it responds with a 2xx status, returning the response
/// body of the successful probe.
///
/// One worker serves exactly one call and is torn down on completion
/// regardless of outcome:
/// - the deadline elapsing aborts the worker and yields [`Error::ProbeTimeout`]
/// - a worker panic yields [`Error::ProbeCrashed`]
pub async fn poll(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<String> {
    let client = client.clone();
    let target = url.to_string();

    let mut worker = tokio::spawn(async move {
        loop {
            match client.get(&target).send().await {
                Ok(response) if response.status().is_success() => {
                    return response.text().await.unwrap_or_default();
                }
                Ok(response) => {
                    debug!(url = %target, status = %response.status(), "probe not ready yet");
                }
                Err(e) => {
                    debug!(url = %target, error = %e, "probe request failed");
                }
            }
            tokio::time::sleep(interval).await;
        }
    });

    match tokio::time::timeout(timeout, &mut worker).await {
        Ok(Ok(body)) => Ok(body),
        Ok(Err(join_error)) => Err(Error::probe_crashed(join_error.to_string())),
        Err(_) => {
            worker.abort();
            Err(Error::probe_timeout(timeout))
        }
    }
}
