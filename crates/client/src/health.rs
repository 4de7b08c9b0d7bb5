//! HTTP liveness check against the server's `/health` endpoint.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::HealthError;

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub url: String,
    pub body: String,
    pub latency: Duration,
}

/// `GET {base_url}/health`. Any non-2xx status is an error.
pub async fn check_health(base_url: &str, timeout: Duration) -> Result<HealthReport, HealthError> {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()?;

    let started = Instant::now();
    let resp = client.get(&url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(HealthError::Status(status.as_u16()));
    }
    let body = resp.text().await?.trim().to_string();
    let latency = started.elapsed();

    debug!(
        component = "health",
        event = "health.ok",
        url = %url,
        latency_ms = latency.as_millis() as u64,
    );
    Ok(HealthReport { url, body, latency })
}
