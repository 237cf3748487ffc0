//! HTTP readiness probe.
//!
//! A server counts as ready as soon as anything answers HTTP on its health
//! URL. Status codes are ignored: a 404 or 500 still proves the server is up,
//! only connection-level failures (refused, timed out, bad URL) count against it.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

/// Timing and retry policy for [`HealthChecker`].
#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    /// Hard limit for a single request.
    pub timeout: Duration,
    /// Total number of attempts, including the first.
    pub max_retries: u32,
    /// Delay after the first failure; doubled after each further failure.
    pub base_delay: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

pub struct HealthChecker {
    client: Client,
    settings: HealthSettings,
}

impl HealthChecker {
    pub fn new(settings: HealthSettings) -> Self {
        let client = build_client(settings.timeout).unwrap_or_else(|err| {
            warn!(error = %err, "failed to configure health check client, using defaults");
            Client::default()
        });
        Self { client, settings }
    }

    /// Probes `url` until it answers or the attempts are exhausted.
    pub async fn check(&self, url: &str) -> bool {
        let attempts = self.settings.max_retries.max(1);
        for attempt in 0..attempts {
            if self.probe(url).await {
                return true;
            }
            if attempt + 1 < attempts {
                let delay = backoff_delay(self.settings.base_delay, attempt);
                debug!(url, attempt, ?delay, "health check failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
        false
    }

    async fn probe(&self, url: &str) -> bool {
        match self
            .client
            .get(url)
            .timeout(self.settings.timeout)
            .send()
            .await
        {
            Ok(response) => {
                debug!(url, status = %response.status(), "health check answered");
                true
            }
            Err(err) => {
                debug!(url, error = %err, "health check request failed");
                false
            }
        }
    }
}

fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(format!("devrack/{}", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .no_proxy()
        .build()
}

/// Delay before retry number `attempt + 1`: base, 2x base, 4x base, ...
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let capped = attempt.min(5);
    base.saturating_mul(1_u32 << capped)
}
