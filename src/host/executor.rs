use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};

use super::client::{Exchange, ExchangeClient, Outcome};
use super::container::ContainerLifecycle;
use super::report::{self, ReportSettings, Response};

fn default_timeout() -> f64 {
    60.0
}

/// One grading request as the host receives it
#[derive(Debug, Clone, Deserialize)]
pub struct HostRequest {
    /// Identifies the submitter; names the container
    pub token: String,
    #[serde(default)]
    pub settings_version: String,
    #[serde(default)]
    pub settings: Value,
    /// Seconds to wait for any single packet
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub test: String,
}

impl HostRequest {
    pub fn io_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout)
            .ok()
            .filter(|t| !t.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_timeout()))
    }

    fn exchange(&self) -> Exchange {
        Exchange {
            version: self.settings_version.clone(),
            settings: self.settings.clone(),
            request: json!({ "code": self.code, "test": self.test }),
            timeout: self.io_timeout(),
        }
    }
}

/// Runs a request in a plugin container and reports the outcome
pub struct ProxyExecutor<L, C> {
    lifecycle: Arc<L>,
    client: C,
    port: u16,
}

impl<L, C> ProxyExecutor<L, C>
where
    L: ContainerLifecycle + 'static,
    C: ExchangeClient,
{
    pub fn new(lifecycle: L, client: C, port: u16) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
            client,
            port,
        }
    }

    pub async fn execute(&self, request: &HostRequest) -> Response {
        let settings = ReportSettings::from_value(&request.settings);
        match self.exchange(request).await {
            Ok(outcome) => {
                for notice in &outcome.debug {
                    log::debug!("Container: {notice}");
                }
                log::info!("Request {} finished with result {}", request.token, outcome.code);
                report::render(outcome.code, &outcome.data, &settings)
            }
            Err(e) => {
                log::error!("Request {} failed: {e:#}", request.token);
                Response::exception(&e, &settings)
            }
        }
    }

    async fn exchange(&self, request: &HostRequest) -> Result<Outcome> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let host = tokio::task::spawn_blocking(move || lifecycle.ensure_running())
            .await
            .context("Container lifecycle task failed")??;

        self.client
            .exchange(&host, self.port, &request.exchange())
            .await
    }
}
