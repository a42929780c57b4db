//! HTTP Health Probe
//!
//! A target is alive if `GET http://{address}{path}` answers with a 2xx.

use crate::domain::entities::ProbeOutcome;
use crate::domain::ports::HealthProbe;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Probe issuing an HTTP GET against a health path.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Ok(Self { client, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn url(&self, address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address.trim_end_matches('/'), self.path)
        } else {
            format!("http://{}{}", address, self.path)
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        let start = Instant::now();
        let result = match self.client.get(self.url(address)).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("unhealthy status: {}", resp.status())),
            Err(e) => Err(format!("request failed: {}", e)),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ProbeOutcome::Success { latency_ms },
            Err(error) => ProbeOutcome::Failure { error, latency_ms },
        }
    }
}
