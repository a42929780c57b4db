//! TCP Health Probe
//!
//! A target is alive if it accepts a TCP connection.

use crate::domain::entities::ProbeOutcome;
use crate::domain::ports::HealthProbe;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Probe that opens and immediately closes a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.shutdown().await;
                Ok(())
            }
            Ok(Err(e)) => Err(format!("connection failed: {}", e)),
            Err(_) => Err("connection timeout".to_string()),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ProbeOutcome::Success { latency_ms },
            Err(error) => ProbeOutcome::Failure { error, latency_ms },
        }
    }
}
