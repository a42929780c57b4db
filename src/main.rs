//! service-fabric - Service fabric runtime
//!
//! This is the composition root that wires together all the components.

use service_fabric::adapters::inbound::AdminApi;
use service_fabric::adapters::outbound::{HttpProbe, TcpProbe};
use service_fabric::config::{load_config, ProbeKind};
use service_fabric::domain::ports::HealthProbe;
use service_fabric::infrastructure::shutdown_signal;
use service_fabric::ServiceFabric;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting service-fabric algorithm={} targets={} topology={}",
        cfg.algorithm,
        cfg.topology.targets.len(),
        cfg.topology_path.as_deref().unwrap_or("built-in")
    );

    // ===== COMPOSITION ROOT =====

    // 1. Health probe
    let probe: Arc<dyn HealthProbe> = match &cfg.probe {
        ProbeKind::Tcp => Arc::new(TcpProbe::new(cfg.health_check_timeout())),
        ProbeKind::Http { path } => Arc::new(HttpProbe::new(path.clone(), cfg.health_check_timeout())?),
    };

    // 2. Fabric and its periodic tasks
    let fabric = Arc::new(ServiceFabric::new(&cfg, probe)?);
    fabric.start();

    // 3. Admin API
    let controller = fabric.shutdown_controller().clone();
    let api = if cfg.api_enabled {
        let api = AdminApi::new(cfg.api_listen_addr.clone(), fabric.clone());
        let api_shutdown = controller.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api.run(api_shutdown).await {
                tracing::error!("admin API error: {:?}", e);
            }
        }))
    } else {
        None
    };

    // 4. Wait for SIGINT / SIGTERM
    shutdown_signal(controller).await;

    if !fabric.shutdown().await {
        tracing::warn!("some periodic tasks were aborted");
    }
    if let Some(api) = api {
        let _ = api.await;
    }

    tracing::info!("service-fabric stopped");
    Ok(())
}
