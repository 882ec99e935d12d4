use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kiln_bridge::{Bridge, BridgeOptions};
use kiln_core::orchestrator::{JobOrchestrator, OrchestratorConfig, ProgressRegistry};
use kiln_core::Config;
use kiln_events::Bus;
use kiln_service::{ServiceClient, ServiceLauncher};
use tokio_util::sync::CancellationToken;

const BUS_CAPACITY: usize = 1024;

/// Everything the IPC handlers and background tasks share.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub state_dir: PathBuf,
    pub bus: Bus,
    pub service: ServiceClient,
    pub launcher: Arc<ServiceLauncher>,
    pub orchestrator: JobOrchestrator,
    pub bridge: Bridge,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let state_dir = config.state_dir();
        let client_id = format!("kiln-{}", uuid::Uuid::new_v4().simple());
        let registry = Arc::new(ProgressRegistry::new());
        let service = ServiceClient::new(&config.service, registry.clone(), client_id.clone())
            .context("building generation service client")?;
        let launcher = Arc::new(ServiceLauncher::new(service.clone()));
        let bus = Bus::new(BUS_CAPACITY);
        let orchestrator = JobOrchestrator::new(
            Arc::new(service.clone()),
            registry,
            bus.clone(),
            OrchestratorConfig::from_config(&config),
            client_id,
        );
        let bridge = Bridge::new(BridgeOptions::from_config(&config.bridge));
        Ok(Self {
            config: Arc::new(config),
            state_dir,
            bus,
            service,
            launcher,
            orchestrator,
            bridge,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.state_dir.join("outputs")
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_secs(self.config.bridge.request_timeout_secs.max(1))
    }

    /// Ask the backend to exit once in-flight replies have had a moment to
    /// flush.
    pub fn request_shutdown(&self) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
    }
}
