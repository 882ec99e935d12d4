use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{ServiceClient, ServiceError};

pub const READINESS_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    AlreadyRunning,
    Started { pid: Option<u32> },
}

/// Starts the generation service when its liveness probe fails and waits
/// for it to come up.
pub struct ServiceLauncher {
    client: ServiceClient,
    command: Option<Vec<String>>,
    startup_timeout: Duration,
    poll_interval: Duration,
    child: Mutex<Option<Child>>,
}

impl ServiceLauncher {
    pub fn new(client: ServiceClient) -> Self {
        let cfg = client.config();
        let command = cfg.launch_command.clone().filter(|c| !c.is_empty());
        let startup_timeout = Duration::from_secs(cfg.startup_timeout_secs);
        Self {
            client,
            command,
            startup_timeout,
            poll_interval: READINESS_POLL,
            child: Mutex::new(None),
        }
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command).filter(|c| !c.is_empty());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub async fn ensure_running(&self) -> Result<LaunchOutcome, ServiceError> {
        if self.client.is_healthy().await {
            return Ok(LaunchOutcome::AlreadyRunning);
        }
        let Some((program, args)) = self.command.as_deref().and_then(|c| c.split_first()) else {
            return Err(ServiceError::NotRunning);
        };
        info!(target: "kiln::service", program = %program, "starting generation service");
        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .spawn()
            .map_err(ServiceError::Spawn)?;
        let pid = child.id();

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(target: "kiln::service", %status, "service exited before it was ready");
                    return Err(ServiceError::ExitedDuringStartup {
                        status: status.to_string(),
                    });
                }
                Ok(None) => {}
                Err(err) => return Err(ServiceError::Spawn(err)),
            }
            if self.client.is_healthy().await {
                info!(
                    target: "kiln::service",
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generation service ready"
                );
                *self.child.lock().await = Some(child);
                return Ok(LaunchOutcome::Started { pid });
            }
            if started.elapsed() >= self.startup_timeout {
                let _ = child.start_kill();
                return Err(ServiceError::StartupTimeout(self.startup_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Kill the service if this launcher started it.
    pub async fn stop(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                warn!(target: "kiln::service", error = %err, "failed to stop generation service");
            }
        }
    }
}
