use std::io;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use kiln_core::{load_effective_config, Backoff};
use kiln_service::PushSubscription;
use kiln_topics::BRIDGE_EVENT_COMPLETE;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod app_state;
mod handlers;
mod instance_lock;
mod ipc_server;
mod relay;
mod scenes;
mod tasks;

use app_state::AppState;
use instance_lock::{InstanceLock, LockOutcome};
use scenes::SceneDirector;
use tasks::TaskManager;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    kiln_otel::init();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(target: "kiln::server", error = %format!("{err:#}"), "backend failed");
            ExitCode::FAILURE
        }
    }
}

/// Exits cleanly without serving when another backend already owns the
/// state directory or the IPC address. Front-ends read that clean exit as a
/// fatal startup and stop respawning.
async fn run() -> anyhow::Result<()> {
    let config = load_effective_config().context("loading configuration")?;
    let state_dir = config.state_dir();
    let lock = match InstanceLock::acquire(&state_dir)
        .with_context(|| format!("locking {}", state_dir.display()))?
    {
        LockOutcome::Acquired(lock) => lock,
        LockOutcome::Held { path } => {
            warn!(target: "kiln::server", lock = %path.display(), "another backend holds the instance lock; exiting");
            return Ok(());
        }
    };

    let addr = config.ipc.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            warn!(target: "kiln::server", %addr, "ipc address already in use; exiting");
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("binding {addr}")),
    };

    let state = AppState::build(config)?;
    info!(
        target: "kiln::server",
        pid = std::process::id(),
        state_dir = %state.state_dir.display(),
        service = %state.service.base_url(),
        "backend starting"
    );

    let mut tasks = TaskManager::new();
    if state.config.service.launch_command.is_some() {
        let launcher = state.launcher.clone();
        tasks.push_handle(
            "service.launch",
            tokio::spawn(async move {
                match launcher.ensure_running().await {
                    Ok(outcome) => info!(target: "kiln::service", ?outcome, "generation service available"),
                    Err(err) => warn!(target: "kiln::service", error = %err, "generation service not started"),
                }
            }),
        );
    }

    let push = if state.config.service.push {
        match PushSubscription::spawn(state.service.clone(), push_backoff()) {
            Ok(push) => Some(push),
            Err(err) => {
                warn!(target: "kiln::service", error = %err, "push progress disabled");
                None
            }
        }
    } else {
        None
    };

    tasks.push_handle("orchestrator.poller", state.orchestrator.spawn_background());
    tasks.extend(relay::start(&state));
    let scene_handler = SceneDirector::from_state(&state).install();

    let server = tokio::spawn(ipc_server::serve(listener, state.clone()));
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = state.shutdown.cancelled() => {
            info!(target: "kiln::server", "shutdown requested by front-end");
        }
    }
    state.shutdown.cancel();
    state.bridge.off_event(BRIDGE_EVENT_COMPLETE, scene_handler);

    info!(target: "kiln::server", "shutting down background tasks");
    if let Err(err) = server.await {
        warn!(target: "kiln::server", error = %err, "ipc listener ended abnormally");
    }
    state.orchestrator.shutdown();
    if let Some(push) = push {
        push.join().await;
    }
    state.bridge.disconnect();
    state.launcher.stop().await;
    tasks.shutdown_with_grace(SHUTDOWN_GRACE).await;
    drop(lock);
    info!(target: "kiln::server", "backend stopped");
    Ok(())
}

fn push_backoff() -> Backoff {
    Backoff::doubling(Duration::from_secs(1), Duration::from_secs(30), u32::MAX)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(target: "kiln::server", error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!(target: "kiln::server", "shutdown signal received");
}
