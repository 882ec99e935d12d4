use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::SupervisorError;

const BACKEND_NAME: &str = if cfg!(windows) {
    "kiln-server.exe"
} else {
    "kiln-server"
};

/// How a backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendExit {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
    pub killed_by_us: bool,
}

impl BackendExit {
    /// A clean exit we did not ask for means the backend refused to start
    /// because another instance holds its resources.
    pub fn is_fatal_startup(&self) -> bool {
        self.code == Some(0) && !self.killed_by_us
    }
}

/// Handle to a running backend. A monitor task owns the child and
/// publishes its exit exactly once.
#[derive(Debug)]
pub struct BackendProcess {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<BackendExit>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl BackendProcess {
    pub fn spawn(cmd: &mut Command) -> Result<Self, SupervisorError> {
        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (status, killed_by_us) = tokio::select! {
                status = child.wait() => (status, false),
                _ = kill_rx => {
                    if let Err(err) = child.start_kill() {
                        warn!(target: "kiln::supervisor", error = %err, "failed to signal backend");
                    }
                    (child.wait().await, true)
                }
            };
            let exit = match status {
                Ok(status) => BackendExit {
                    code: status.code(),
                    killed_by_us,
                },
                Err(err) => {
                    warn!(target: "kiln::supervisor", error = %err, "lost track of backend process");
                    BackendExit {
                        code: None,
                        killed_by_us,
                    }
                }
            };
            let _ = exit_tx.send(Some(exit));
        });
        Ok(Self {
            pid,
            exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
        })
    }

    /// Handle for a backend this process does not own as a child. Exit is
    /// reported through the returned sender; `kill` is a no-op.
    pub fn detached(pid: Option<u32>) -> (Self, watch::Sender<Option<BackendExit>>) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = Self {
            pid,
            exit_rx,
            kill_tx: Mutex::new(None),
        };
        (handle, exit_tx)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit(&self) -> Option<BackendExit> {
        *self.exit_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit().is_none()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<BackendExit>> {
        self.exit_rx.clone()
    }

    /// Resolves when the process exits. Pending forever for a detached
    /// handle whose sender was dropped without reporting.
    pub async fn wait(&self) -> BackendExit {
        wait_exit(self.exit_watch()).await
    }

    /// Ask the monitor to kill the child. Idempotent.
    pub fn kill(&self) {
        let tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

pub(crate) async fn wait_exit(mut rx: watch::Receiver<Option<BackendExit>>) -> BackendExit {
    let exit = rx.wait_for(Option::is_some).await.ok().and_then(|seen| *seen);
    match exit {
        Some(exit) => exit,
        None => std::future::pending().await,
    }
}

/// Seam for starting the backend.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self) -> Result<BackendProcess, SupervisorError>;
}

/// Where the backend will be started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    Binary(PathBuf),
    /// Source entry point: `cargo run -p kiln-server` in this workspace.
    Source { manifest: PathBuf },
}

/// Binary locations in preference order: a self-contained bundle next to
/// the running executable first, then workspace build outputs.
pub fn binary_candidates(exe_dir: Option<&Path>, cwd: Option<&Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(dir) = exe_dir {
        out.push(dir.join(BACKEND_NAME));
        out.push(dir.join("bin").join(BACKEND_NAME));
    }
    if let Some(cwd) = cwd {
        for dir in cwd.ancestors().take(4) {
            out.push(dir.join("target").join("release").join(BACKEND_NAME));
            out.push(dir.join("target").join("debug").join(BACKEND_NAME));
        }
    }
    out
}

fn workspace_manifest(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .map(|dir| dir.join("Cargo.toml"))
        .find(|manifest| {
            std::fs::read_to_string(manifest)
                .map(|text| text.contains("[workspace]") && text.contains("kiln-server"))
                .unwrap_or(false)
        })
}

/// Resolve the backend: an explicitly configured path wins, then the
/// binary candidates, then a source entry point.
pub fn locate_backend(configured: Option<&str>) -> Option<BackendTarget> {
    if let Some(path) = configured.map(str::trim).filter(|p| !p.is_empty()) {
        return Some(BackendTarget::Binary(PathBuf::from(path)));
    }
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let cwd = std::env::current_dir().ok();
    if let Some(found) = binary_candidates(exe_dir.as_deref(), cwd.as_deref())
        .into_iter()
        .find(|candidate| candidate.is_file())
    {
        return Some(BackendTarget::Binary(found));
    }
    cwd.as_deref()
        .and_then(workspace_manifest)
        .map(|manifest| BackendTarget::Source { manifest })
}

/// Starts the backend as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn command(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    pub fn from_target(target: BackendTarget) -> Self {
        match target {
            BackendTarget::Binary(path) => Self::command(path, Vec::new()),
            BackendTarget::Source { manifest } => Self::command(
                "cargo",
                vec![
                    "run".into(),
                    "--quiet".into(),
                    "--manifest-path".into(),
                    manifest.display().to_string(),
                    "-p".into(),
                    "kiln-server".into(),
                ],
            ),
        }
    }

    pub fn locate(configured: Option<&str>) -> Result<Self, SupervisorError> {
        locate_backend(configured)
            .map(Self::from_target)
            .ok_or(SupervisorError::BackendNotFound)
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<BackendProcess, SupervisorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        let process = BackendProcess::spawn(&mut cmd)?;
        info!(
            target: "kiln::supervisor",
            program = %self.program.display(),
            pid = ?process.pid(),
            "spawned backend"
        );
        Ok(process)
    }
}
