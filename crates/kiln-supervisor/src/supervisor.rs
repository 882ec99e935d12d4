use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kiln_core::{Backoff, Config};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::connection::IpcConnection;
use crate::process::{BackendExit, BackendLauncher, BackendProcess};
use crate::SupervisorError;

const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Fixed loopback address of the backend.
    pub addr: String,
    /// Connect retry schedule after a spawn. `max_attempts` bounds the loop.
    pub backoff: Backoff,
}

impl SupervisorOptions {
    pub fn new(addr: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            addr: addr.into(),
            backoff,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.ipc.addr(), cfg.backend.backoff())
    }
}

/// Connect-or-spawn owner of the backend channel.
///
/// At most one connection is live at a time; after it drops the next call
/// reconnects, spawning the backend again if nothing answers. A spawned
/// backend that exits with code 0 on its own poisons the supervisor: every
/// later call fails with [`SupervisorError::FatalStartup`] and
/// [`fatal_exit`](Self::fatal_exit) resolves.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    opts: SupervisorOptions,
    launcher: Arc<dyn BackendLauncher>,
    conn: tokio::sync::Mutex<Option<IpcConnection>>,
    backend: Mutex<Option<Arc<BackendProcess>>>,
    fatal_tx: watch::Sender<Option<BackendExit>>,
    stopping: AtomicBool,
    shut_down: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionSupervisor {
    pub fn new(opts: SupervisorOptions, launcher: Arc<dyn BackendLauncher>) -> Self {
        let (fatal_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                opts,
                launcher,
                conn: tokio::sync::Mutex::new(None),
                backend: Mutex::new(None),
                fatal_tx,
                stopping: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.opts
    }

    /// The fatal startup exit, if a spawned backend has reported one.
    pub fn fatal(&self) -> Option<BackendExit> {
        *self.inner.fatal_tx.borrow()
    }

    /// Resolves once a spawned backend has signalled a fatal startup.
    pub async fn fatal_exit(&self) -> BackendExit {
        let mut rx = self.inner.fatal_tx.subscribe();
        let seen = rx.wait_for(Option::is_some).await.ok().and_then(|v| *v);
        match seen {
            Some(exit) => exit,
            None => std::future::pending().await,
        }
    }

    /// Return a live connection, spawning the backend if nothing answers.
    pub async fn ensure_connected(&self) -> Result<IpcConnection, SupervisorError> {
        self.inner.check_usable()?;
        let mut slot = self.inner.conn.lock().await;
        self.inner.check_usable()?;
        if let Some(conn) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Ok(conn.clone());
        }
        *slot = None;

        let addr = self.inner.opts.addr.clone();
        match IpcConnection::connect(&addr).await {
            Ok(conn) => {
                debug!(target: "kiln::supervisor", addr = %addr, "connected to running backend");
                *slot = Some(conn.clone());
                return Ok(conn);
            }
            Err(err) => {
                debug!(target: "kiln::supervisor", addr = %addr, error = %err, "backend not reachable")
            }
        }

        let alive = lock(&self.inner.backend)
            .as_ref()
            .is_some_and(|p| p.is_running());
        if !alive {
            self.inner.start_backend().await?;
        }

        let policy = self.inner.opts.backoff;
        let attempts = policy.max_attempts.max(1);
        let mut last_err = io::Error::new(io::ErrorKind::ConnectionRefused, "backend not reachable");
        let mut fatal_rx = self.inner.fatal_tx.subscribe();
        for attempt in 0..attempts {
            let delay = policy.delay_for(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = async { let _ = fatal_rx.wait_for(Option::is_some).await; } => {}
            }
            self.inner.check_usable()?;
            match IpcConnection::connect(&addr).await {
                Ok(conn) => {
                    info!(
                        target: "kiln::supervisor",
                        addr = %addr,
                        attempt = attempt + 1,
                        "connected to backend"
                    );
                    *slot = Some(conn.clone());
                    return Ok(conn);
                }
                Err(err) => {
                    debug!(
                        target: "kiln::supervisor",
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "backend connect attempt failed"
                    );
                    last_err = err;
                }
            }
        }
        warn!(target: "kiln::supervisor", addr = %addr, attempts, "giving up on backend connect");
        Err(SupervisorError::Connect {
            addr,
            attempts,
            source: last_err,
        })
    }

    /// One multiplexed request. Resolves or fails exactly once; no timeout.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, SupervisorError> {
        let conn = self.ensure_connected().await?;
        conn.request(method, params).await
    }

    /// Like [`send`](Self::send) with a deadline on the response. Connecting
    /// is not covered by the deadline.
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, SupervisorError> {
        let conn = self.ensure_connected().await?;
        conn.request_timeout(method, params, timeout).await
    }

    /// Ask a running backend to exit, then tear down. Never spawns.
    /// Returns whether a backend acknowledged the request.
    pub async fn stop_backend(&self, timeout: Duration) -> Result<bool, SupervisorError> {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let existing = self
            .inner
            .conn
            .lock()
            .await
            .clone()
            .filter(|c| !c.is_closed());
        let conn = match existing {
            Some(conn) => Some(conn),
            None => IpcConnection::connect(&self.inner.opts.addr).await.ok(),
        };
        let acknowledged = match conn {
            Some(conn) => match conn.request_timeout("shutdown", None, timeout).await {
                Ok(_) => true,
                // the backend may close before its reply flushes
                Err(SupervisorError::ConnectionLost) => true,
                Err(err) => return Err(err),
            },
            None => false,
        };
        self.shutdown().await;
        Ok(acknowledged)
    }

    /// Close the channel and kill a spawned backend. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = self.inner.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        let backend = lock(&self.inner.backend).take();
        if let Some(backend) = backend {
            if backend.is_running() {
                backend.kill();
                if tokio::time::timeout(STOP_GRACE, backend.wait()).await.is_err() {
                    warn!(target: "kiln::supervisor", pid = ?backend.pid(), "backend did not exit after kill");
                }
            }
        }
        info!(target: "kiln::supervisor", "supervisor shut down");
    }
}

impl Inner {
    fn check_usable(&self) -> Result<(), SupervisorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShutDown);
        }
        if let Some(exit) = *self.fatal_tx.borrow() {
            return Err(SupervisorError::FatalStartup { exit });
        }
        Ok(())
    }

    async fn start_backend(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let process = Arc::new(self.launcher.launch().await?);
        *lock(&self.backend) = Some(process.clone());

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = process.wait().await;
            if let Some(inner) = weak.upgrade() {
                inner.on_backend_exit(&process, exit);
            }
        });
        Ok(())
    }

    fn on_backend_exit(&self, process: &Arc<BackendProcess>, exit: BackendExit) {
        {
            let mut slot = lock(&self.backend);
            if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, process)) {
                slot.take();
            }
        }
        let expected =
            self.stopping.load(Ordering::SeqCst) || self.shut_down.load(Ordering::SeqCst);
        if exit.is_fatal_startup() && !expected {
            error!(
                target: "kiln::supervisor",
                pid = ?process.pid(),
                "backend exited cleanly on its own; another instance likely owns its resources"
            );
            self.fatal_tx.send_replace(Some(exit));
        } else if exit.killed_by_us || expected {
            debug!(target: "kiln::supervisor", code = ?exit.code, "backend stopped");
        } else {
            warn!(
                target: "kiln::supervisor",
                pid = ?process.pid(),
                code = ?exit.code,
                "backend exited; it will be respawned on the next request"
            );
        }
    }
}
