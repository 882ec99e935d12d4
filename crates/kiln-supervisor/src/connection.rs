use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kiln_protocol::{encode_line, IpcRequest, IpcResponse, LineBuffer};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::SupervisorError;

type Reply = oneshot::Sender<Result<Value, SupervisorError>>;

/// One multiplexed newline-JSON channel to the backend.
///
/// Requests carry fresh correlation ids and may complete in any order. When
/// the socket closes or errors every pending request fails with
/// [`SupervisorError::ConnectionLost`] and the connection reports itself
/// closed; it is never reopened.
#[derive(Clone)]
pub struct IpcConnection {
    inner: Arc<Inner>,
}

struct Inner {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<String, Reply>>,
    closed: AtomicBool,
    token: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IpcConnection {
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(write),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            token: CancellationToken::new(),
        });
        let reader = inner.clone();
        tokio::spawn(async move {
            reader.read_loop(read).await;
        });
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a response.
    pub fn pending_len(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, SupervisorError> {
        self.call(IpcRequest::new(method, params), None).await
    }

    /// Like [`request`](Self::request) but gives up after `timeout`. A
    /// response arriving later is dropped as unmatched.
    pub async fn request_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, SupervisorError> {
        self.call(IpcRequest::new(method, params), Some(timeout)).await
    }

    async fn call(
        &self,
        req: IpcRequest,
        timeout: Option<Duration>,
    ) -> Result<Value, SupervisorError> {
        if self.is_closed() {
            return Err(SupervisorError::ConnectionLost);
        }
        let frame = encode_line(&req)?;
        let id = req.id;
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);

        let written = {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&frame).await
        };
        if let Err(err) = written {
            debug!(target: "kiln::ipc", error = %err, "write to backend failed");
            self.inner.fail_all();
            return Err(SupervisorError::ConnectionLost);
        }
        debug!(target: "kiln::ipc", id = %id, method = %req.method, "request sent");

        let outcome = match timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    lock(&self.inner.pending).remove(&id);
                    return Err(SupervisorError::Timeout(limit));
                }
            },
        };
        outcome.unwrap_or(Err(SupervisorError::ConnectionLost))
    }

    /// Close the socket and fail whatever is still pending.
    pub async fn close(&self) {
        self.inner.token.cancel();
        self.inner.fail_all();
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Inner {
    fn fail_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let drained: Vec<Reply> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        if !drained.is_empty() {
            warn!(
                target: "kiln::ipc",
                pending = drained.len(),
                "backend connection lost with requests in flight"
            );
        }
        for tx in drained {
            let _ = tx.send(Err(SupervisorError::ConnectionLost));
        }
    }

    async fn read_loop(&self, mut read: OwnedReadHalf) {
        let mut frames = LineBuffer::new();
        let mut chunk = vec![0u8; 8192];
        loop {
            let n = tokio::select! {
                _ = self.token.cancelled() => break,
                res = read.read(&mut chunk) => match res {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(target: "kiln::ipc", error = %err, "read from backend failed");
                        break;
                    }
                },
            };
            frames.push(&chunk[..n]);
            while let Some(line) = frames.next_line() {
                match line {
                    Ok(line) => self.deliver(&line),
                    Err(err) => warn!(target: "kiln::ipc", error = %err, "dropping bad frame"),
                }
            }
        }
        self.fail_all();
    }

    fn deliver(&self, line: &str) {
        let resp: IpcResponse = match serde_json::from_str(line) {
            Ok(resp) => resp,
            Err(err) => {
                warn!(target: "kiln::ipc", error = %err, "dropping malformed response");
                return;
            }
        };
        let Some(tx) = lock(&self.pending).remove(&resp.id) else {
            debug!(target: "kiln::ipc", id = %resp.id, "response for unknown request");
            return;
        };
        let _ = tx.send(resp.into_result().map_err(SupervisorError::from));
    }
}
