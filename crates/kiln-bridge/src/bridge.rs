use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use kiln_core::{Backoff, BridgeConfig, TransportPreference};
use kiln_events::{Dispatcher, HandlerId};
use kiln_protocol::{BridgeEnvelope, BridgeMessage};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::ConnectionState;
use crate::transport::{endpoint_for, select_transport, SecurityContext, TransportKind};
use crate::BridgeError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = oneshot::Sender<Result<Value, BridgeError>>;

/// Handler for one inbound query method.
pub type QueryHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub preference: TransportPreference,
    pub security: SecurityContext,
    pub local_url: String,
    pub peer_url: Option<String>,
    pub reconnect: Backoff,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl BridgeOptions {
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self {
            preference: cfg.transport,
            security: SecurityContext::from_flag(cfg.secure),
            local_url: cfg.local_url.clone(),
            peer_url: cfg.peer_url.clone(),
            reconnect: cfg.reconnect(),
            probe_interval: Duration::from_secs(cfg.probe_interval_secs.max(1)),
            probe_timeout: Duration::from_secs(cfg.probe_timeout_secs.max(1)),
        }
    }
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Close frame from the remote.
    Clean,
    /// Socket error, EOF without close frame, or a missed probe.
    Unexpected,
}

struct Session {
    generation: u64,
    kind: TransportKind,
    token: CancellationToken,
    outbound: mpsc::UnboundedSender<Message>,
}

/// Uniform send/receive surface over whichever transport is active.
///
/// Correlated requests go out as `query` envelopes and resolve on the
/// matching `response`; events are fire-and-forget and are also delivered
/// to locally registered handlers of the same kind.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

struct Inner {
    opts: BridgeOptions,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    manual_close: AtomicBool,
    pending: Mutex<HashMap<String, Pending>>,
    probes: Mutex<HashMap<String, oneshot::Sender<()>>>,
    handlers: RwLock<HashMap<String, QueryHandler>>,
    dispatcher: Dispatcher,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Bridge {
    pub fn new(opts: BridgeOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                opts,
                state_tx,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                manual_close: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                probes: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                dispatcher: Dispatcher::new(),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Transport of the live session, if any.
    pub fn transport(&self) -> Option<TransportKind> {
        lock(&self.inner.session).as_ref().map(|s| s.kind)
    }

    /// Establish a transport, retrying with the reconnect policy.
    pub async fn connect(&self) -> Result<TransportKind, BridgeError> {
        let opts = &self.inner.opts;
        let kind = select_transport(opts.preference, opts.security)?;
        let url = endpoint_for(kind, &opts.local_url, opts.peer_url.as_deref())?;
        self.inner.manual_close.store(false, Ordering::SeqCst);
        self.inner.abort_reconnect();
        if let Some(live) = self.transport() {
            return Ok(live);
        }
        self.inner.set_state(ConnectionState::Connecting);

        let policy = opts.reconnect;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.inner.open(&url).await {
                Ok(ws) => {
                    if let Err(mut ws) = self.inner.start_session(ws, kind) {
                        debug!(target: "kiln::bridge", url = %url, "disconnect requested while dialing; closing new transport");
                        let _ = ws.close(None).await;
                        self.inner.set_state(ConnectionState::Disconnected);
                        return Err(BridgeError::NotConnected);
                    }
                    info!(target: "kiln::bridge", transport = kind.as_str(), url = %url, "bridge connected");
                    return Ok(kind);
                }
                Err(err) if policy.allows(attempt + 1) => {
                    let delay = policy.delay_for(attempt - 1);
                    debug!(
                        target: "kiln::bridge",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "bridge connect failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if self.inner.manual_close.load(Ordering::SeqCst) {
                        self.inner.set_state(ConnectionState::Disconnected);
                        return Err(BridgeError::NotConnected);
                    }
                }
                Err(err) => {
                    self.inner.set_state(ConnectionState::Disconnected);
                    return Err(BridgeError::ConnectFailed {
                        url,
                        attempts: attempt,
                        last_error: err,
                    });
                }
            }
        }
    }

    /// Tear down the active transport. No reconnect follows.
    pub fn disconnect(&self) {
        self.inner.manual_close.store(true, Ordering::SeqCst);
        self.inner.abort_reconnect();
        let session = lock(&self.inner.session).take();
        if let Some(session) = session {
            let _ = session.outbound.send(Message::Close(None));
            session.token.cancel();
            info!(target: "kiln::bridge", "bridge disconnected");
        }
        self.inner.fail_pending();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Best-effort post; logs and returns `false` when nothing is connected.
    pub fn send(&self, msg: BridgeMessage) -> bool {
        self.inner.post(msg)
    }

    /// Send a query and wait for the remote's response.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let msg = BridgeMessage::query(method, params);
        let BridgeMessage::Query { id, .. } = &msg else {
            return Err(BridgeError::NotConnected);
        };
        let id = id.clone();
        if !self.state().can_send() {
            return Err(BridgeError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);
        if !self.inner.post(msg) {
            lock(&self.inner.pending).remove(&id);
            return Err(BridgeError::NotConnected);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Disconnected),
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    /// Serve inbound queries for `method`.
    pub fn register_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let boxed: QueryHandler = Arc::new(move |params| handler(params).boxed());
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), boxed);
    }

    pub fn on_event<F>(&self, kind: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(kind, handler)
    }

    pub fn off_event(&self, kind: &str, id: HandlerId) -> bool {
        self.inner.dispatcher.off(kind, id)
    }

    /// Post an event to the remote and run local handlers for the same kind.
    /// Returns whether the remote post went out.
    pub fn emit(&self, kind: &str, data: Value) -> bool {
        let msg = match kind {
            "progress" => BridgeMessage::Progress { data: data.clone() },
            "complete" => BridgeMessage::Complete { data: data.clone() },
            _ => BridgeMessage::Event {
                kind: kind.to_string(),
                data: data.clone(),
            },
        };
        let posted = self.inner.post(msg);
        self.inner.dispatcher.dispatch(kind, &data);
        posted
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            debug!(target: "kiln::bridge", from = %prev, to = %next, "bridge state");
        }
    }

    fn abort_reconnect(&self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
    }

    async fn open(&self, url: &str) -> Result<WsStream, String> {
        match tokio::time::timeout(self.opts.probe_timeout, connect_async(url)).await {
            Ok(Ok((ws, _resp))) => Ok(ws),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {:?}",
                self.opts.probe_timeout
            )),
        }
    }

    fn post(&self, msg: BridgeMessage) -> bool {
        let kind = msg.kind();
        let guard = lock(&self.session);
        let Some(session) = guard.as_ref() else {
            debug!(target: "kiln::bridge", kind = kind.as_str(), "dropping message while disconnected");
            return false;
        };
        let text = match msg.to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "kiln::bridge", error = %err, "failed to encode bridge message");
                return false;
            }
        };
        session.outbound.send(Message::Text(text.into())).is_ok()
    }

    fn fail_pending(&self) {
        let drained: Vec<Pending> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(BridgeError::Disconnected));
        }
        lock(&self.probes).clear();
    }

    /// Install `ws` as the live session. Hands the stream back when a
    /// disconnect arrived while it was being dialed.
    fn start_session(self: &Arc<Self>, ws: WsStream, kind: TransportKind) -> Result<(), WsStream> {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let generation = {
            let mut session = lock(&self.session);
            // disconnect() stores the flag before it takes this lock
            if self.manual_close.load(Ordering::SeqCst) {
                return Err(ws);
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *session = Some(Session {
                generation,
                kind,
                token: token.clone(),
                outbound: tx,
            });
            self.set_state(ConnectionState::Connected);
            generation
        };
        let (mut sink, mut stream) = ws.split();

        let writer_token = token.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = writer_token.cancelled() => None,
                    msg = rx.recv() => msg,
                };
                let Some(msg) = next else {
                    break;
                };
                let closing = matches!(msg, Message::Close(_));
                if let Err(err) = sink.send(msg).await {
                    debug!(target: "kiln::bridge", error = %err, "bridge write failed");
                    writer_token.cancel();
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let probe = self.clone();
        let probe_token = token.clone();
        tokio::spawn(async move {
            probe.probe_loop(probe_token).await;
        });

        let reader = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break CloseReason::Unexpected,
                    msg = stream.next() => msg,
                };
                match next {
                    Some(Ok(Message::Text(text))) => reader.handle_inbound(text.as_str()),
                    Some(Ok(Message::Close(_))) => break CloseReason::Clean,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(target: "kiln::bridge", error = %err, "bridge read failed");
                        break CloseReason::Unexpected;
                    }
                    None => break CloseReason::Unexpected,
                }
            };
            token.cancel();
            reader.end_session(generation, reason);
        });
        Ok(())
    }

    async fn probe_loop(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.opts.probe_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let ping = BridgeMessage::ping();
            let BridgeMessage::Ping { id } = &ping else {
                return;
            };
            let id = id.clone();
            let (tx, rx) = oneshot::channel();
            lock(&self.probes).insert(id.clone(), tx);
            if !self.post(ping) {
                return;
            }
            let answered = tokio::select! {
                _ = token.cancelled() => return,
                res = tokio::time::timeout(self.opts.probe_timeout, rx) => matches!(res, Ok(Ok(()))),
            };
            if !answered {
                lock(&self.probes).remove(&id);
                warn!(target: "kiln::bridge", "liveness probe unanswered; dropping transport");
                token.cancel();
                return;
            }
        }
    }

    fn end_session(self: &Arc<Self>, generation: u64, reason: CloseReason) {
        {
            let mut guard = lock(&self.session);
            // superseded or already torn down by disconnect()
            if guard.as_ref().map(|s| s.generation) != Some(generation) {
                return;
            }
            guard.take();
        }
        self.fail_pending();
        if self.manual_close.load(Ordering::SeqCst) || reason == CloseReason::Clean {
            info!(target: "kiln::bridge", ?reason, "bridge closed");
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        warn!(target: "kiln::bridge", "bridge transport dropped; reconnecting");
        self.set_state(ConnectionState::Reconnecting);
        let inner = self.clone();
        let task = tokio::spawn(async move {
            inner.reconnect_loop().await;
        });
        *lock(&self.reconnect_task) = Some(task);
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let opts = &self.opts;
        let Ok(kind) = select_transport(opts.preference, opts.security) else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };
        let Ok(url) = endpoint_for(kind, &opts.local_url, opts.peer_url.as_deref()) else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };
        let policy = opts.reconnect;
        for attempt in 0..policy.max_attempts {
            let delay = policy.delay_for(attempt);
            debug!(
                target: "kiln::bridge",
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;
            if self.manual_close.load(Ordering::SeqCst) {
                return;
            }
            match self.open(&url).await {
                Ok(ws) => {
                    if let Err(mut ws) = self.start_session(ws, kind) {
                        let _ = ws.close(None).await;
                        return;
                    }
                    info!(target: "kiln::bridge", attempt = attempt + 1, "bridge reconnected");
                    return;
                }
                Err(err) => {
                    debug!(target: "kiln::bridge", error = %err, "reconnect attempt failed")
                }
            }
        }
        warn!(
            target: "kiln::bridge",
            attempts = policy.max_attempts,
            "giving up on bridge reconnect until the next explicit connect"
        );
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_inbound(self: &Arc<Self>, text: &str) {
        let msg = match BridgeEnvelope::parse(text).and_then(BridgeMessage::try_from) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(target: "kiln::bridge", error = %err, "dropping malformed bridge frame");
                return;
            }
        };
        match msg {
            BridgeMessage::Query { id, method, params } => self.serve_query(id, method, params),
            BridgeMessage::Response {
                id,
                ok,
                result,
                error,
            } => {
                let Some(tx) = lock(&self.pending).remove(&id) else {
                    debug!(target: "kiln::bridge", id = %id, "response for unknown request");
                    return;
                };
                let outcome = if ok {
                    Ok(result)
                } else {
                    Err(BridgeError::Remote(
                        error.unwrap_or_else(|| "request failed".into()),
                    ))
                };
                let _ = tx.send(outcome);
            }
            BridgeMessage::Ping { id } => {
                self.post(BridgeMessage::Pong { id });
            }
            BridgeMessage::Pong { id } => {
                if let Some(tx) = lock(&self.probes).remove(&id) {
                    let _ = tx.send(());
                }
            }
            BridgeMessage::Progress { data } => {
                self.dispatcher.dispatch("progress", &data);
            }
            BridgeMessage::Complete { data } => {
                self.dispatcher.dispatch("complete", &data);
            }
            BridgeMessage::Event { kind, data } => {
                self.dispatcher.dispatch(&kind, &data);
            }
        }
    }

    fn serve_query(self: &Arc<Self>, id: String, method: String, params: Value) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&method)
            .cloned();
        let Some(handler) = handler else {
            debug!(target: "kiln::bridge", method = %method, "query for unknown method");
            self.post(BridgeMessage::failure(id, format!("unknown method: {method}")));
            return;
        };
        let inner = self.clone();
        tokio::spawn(async move {
            let reply = match handler(params).await {
                Ok(result) => BridgeMessage::ok(id, result),
                Err(err) => BridgeMessage::failure(id, err),
            };
            inner.post(reply);
        });
    }
}
