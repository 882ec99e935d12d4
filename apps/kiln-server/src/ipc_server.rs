use std::time::Duration;

use kiln_protocol::{encode_line, IpcRequest, IpcResponse, LineBuffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::handlers;

/// Accept front-end connections until the shutdown token fires.
pub async fn serve(listener: TcpListener, state: AppState) {
    if let Ok(addr) = listener.local_addr() {
        info!(target: "kiln::server", %addr, "ipc listening");
    }
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(target: "kiln::server", %peer, "front-end connected");
                    tokio::spawn(handle_connection(stream, state.clone()));
                }
                Err(err) => {
                    warn!(target: "kiln::server", error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!(target: "kiln::server", "ipc listener closed");
}

/// Requests on one connection run concurrently; replies go out in
/// completion order through a single writer.
async fn handle_connection(stream: TcpStream, state: AppState) {
    let _ = stream.set_nodelay(true);
    let (mut read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<IpcResponse>();
    let writer = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            let frame = match encode_line(&resp) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(target: "kiln::server", error = %err, "failed to encode response");
                    continue;
                }
            };
            if let Err(err) = write.write_all(&frame).await {
                debug!(target: "kiln::server", error = %err, "front-end went away");
                break;
            }
        }
    });

    let mut frames = LineBuffer::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        let n = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            res = read.read(&mut chunk) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    debug!(target: "kiln::server", error = %err, "read failed");
                    break;
                }
            },
        };
        frames.push(&chunk[..n]);
        while let Some(line) = frames.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(target: "kiln::server", error = %err, "dropping bad frame");
                    continue;
                }
            };
            let req: IpcRequest = match serde_json::from_str(&line) {
                Ok(req) => req,
                Err(err) => {
                    warn!(target: "kiln::server", error = %err, "dropping malformed request");
                    continue;
                }
            };
            let tx = tx.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let resp = handlers::dispatch(&state, req).await;
                let _ = tx.send(resp);
            });
        }
    }
    drop(tx);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Config;
    use kiln_supervisor::IpcConnection;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn start() -> (AppState, std::net::SocketAddr, tokio::task::JoinHandle<()>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.service.base_url = "http://127.0.0.1:9".into();
        config.service.probe_timeout_ms = 300;
        config.backend.state_dir = Some(dir.path().display().to_string());
        let state = AppState::build(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, state.clone()));
        (state, addr, server, dir)
    }

    #[tokio::test]
    async fn multiplexed_requests_are_answered() {
        let (state, addr, _server, _dir) = start().await;
        let conn = IpcConnection::connect(&addr.to_string()).await.unwrap();
        let (ping, tools, bad) = tokio::join!(
            conn.request("ping", None),
            conn.request("list_tools", None),
            conn.request("cancel_job", Some(json!({"id": "missing"}))),
        );
        assert_eq!(ping.unwrap()["pong"], true);
        assert!(tools.unwrap()["tools"].as_array().unwrap().len() >= 9);
        match bad.unwrap_err() {
            kiln_supervisor::SupervisorError::Remote(err) => {
                assert_eq!(err.code, handlers::CODE_NOT_FOUND)
            }
            other => panic!("unexpected error {other}"),
        }
        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_without_closing() {
        let (state, addr, _server, _dir) = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"this is not json\n\n").await.unwrap();
        write
            .write_all(b"{\"id\":\"r-1\",\"method\":\"ping\"}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(read).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let resp: IpcResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(resp.id, "r-1");
        assert_eq!(resp.into_result().unwrap()["pong"], true);
        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_request_stops_the_listener() {
        let (_state, addr, server, _dir) = start().await;
        let conn = IpcConnection::connect(&addr.to_string()).await.unwrap();
        let ack = conn.request("shutdown", None).await.unwrap();
        assert_eq!(ack["ok"], true);
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
    }
}
