use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::Backoff;
use kiln_protocol::{IpcRequest, IpcResponse, RpcError};
use kiln_supervisor::{
    BackendLauncher, BackendProcess, ConnectionSupervisor, ProcessLauncher, SupervisorError,
    SupervisorOptions,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

fn quick(max_attempts: u32) -> Backoff {
    Backoff::new(
        Duration::from_millis(20),
        1.6,
        Duration::from_millis(100),
        max_attempts,
    )
}

/// Address that refuses connections until something binds it again.
async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn write_response(write: &mut OwnedWriteHalf, resp: &IpcResponse) {
    let mut line = serde_json::to_vec(resp).unwrap();
    line.push(b'\n');
    write.write_all(&line).await.unwrap();
}

/// Minimal backend: answers `ping`, `list_tools` and `echo`; anything else
/// gets `unknown_method`.
async fn serve_connection(stream: TcpStream) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let req: IpcRequest = serde_json::from_str(&line).unwrap();
        let resp = match req.method.as_str() {
            "ping" => IpcResponse::ok(&req.id, json!({"pong": true})),
            "list_tools" => IpcResponse::ok(&req.id, json!({"tools": ["submit_job", "job_status"]})),
            "echo" => IpcResponse::ok(&req.id, req.params_or_empty()),
            other => IpcResponse::err(&req.id, RpcError::unknown_method(other)),
        };
        write_response(&mut write, &resp).await;
    }
}

async fn serve_forever(listener: TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(serve_connection(stream));
    }
}

/// Launcher that records calls and brings up an in-process backend on the
/// supervisor's address after a delay.
struct DelayedBackend {
    addr: SocketAddr,
    delay: Duration,
    launches: AtomicUsize,
}

#[async_trait]
impl BackendLauncher for DelayedBackend {
    async fn launch(&self) -> Result<BackendProcess, SupervisorError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let addr = self.addr;
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            serve_forever(listener).await;
        });
        let (process, exit_tx) = BackendProcess::detached(None);
        // keep the exit channel open for the life of the test
        std::mem::forget(exit_tx);
        Ok(process)
    }
}

struct NeverLaunch;

#[async_trait]
impl BackendLauncher for NeverLaunch {
    async fn launch(&self) -> Result<BackendProcess, SupervisorError> {
        Err(SupervisorError::BackendNotFound)
    }
}

#[tokio::test]
async fn connects_to_running_backend_without_spawning() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_forever(listener));

    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(addr.to_string(), quick(3)),
        Arc::new(NeverLaunch),
    );
    let pong = sup.send("ping", None).await.unwrap();
    assert_eq!(pong, json!({"pong": true}));

    let err = sup.send("teleport", None).await.unwrap_err();
    match err {
        SupervisorError::Remote(rpc) => assert_eq!(rpc.code, RpcError::UNKNOWN_METHOD),
        other => panic!("unexpected error {other}"),
    }
    sup.shutdown().await;
}

#[tokio::test]
async fn spawns_backend_then_retries_until_it_listens() {
    let addr = free_addr().await;
    let launcher = Arc::new(DelayedBackend {
        addr,
        delay: Duration::from_millis(120),
        launches: AtomicUsize::new(0),
    });
    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(addr.to_string(), quick(20)),
        launcher.clone(),
    );

    let tools = sup.send("list_tools", None).await.unwrap();
    assert_eq!(tools["tools"][0], "submit_job");
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

    // the live connection is reused
    sup.send("ping", None).await.unwrap();
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    sup.shutdown().await;
}

#[tokio::test]
async fn concurrent_first_sends_spawn_once() {
    let addr = free_addr().await;
    let launcher = Arc::new(DelayedBackend {
        addr,
        delay: Duration::from_millis(80),
        launches: AtomicUsize::new(0),
    });
    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(addr.to_string(), quick(20)),
        launcher.clone(),
    );
    let (a, b) = tokio::join!(
        sup.send("echo", Some(json!({"n": 1}))),
        sup.send("echo", Some(json!({"n": 2})))
    );
    assert_eq!(a.unwrap()["n"], 1);
    assert_eq!(b.unwrap()["n"], 2);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    sup.shutdown().await;
}

#[tokio::test]
async fn responses_match_by_id_out_of_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let first: IpcRequest =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second: IpcRequest =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        // stray id first, then both answers in reverse order, the last one
        // split across two writes
        write_response(&mut write, &IpcResponse::ok("no-such-id", json!(0))).await;
        write_response(&mut write, &IpcResponse::ok(&second.id, second.params_or_empty())).await;
        let mut tail = serde_json::to_vec(&IpcResponse::ok(&first.id, first.params_or_empty())).unwrap();
        tail.push(b'\n');
        let (head, rest) = tail.split_at(7);
        write.write_all(head).await.unwrap();
        write.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        write.write_all(rest).await.unwrap();
        let _ = lines.next_line().await;
    });

    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(addr.to_string(), quick(3)),
        Arc::new(NeverLaunch),
    );
    let conn = sup.ensure_connected().await.unwrap();
    let (a, b) = tokio::join!(
        conn.request("echo", Some(json!({"slot": "a"}))),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conn.request("echo", Some(json!({"slot": "b"}))).await
        }
    );
    assert_eq!(a.unwrap()["slot"], "a");
    assert_eq!(b.unwrap()["slot"], "b");
    assert_eq!(conn.pending_len(), 0);
    sup.shutdown().await;
}

#[tokio::test]
async fn lost_connection_fails_pending_then_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // first connection dies mid-request
        let (stream, _) = listener.accept().await.unwrap();
        let (read, _write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let _ = lines.next_line().await;
        drop(lines);
        drop(_write);
        serve_forever(listener).await;
    });

    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(addr.to_string(), quick(3)),
        Arc::new(NeverLaunch),
    );
    let err = sup.send("list_tools", None).await.unwrap_err();
    assert!(matches!(err, SupervisorError::ConnectionLost));

    let tools = sup.send("list_tools", None).await.unwrap();
    assert_eq!(tools["tools"][1], "job_status");
    sup.shutdown().await;
}

#[tokio::test]
async fn timed_out_request_is_forgotten() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let req: IpcRequest =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        write_response(&mut write, &IpcResponse::ok(&req.id, json!("late"))).await;
        while let Ok(Some(line)) = lines.next_line().await {
            let req: IpcRequest = serde_json::from_str(&line).unwrap();
            write_response(&mut write, &IpcResponse::ok(&req.id, json!("prompt"))).await;
        }
    });

    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(addr.to_string(), quick(3)),
        Arc::new(NeverLaunch),
    );
    let err = sup
        .send_with_timeout("job_status", None, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Timeout(_)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let conn = sup.ensure_connected().await.unwrap();
    assert_eq!(conn.pending_len(), 0);
    assert_eq!(sup.send("ping", None).await.unwrap(), json!("prompt"));
    sup.shutdown().await;
}

#[tokio::test]
async fn exhausted_attempts_report_last_cause() {
    let addr = free_addr().await;
    let launcher = Arc::new(DelayedBackend {
        addr,
        delay: Duration::from_secs(60),
        launches: AtomicUsize::new(0),
    });
    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(addr.to_string(), quick(3)),
        launcher,
    );
    match sup.ensure_connected().await {
        Err(SupervisorError::Connect { attempts, source, .. }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("connected to a dead address"),
    }
    assert!(sup.fatal().is_none());
}

#[tokio::test]
async fn shutdown_is_idempotent_and_fails_in_flight_requests() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, _write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(addr.to_string(), quick(3)),
        Arc::new(NeverLaunch),
    );
    let conn = sup.ensure_connected().await.unwrap();
    let waiting = tokio::spawn({
        let conn = conn.clone();
        async move { conn.request("job_status", None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    sup.shutdown().await;
    sup.shutdown().await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(SupervisorError::ConnectionLost)));
    assert!(conn.is_closed());
    assert!(matches!(
        sup.send("ping", None).await,
        Err(SupervisorError::ShutDown)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn clean_backend_exit_is_fatal() {
    let addr = free_addr().await;
    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(
            addr.to_string(),
            Backoff::new(Duration::from_millis(200), 1.6, Duration::from_secs(1), 50),
        ),
        Arc::new(ProcessLauncher::command(
            "sh",
            vec!["-c".into(), "exit 0".into()],
        )),
    );
    let started = std::time::Instant::now();
    match sup.ensure_connected().await {
        Err(SupervisorError::FatalStartup { exit }) => assert_eq!(exit.code, Some(0)),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("connected to a dead address"),
    }
    // gave up well before the retry budget ran out
    assert!(started.elapsed() < Duration::from_secs(10));

    let exit = tokio::time::timeout(Duration::from_secs(1), sup.fatal_exit())
        .await
        .unwrap();
    assert!(exit.is_fatal_startup());
    assert!(matches!(
        sup.send("ping", None).await,
        Err(SupervisorError::FatalStartup { .. })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn failing_backend_exit_is_not_fatal() {
    let addr = free_addr().await;
    let sup = ConnectionSupervisor::new(
        SupervisorOptions::new(addr.to_string(), quick(4)),
        Arc::new(ProcessLauncher::command(
            "sh",
            vec!["-c".into(), "exit 3".into()],
        )),
    );
    assert!(matches!(
        sup.ensure_connected().await,
        Err(SupervisorError::Connect { .. })
    ));
    assert!(sup.fatal().is_none());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), sup.fatal_exit())
            .await
            .is_err()
    );
}
