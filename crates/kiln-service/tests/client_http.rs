use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use kiln_core::orchestrator::{
    ArtifactRef, ExternalStatus, GenerationService, JobSpec, ProgressRegistry,
};
use kiln_core::ServiceConfig;
use kiln_service::{LaunchOutcome, ServiceClient, ServiceError, ServiceLauncher};
use serde_json::json;

fn client_for(base_url: String) -> ServiceClient {
    let cfg = ServiceConfig {
        base_url,
        request_timeout_ms: 2_000,
        probe_timeout_ms: 500,
        ..ServiceConfig::default()
    };
    ServiceClient::new(&cfg, Arc::new(ProgressRegistry::new()), "kiln-test").unwrap()
}

fn empty_queue() -> serde_json::Value {
    json!({"queue_running": [], "queue_pending": []})
}

#[tokio::test]
async fn submit_posts_workflow_with_client_id() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/prompt")
                .body_contains("\"client_id\":\"kiln-test\"")
                .body_contains("harbor district");
            then.status(200)
                .json_body(json!({"prompt_id": "p-1", "number": 4, "node_errors": {}}));
        })
        .await;

    let client = client_for(server.base_url());
    let params = JobSpec::from_value(json!({"prompt": "harbor district", "size": "medium"}))
        .unwrap()
        .validate(20)
        .unwrap();
    let id = client.submit(&params, "kiln-test").await.unwrap();
    assert_eq!(id, "p-1");
    mock.assert_async().await;
}

#[tokio::test]
async fn rejected_submit_keeps_status_and_body() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/prompt");
            then.status(400)
                .json_body(json!({"error": {"type": "prompt_outputs_failed_validation"}}));
        })
        .await;
    let client = client_for(server.base_url());
    let err = client.submit_workflow(json!({})).await.unwrap_err();
    match err {
        ServiceError::Rejected { status, body, .. } => {
            assert_eq!(status, 400);
            assert!(body.contains("prompt_outputs_failed_validation"));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn poll_consults_queue_then_history() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/queue");
            then.status(200).json_body(json!({
                "queue_running": [[1, "p-run", {}, {}, ["9"]]],
                "queue_pending": [[2, "p-wait", {}, {}, ["9"]]]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/history/p-done");
            then.status(200).json_body(json!({
                "p-done": {
                    "prompt": [],
                    "outputs": {"9": {"images": [{"filename": "kiln_00001_.png", "subfolder": "", "type": "output"}]}},
                    "status": {"status_str": "success", "completed": true, "messages": []}
                }
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/history/p-lost");
            then.status(200).json_body(json!({}));
        })
        .await;

    let client = client_for(server.base_url());
    assert_eq!(
        client.poll("p-run").await.unwrap(),
        ExternalStatus::Running { step: None }
    );
    assert_eq!(client.poll("p-wait").await.unwrap(), ExternalStatus::Queued);
    assert_eq!(client.poll("p-done").await.unwrap(), ExternalStatus::Complete);
    assert_eq!(client.poll("p-lost").await.unwrap(), ExternalStatus::Unknown);

    let artifacts = client.fetch_artifacts("p-done").await.unwrap();
    assert_eq!(
        artifacts,
        vec![ArtifactRef {
            filename: "kiln_00001_.png".into(),
            subfolder: String::new(),
            kind: "output".into(),
        }]
    );
    assert!(client.fetch_artifacts("p-lost").await.unwrap().is_empty());
}

#[tokio::test]
async fn download_requests_view_with_artifact_coordinates() {
    let server = MockServer::start_async().await;
    let view = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/view")
                .query_param("filename", "kiln_00001_.png")
                .query_param("subfolder", "night")
                .query_param("type", "output");
            then.status(200).body("PNGDATA");
        })
        .await;
    let client = client_for(server.base_url());
    let bytes = client
        .download_artifact(&ArtifactRef {
            filename: "kiln_00001_.png".into(),
            subfolder: "night".into(),
            kind: "output".into(),
        })
        .await
        .unwrap();
    assert_eq!(bytes, b"PNGDATA");
    view.assert_async().await;
}

#[tokio::test]
async fn interrupt_deletes_pending_and_interrupts_running() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/queue");
            then.status(200).json_body(json!({
                "queue_running": [[1, "p-run"]],
                "queue_pending": [[2, "p-wait"]]
            }));
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/queue")
                .body_contains("\"delete\":[\"p-wait\"]");
            then.status(200);
        })
        .await;
    let interrupt = server
        .mock_async(|when, then| {
            when.method(POST).path("/interrupt");
            then.status(200);
        })
        .await;

    let client = client_for(server.base_url());
    assert!(client.interrupt("p-wait").await.unwrap());
    assert!(client.interrupt("p-run").await.unwrap());
    assert!(!client.interrupt("p-gone").await.unwrap());
    delete.assert_async().await;
    interrupt.assert_async().await;
}

#[tokio::test]
async fn health_reflects_system_stats() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/system_stats");
            then.status(200)
                .json_body(json!({"system": {"os": "posix"}, "devices": []}));
        })
        .await;
    assert!(client_for(server.base_url()).health().await);

    let down = MockServer::start_async().await;
    down.mock_async(|when, then| {
        when.method(GET).path("/system_stats");
        then.status(503);
    })
    .await;
    assert!(!client_for(down.base_url()).health().await);
}

#[tokio::test]
async fn launcher_reports_already_running_service() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/system_stats");
            then.status(200).json_body(json!({}));
        })
        .await;
    let launcher = ServiceLauncher::new(client_for(server.base_url()));
    assert_eq!(
        launcher.ensure_running().await.unwrap(),
        LaunchOutcome::AlreadyRunning
    );
}

#[tokio::test]
async fn launcher_without_command_reports_not_running() {
    let server = MockServer::start_async().await;
    let launcher = ServiceLauncher::new(client_for(server.base_url()));
    assert!(matches!(
        launcher.ensure_running().await,
        Err(ServiceError::NotRunning)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn launcher_distinguishes_crash_from_slow_start() {
    let server = MockServer::start_async().await;

    let crashing = ServiceLauncher::new(client_for(server.base_url()))
        .with_command(vec!["sh".into(), "-c".into(), "exit 3".into()])
        .with_poll_interval(Duration::from_millis(20))
        .with_startup_timeout(Duration::from_secs(5));
    assert!(matches!(
        crashing.ensure_running().await,
        Err(ServiceError::ExitedDuringStartup { .. })
    ));

    let slow = ServiceLauncher::new(client_for(server.base_url()))
        .with_command(vec!["sleep".into(), "5".into()])
        .with_poll_interval(Duration::from_millis(20))
        .with_startup_timeout(Duration::from_millis(200));
    assert!(matches!(
        slow.ensure_running().await,
        Err(ServiceError::StartupTimeout(_))
    ));
}
