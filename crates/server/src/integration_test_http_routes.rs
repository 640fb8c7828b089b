use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::{
    data_model::ProcessId,
    routes::create_routes,
    routes_internal::configure_internal_routes,
    testing::TestService,
};

fn router(test_srv: &TestService) -> Router {
    Router::new()
        .merge(create_routes(test_srv.service.route_state()))
        .merge(configure_internal_routes(test_srv.service.route_state()))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_create_sandbox_accepts_empty_body() -> Result<()> {
    let test_srv = TestService::new()?;
    let app = router(&test_srv);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sandboxes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert!(!body["id"].as_str().unwrap().is_empty());
    assert_eq!(body["status"], "Creating");

    Ok(())
}

#[tokio::test]
async fn test_get_and_list_sandboxes_use_camel_case() -> Result<()> {
    let test_srv = TestService::new()?;
    let app = router(&test_srv);

    let sandbox_id = test_srv.create_provisioned_sandbox().await;

    let response = app
        .clone()
        .oneshot(get(&format!("/api/sandboxes/{sandbox_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], sandbox_id.get());
    assert_eq!(body["status"], "Starting");
    assert_eq!(body["publicIp"], "10.0.0.5");
    assert_eq!(body["configuration"]["image"], "mock-image");

    let response = app.oneshot(get("/api/sandboxes")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let sandboxes = body["sandboxes"].as_array().unwrap();
    assert_eq!(sandboxes.len(), 1);
    assert!(sandboxes[0]["createdAt"].as_u64().unwrap() > 0);

    Ok(())
}

#[tokio::test]
async fn test_unknown_sandbox_and_process_are_404() -> Result<()> {
    let test_srv = TestService::new()?;
    let app = router(&test_srv);

    let response = app
        .clone()
        .oneshot(get("/api/sandboxes/missing"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let sandbox_id = test_srv.create_provisioned_sandbox().await;
    let response = app
        .clone()
        .oneshot(get(&format!(
            "/api/sandboxes/{sandbox_id}/commands/missing/status"
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(delete("/api/sandboxes/missing"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_submit_command_rejects_mismatched_sandbox_id() -> Result<()> {
    let test_srv = TestService::new()?;
    let app = router(&test_srv);
    let sandbox_id = test_srv.create_provisioned_sandbox().await;

    let response = app
        .oneshot(post_json(
            &format!("/api/sandboxes/{sandbox_id}/commands"),
            json!({"sandboxId": "someone-else", "command": "echo hi"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn test_submit_command_without_agent_is_500_with_detail() -> Result<()> {
    let test_srv = TestService::new()?;
    let app = router(&test_srv);
    let sandbox_id = test_srv.create_provisioned_sandbox().await;

    let response = app
        .oneshot(post_json(
            &format!("/api/sandboxes/{sandbox_id}/commands"),
            json!({"sandboxId": sandbox_id.get(), "command": "echo hi"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = body_text(response).await;
    assert!(text.contains("no ready agent"), "got: {text}");

    Ok(())
}

#[tokio::test]
async fn test_full_command_flow_over_rest() -> Result<()> {
    let test_srv = TestService::new()?;
    let app = router(&test_srv);

    let sandbox_id = test_srv.create_provisioned_sandbox().await;
    let mut agent_rx = test_srv.register_agent("a1", &sandbox_id).await;

    // Submit returns immediately with a running process.
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sandboxes/{sandbox_id}/commands"),
            json!({"sandboxId": sandbox_id.get(), "command": "echo hi"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let process_id = body["processId"].as_str().unwrap().to_string();
    assert_eq!(body["command"], "echo hi");
    assert_eq!(body["isRunning"], true);

    // The fake agent answers.
    let request = agent_rx.recv().await.unwrap()?;
    assert_eq!(request.command_id, process_id);
    test_srv
        .service
        .dispatcher
        .complete(
            &ProcessId::from(process_id.as_str()),
            crate::data_model::CommandResult {
                exit_code: 0,
                stdout: "hi\n".to_string(),
                stderr: String::new(),
                duration_ms: 12,
                success: true,
            },
        )
        .await;

    // Status polling converges on the completed result.
    let status_uri = format!("/api/sandboxes/{sandbox_id}/commands/{process_id}/status");
    let body = loop {
        let response = app.clone().oneshot(get(&status_uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        if body["isRunning"] == false {
            break body;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(body["processId"], process_id);
    assert_eq!(body["result"]["exitCode"], 0);
    assert_eq!(body["result"]["standardOutput"], "hi\n");
    assert_eq!(body["result"]["standardError"], "");
    assert_eq!(body["result"]["duration"], "00:00:00.0120000");

    // Bulk logs endpoint works (no lines pushed for this command).
    let response = app
        .clone()
        .oneshot(get(&format!(
            "/api/sandboxes/{sandbox_id}/commands/{process_id}/logs"
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["logLines"], json!([]));

    // Deleting the sandbox makes its command endpoints disappear.
    let response = app
        .clone()
        .oneshot(delete(&format!("/api/sandboxes/{sandbox_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get(&status_uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_terminate_command_over_rest() -> Result<()> {
    let test_srv = TestService::new()?;
    let app = router(&test_srv);

    let sandbox_id = test_srv.create_provisioned_sandbox().await;
    let mut agent_rx = test_srv.register_agent("a1", &sandbox_id).await;

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sandboxes/{sandbox_id}/commands"),
            json!({"sandboxId": sandbox_id.get(), "command": "sleep forever"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let process_id = body["processId"].as_str().unwrap().to_string();
    let _ = agent_rx.recv().await.unwrap()?;

    let response = app
        .clone()
        .oneshot(delete(&format!(
            "/api/sandboxes/{sandbox_id}/commands/{process_id}"
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status_uri = format!("/api/sandboxes/{sandbox_id}/commands/{process_id}/status");
    let body = loop {
        let response = app.clone().oneshot(get(&status_uri)).await.unwrap();
        let body = body_json(response).await;
        if body["isRunning"] == false {
            break body;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(body["result"]["exitCode"], -1);
    assert_eq!(body["result"]["standardError"], "terminated");

    Ok(())
}

#[tokio::test]
async fn test_healthz_and_internal_agents() -> Result<()> {
    let test_srv = TestService::new()?;
    let app = router(&test_srv);

    let response = app.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let sandbox_id = test_srv.create_provisioned_sandbox().await;
    let _agent_rx = test_srv.register_agent("a1", &sandbox_id).await;

    let response = app.oneshot(get("/internal/agents")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let agents = body["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agentId"], "a1");
    assert_eq!(agents[0]["sandboxId"], sandbox_id.get());
    assert_eq!(agents[0]["status"], "Ready");

    Ok(())
}
