//! End-to-end tests of the HTTP surface over the in-memory store.

use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use hopper_api::{AppState, routes};
use hopper_config::{Access, ActionsConfig, ApiToken};
use hopper_core::RunnerScope;
use serde_json::{Value, json};
use tower::ServiceExt;

const ADMIN: &str = "admin-token";
const VIEWER: &str = "viewer-token";

fn app() -> Router {
    let actions = ActionsConfig {
        long_poll_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(50),
        ..ActionsConfig::default()
    };
    let tokens = vec![
        ApiToken {
            token: ADMIN.to_string(),
            scope: RunnerScope::Global,
            access: Access::Write,
        },
        ApiToken {
            token: VIEWER.to_string(),
            scope: RunnerScope::Owner(1),
            access: Access::Read,
        },
    ];
    routes::router(AppState::in_memory(&actions, tokens))
}

enum Auth<'a> {
    None,
    Bearer(&'a str),
    Runner(&'a Runner),
}

struct Runner {
    id: String,
    token: String,
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    auth: Auth<'_>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    match auth {
        Auth::None => {}
        Auth::Bearer(token) => {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        Auth::Runner(runner) => {
            builder = builder
                .header("x-runner-uuid", runner.id.as_str())
                .header("x-runner-token", runner.token.as_str());
        }
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register_runner(app: &Router, labels: &[&str]) -> Runner {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/v1/global/registration-token",
        Auth::Bearer(ADMIN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let registration = body["token"].as_str().unwrap().to_string();

    let (status, body) = call(
        app,
        Method::POST,
        "/api/actions/runner.v1/register",
        Auth::None,
        Some(json!({ "name": "runner-1", "token": registration, "labels": labels })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    Runner {
        id: body["runner"]["id"].as_str().unwrap().to_string(),
        token: body["token"].as_str().unwrap().to_string(),
    }
}

fn run_body(fork: bool, jobs: Value) -> Value {
    json!({
        "owner_id": 1,
        "event": if fork { "pull_request" } else { "push" },
        "commit_sha": "0123abcd",
        "git_ref": "refs/heads/main",
        "workflow_id": "ci.yml",
        "trigger_user_id": 5,
        "is_fork_pull_request": fork,
        "contributor_can_write": !fork,
        "jobs": jobs,
    })
}

async fn enqueue(app: &Router, fork: bool, jobs: Value) -> Value {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/v1/repos/10/runs",
        Auth::Bearer(ADMIN),
        Some(run_body(fork, jobs)),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body
}

fn job_statuses(body: &Value) -> Vec<String> {
    body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["status"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/health", Auth::None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&app, Method::GET, "/health/ready", Auth::None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_admin_auth() {
    let app = app();

    let (status, _) = call(&app, Method::GET, "/api/v1/global/runners", Auth::None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &app,
        Method::GET,
        "/api/v1/global/runners",
        Auth::Bearer("bogus"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The viewer token is scoped to owner 1.
    let (status, _) = call(
        &app,
        Method::GET,
        "/api/v1/global/runners",
        Auth::Bearer(VIEWER),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(
        &app,
        Method::GET,
        "/api/v1/owners/1/runners",
        Auth::Bearer(VIEWER),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/owners/1/registration-token",
        Auth::Bearer(VIEWER),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_runner_auth() {
    let app = app();

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/register",
        Auth::None,
        Some(json!({ "name": "r", "token": "not-issued" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/fetch-task",
        Auth::None,
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let runner = register_runner(&app, &["linux"]).await;
    let forged = Runner {
        id: runner.id.clone(),
        token: "wrong".to_string(),
    };
    let (status, _) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/fetch-task",
        Auth::Runner(&forged),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_fetch_report_and_log_flow() {
    let app = app();
    let runner = register_runner(&app, &["linux"]).await;
    let created = enqueue(
        &app,
        false,
        json!([
            { "name": "build", "runs_on": ["linux"] },
            { "name": "test", "runs_on": ["linux"] },
        ]),
    )
    .await;
    let run_id = created["run"]["id"].as_str().unwrap().to_string();
    assert_eq!(job_statuses(&created), vec!["waiting", "waiting"]);

    let (status, pending) = call(
        &app,
        Method::GET,
        "/api/v1/repos/10/jobs?labels=linux",
        Auth::Bearer(ADMIN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = pending
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["test", "build"]);

    let (status, fetched) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/fetch-task",
        Auth::Runner(&runner),
        Some(json!({ "tasks_version": 0, "capacity": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["task"]["job"]["name"], "test");
    assert_eq!(fetched["additional_tasks"].as_array().unwrap().len(), 1);
    assert!(fetched["tasks_version"].as_i64().unwrap() > 0);
    let task_id = fetched["task"]["task"]["id"].as_str().unwrap().to_string();

    let rows = json!([
        { "timestamp": "2026-01-01T00:00:00Z", "content": "line 1" },
        { "timestamp": "2026-01-01T00:00:01Z", "content": "line 2" },
    ]);
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/update-log",
        Auth::Runner(&runner),
        Some(json!({ "task_id": task_id, "index": 0, "rows": rows })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ack_index"], 2);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/update-log",
        Auth::Runner(&runner),
        Some(json!({
            "task_id": task_id,
            "index": 5,
            "rows": [{ "timestamp": "2026-01-01T00:00:05Z", "content": "gap" }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["expected_index"], 2);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/update-task",
        Auth::Runner(&runner),
        Some(json!({
            "task_id": task_id,
            "state": { "result": "success" },
            "outputs": { "artifact": "build.tar" },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["result"], "success");
    assert_eq!(body["sent_outputs"], json!(["artifact"]));

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/api/v1/tasks/{}/logs", task_id),
        Auth::Bearer(VIEWER),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["log_length"], 2);
    assert_eq!(body["rows"][1]["content"], "line 2");

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/api/v1/runs/{}", run_id),
        Auth::Bearer(VIEWER),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let statuses = job_statuses(&body);
    assert!(statuses.contains(&"success".to_string()));
    assert!(statuses.contains(&"running".to_string()));
}

#[tokio::test]
async fn test_fetch_times_out_with_known_version() {
    let app = app();
    let runner = register_runner(&app, &["linux"]).await;
    enqueue(&app, false, json!([{ "name": "build", "runs_on": ["linux"] }])).await;

    let (_, first) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/fetch-task",
        Auth::Runner(&runner),
        Some(json!({ "tasks_version": 0 })),
    )
    .await;
    let version = first["tasks_version"].as_i64().unwrap();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/fetch-task",
        Auth::Runner(&runner),
        Some(json!({ "tasks_version": version })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["task"].is_null());
    assert_eq!(body["tasks_version"], version);
}

#[tokio::test]
async fn test_fork_run_waits_for_approval() {
    let app = app();
    let created = enqueue(&app, true, json!([{ "name": "build", "runs_on": ["linux"] }])).await;
    let run_id = created["run"]["id"].as_str().unwrap().to_string();
    assert_eq!(job_statuses(&created), vec!["blocked"]);

    let (_, pending) = call(
        &app,
        Method::GET,
        "/api/v1/repos/10/jobs",
        Auth::Bearer(ADMIN),
        None,
    )
    .await;
    assert_eq!(pending, json!([]));

    let trust_uri = format!("/api/v1/runs/{}/trust", run_id);
    let (status, _) = call(
        &app,
        Method::POST,
        &trust_uri,
        Auth::Bearer(VIEWER),
        Some(json!({ "doer_id": 99, "decision": "once" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(
        &app,
        Method::POST,
        &trust_uri,
        Auth::Bearer(ADMIN),
        Some(json!({ "doer_id": 99, "decision": "once" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job_statuses(&body), vec!["waiting"]);
    assert_eq!(body["run"]["approved_by"], 99);

    let (status, _) = call(
        &app,
        Method::POST,
        &trust_uri,
        Auth::Bearer(ADMIN),
        Some(json!({ "doer_id": 99, "decision": "deny" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cancel_run() {
    let app = app();
    let created = enqueue(
        &app,
        false,
        json!([{ "name": "a" }, { "name": "b" }]),
    )
    .await;
    let run_id = created["run"]["id"].as_str().unwrap().to_string();

    let cancel_uri = format!("/api/v1/runs/{}/cancel", run_id);
    let (status, _) = call(&app, Method::POST, &cancel_uri, Auth::Bearer(VIEWER), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, Method::POST, &cancel_uri, Auth::Bearer(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job_statuses(&body), vec!["cancelled", "cancelled"]);
    assert_eq!(body["run"]["status"], "cancelled");
}

#[tokio::test]
async fn test_runner_management() {
    let app = app();
    let runner = register_runner(&app, &["linux"]).await;

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/api/v1/global/runners/{}", runner.id),
        Auth::Bearer(ADMIN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "runner-1");
    assert_eq!(body["status"], "offline");
    assert!(body.get("token_hash").is_none());

    let (status, _) = call(
        &app,
        Method::DELETE,
        &format!("/api/v1/global/runners/{}", runner.id),
        Auth::Bearer(ADMIN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/actions/runner.v1/fetch-task",
        Auth::Runner(&runner),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
