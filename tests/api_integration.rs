//! API integration tests.
//!
//! Drive the full router with `tower::ServiceExt::oneshot` against sessions
//! backed by scripted engines.

mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use std::time::Duration;

use common::{Behavior, Harness};
use dump_relay::api::{create_router_with_state, AppState, AuditLog};
use dump_relay::scripts::{ReportRunner, ScriptRegistry};
use serde_json::{json, Value};
use tower::ServiceExt;

/// Helper to create a JSON request.
fn json_request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");

    match body {
        Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Helper to extract body as string.
async fn response_text(response: axum::response::Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8_lossy(&body).to_string()
}

/// Helper to extract JSON from response.
async fn response_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap_or(Value::Null)
}

fn app(h: &Harness) -> Router {
    create_router_with_state(AppState::new(h.manager.clone()))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(json_request(method, uri, body))
        .await
        .unwrap();
    let status = response.status();
    (status, response_json(response).await)
}

/// Open a session for a fresh dump and return its id.
async fn open(app: &Router, h: &Harness, name: &str) -> String {
    let dump = h.dump(name, name.as_bytes());
    let (status, json) = call(
        app,
        Method::POST,
        "/api/v1/sessions",
        Some(json!({ "dump_path": dump.dump_path })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    json["session_id"].as_str().unwrap().to_string()
}

// ============================================================================
// Health & Info Tests
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let h = Harness::new(Behavior::default());
    let response = app(&h)
        .oneshot(json_request(Method::GET, "/health", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_text(response).await, "OK");
}

#[tokio::test]
async fn test_api_info_endpoint() {
    let h = Harness::new(Behavior::default());
    let (status, json) = call(&app(&h), Method::GET, "/api/v1", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["name"], "dump-relay");
    assert_eq!(json["status"], "running");
    assert_eq!(json["sessions"], 0);
    assert_eq!(json["engines"], json!(["crash", "drgn"]));
}

// ============================================================================
// Session Tests
// ============================================================================

#[tokio::test]
async fn test_open_same_dump_twice() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let dump = h.dump("vmcore", b"shared");
    let body = json!({ "dump_path": dump.dump_path, "symbols_path": "/usr/lib/debug/vmlinux" });

    let (first_status, first) = call(&app, Method::POST, "/api/v1/sessions", Some(body.clone())).await;
    let (second_status, second) = call(&app, Method::POST, "/api/v1/sessions", Some(body)).await;

    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first["session_id"], second["session_id"]);
    assert_eq!(second["is_new"], false);
    assert_eq!(second["session"]["ref_count"], 2);
    assert_eq!(second["session"]["state"], "ready");
    assert_eq!(second["session"]["symbols_path"], "/usr/lib/debug/vmlinux");
}

#[tokio::test]
async fn test_list_and_get_session() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;

    let (status, list) = call(&app, Method::GET, "/api/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["count"], 1);
    assert_eq!(list["sessions"][0]["id"], id.as_str());

    let (status, info) = call(&app, Method::GET, &format!("/api/v1/sessions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["engines"], json!(["crash", "drgn"]));
    assert_eq!(info["context"]["pid"], "1");
}

#[tokio::test]
async fn test_release_session() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;
    let uri = format!("/api/v1/sessions/{}", id);

    let (status, json) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["remaining_refs"], 0);
    assert_eq!(json["closed"], true);
    assert_eq!(h.counters().terminations(), 2);

    let (status, json) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn test_unknown_session_id() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);

    let (status, json) = call(&app, Method::GET, "/api/v1/sessions/sess-deadbeef", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "SESSION_NOT_FOUND");

    let (status, _) = call(&app, Method::GET, "/api/v1/sessions/not-an-id", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_open_with_no_engines_fails() {
    let h = Harness::new(Behavior {
        fail_start: [
            dump_relay::EngineKind::Crash,
            dump_relay::EngineKind::Drgn,
        ]
        .into_iter()
        .collect(),
        ..Behavior::default()
    });
    let dump = h.dump("vmcore", b"nothing");
    let (status, json) = call(
        &app(&h),
        Method::POST,
        "/api/v1/sessions",
        Some(json!({ "dump_path": dump.dump_path })),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "ENGINE_START_FAILED");
}

// ============================================================================
// Command Tests
// ============================================================================

#[tokio::test]
async fn test_execute_and_cache() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;
    let uri = format!("/api/v1/sessions/{}/commands", id);

    let (status, first) = call(&app, Method::POST, &uri, Some(json!({ "command": "sys" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["session_id"], id.as_str());
    assert_eq!(first["engine"], "crash");
    assert_eq!(first["cached"], false);

    let (_, second) = call(&app, Method::POST, &uri, Some(json!({ "command": "crash: sys" }))).await;
    assert_eq!(second["cached"], true);
    assert_eq!(second["command_id"], first["command_id"]);

    let (_, forced) = call(
        &app,
        Method::POST,
        &uri,
        Some(json!({ "command": "sys", "force_execute": true })),
    )
    .await;
    assert_eq!(forced["cached"], false);
}

#[tokio::test]
async fn test_execute_with_explicit_engine() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;
    let uri = format!("/api/v1/sessions/{}/commands", id);

    let (status, json) = call(
        &app,
        Method::POST,
        &uri,
        Some(json!({ "command": "x: int = 1", "engine": "drgn" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["engine"], "drgn");
    assert!(json["output"].as_str().unwrap().starts_with("drgn:x: int = 1"));

    let (status, json) = call(
        &app,
        Method::POST,
        &uri,
        Some(json!({ "command": "ps", "engine": "lldb" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn test_execute_default_session() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);

    let (status, json) = call(&app, Method::POST, "/api/v1/commands", Some(json!({ "command": "ps" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "SESSION_NOT_FOUND");

    let id = open(&app, &h, "vmcore").await;
    let (status, json) = call(&app, Method::POST, "/api/v1/commands", Some(json!({ "command": "ps" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["session_id"], id.as_str());
}

#[tokio::test]
async fn test_timeout_maps_to_gateway_timeout() {
    let h = Harness::with_settings(Behavior::default(), common::quick_timeouts());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;
    let uri = format!("/api/v1/sessions/{}/commands", id);

    let (status, json) = call(&app, Method::POST, &uri, Some(json!({ "command": "hang" }))).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json["code"], "TIMEOUT");

    let (status, json) = call(&app, Method::POST, &uri, Some(json!({ "command": "ps" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "SESSION_UNUSABLE");
}

// ============================================================================
// Output Tests
// ============================================================================

#[tokio::test]
async fn test_paginate_and_search_output() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;

    let (_, run) = call(
        &app,
        Method::POST,
        &format!("/api/v1/sessions/{}/commands", id),
        Some(json!({ "command": "lines 1000" })),
    )
    .await;
    assert_eq!(run["truncated"], true);
    assert_eq!(run["total_lines"], 1000);
    let command_id = run["command_id"].as_str().unwrap().to_string();
    let base = format!("/api/v1/sessions/{}/commands/{}", id, command_id);

    let (status, page) = call(&app, Method::GET, &format!("{}/lines?offset=990&limit=50", base), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["returned_lines"], 10);
    assert_eq!(page["has_more"], false);

    let (_, page) = call(&app, Method::GET, &format!("{}/lines", base), None).await;
    assert_eq!(page["offset"], 0);
    assert_eq!(page["returned_lines"], 50);
    assert_eq!(page["has_more"], true);

    let (status, json) = call(&app, Method::GET, &format!("{}/lines?offset=-1", base), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_ARGUMENT");

    let (status, found) = call(&app, Method::GET, &format!("{}/search?pattern=%5Eline%2042%24", base), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["count"], 1);
    assert_eq!(found["matches"][0]["line_number"], 42);
    assert_eq!(found["matches"][0]["context_before"].as_array().unwrap().len(), 3);

    let (status, none) = call(&app, Method::GET, &format!("{}/search?pattern=nosuchtoken", base), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(none["count"], 0);

    let (status, json) = call(&app, Method::GET, &format!("{}/search?pattern=%28", base), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_PATTERN");
}

#[tokio::test]
async fn test_list_commands_and_unknown_command() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;
    let uri = format!("/api/v1/sessions/{}/commands", id);

    call(&app, Method::POST, &uri, Some(json!({ "command": "ps" }))).await;
    call(&app, Method::POST, &uri, Some(json!({ "command": "drgn: prog" }))).await;

    let (status, json) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);
    assert_eq!(json["commands"][0]["command"], "ps");
    assert_eq!(json["commands"][1]["engine"], "drgn");

    let (status, json) = call(&app, Method::GET, &format!("{}/crash:00000000/lines", uri), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "COMMAND_NOT_FOUND");
}

// ============================================================================
// Error Envelope Tests
// ============================================================================

#[tokio::test]
async fn test_malformed_query_gets_error_envelope() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;
    let (_, run) = call(
        &app,
        Method::POST,
        &format!("/api/v1/sessions/{}/commands", id),
        Some(json!({ "command": "lines 100" })),
    )
    .await;
    let base = format!("/api/v1/sessions/{}/commands/{}", id, run["command_id"].as_str().unwrap());

    for query in ["lines?limit=-1", "lines?offset=abc", "search", "search?pattern=x&context_lines=many"] {
        let (status, json) = call(&app, Method::GET, &format!("{}/{}", base, query), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", query);
        assert_eq!(json["code"], "INVALID_ARGUMENT", "{}", query);
        assert!(json["message"].as_str().unwrap().len() > "invalid argument: ".len());
    }
}

#[tokio::test]
async fn test_malformed_body_gets_error_envelope() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/api/v1/sessions/{}/commands", id))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(response).await["code"], "INVALID_ARGUMENT");

    let (status, json) = call(&app, Method::POST, "/api/v1/sessions", Some(json!({ "symbols_path": "/x" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_ARGUMENT");
}

// ============================================================================
// Analysis Script Tests
// ============================================================================

const SHOW_TASK: &str = r#""""
---
description: Show one task
category: analysis
params:
  pid:
    type: int
    desc: Task to show
    required: true
---
"""
print(find_task(prog, pid).comm)
"#;

fn script_app(h: &Harness) -> Router {
    let dir = h.sessions_root().join("scripts");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("show_task.py"), SHOW_TASK).unwrap();
    std::fs::write(dir.join("lock_owner.py"), "\"\"\"Mutex owner.\"\"\"\nprint(1)\n").unwrap();

    let scripts = ScriptRegistry::discover(&[dir]);
    create_router_with_state(AppState::new(h.manager.clone()).with_scripts(scripts))
}

#[tokio::test]
async fn test_list_scripts() {
    let h = Harness::new(Behavior::default());
    let app = script_app(&h);

    let (status, json) = call(&app, Method::GET, "/api/v1/scripts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);
    assert_eq!(json["scripts"][1]["name"], "show_task");
    assert_eq!(json["scripts"][1]["params"]["pid"]["type"], "int");
    assert_eq!(json["scripts"][1]["params"]["pid"]["required"], true);

    let (_, json) = call(&app, Method::GET, "/api/v1/scripts?category=lock", None).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["scripts"][0]["description"], "Mutex owner.");
}

#[tokio::test]
async fn test_run_script_through_drgn() {
    let h = Harness::new(Behavior::default());
    let app = script_app(&h);
    let id = open(&app, &h, "vmcore").await;
    let uri = format!("/api/v1/sessions/{}/scripts/show_task", id);

    let (status, json) = call(&app, Method::POST, &uri, Some(json!({ "params": { "pid": 42 } }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["script"], "show_task");
    assert_eq!(json["engine"], "drgn");
    assert_eq!(json["cached"], false);
    assert!(json["output"].as_str().unwrap().contains("pid = 42"));
    assert!(json["command_id"].as_str().unwrap().starts_with("drgn:"));

    let (_, again) = call(&app, Method::POST, &uri, Some(json!({ "params": { "pid": 42 } }))).await;
    assert_eq!(again["cached"], true);
    assert_eq!(again["command_id"], json["command_id"]);

    let (_, other) = call(&app, Method::POST, &uri, Some(json!({ "params": { "pid": 7 } }))).await;
    assert_eq!(other["cached"], false);
    assert_ne!(other["command_id"], json["command_id"]);
}

#[tokio::test]
async fn test_run_script_errors() {
    let h = Harness::new(Behavior::default());
    let app = script_app(&h);
    let id = open(&app, &h, "vmcore").await;

    let (status, json) = call(
        &app,
        Method::POST,
        &format!("/api/v1/sessions/{}/scripts/show_task", id),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["message"].as_str().unwrap().contains("pid"));

    let (status, json) = call(
        &app,
        Method::POST,
        &format!("/api/v1/sessions/{}/scripts/nope", id),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "SCRIPT_NOT_FOUND");
}

// ============================================================================
// Crash Info Tests
// ============================================================================

const DUMPINFO: &str = r#"#!/bin/sh
echo run >> "$(dirname "$0")/runs.log"
echo "analysing $1"
echo '--- JSON REPORT START ---'
printf '{"vmcore": "%s", "panic": "NULL pointer dereference"}\n' "$1"
echo '--- JSON REPORT END ---'
"#;

#[tokio::test]
async fn test_crash_info_is_stored_and_reused() {
    let h = Harness::new(Behavior::default());
    let tools = h.sessions_root().join("tools");
    std::fs::create_dir_all(&tools).unwrap();
    let script = tools.join("dumpinfo.sh");
    std::fs::write(&script, DUMPINFO).unwrap();
    let runs = || std::fs::read_to_string(tools.join("runs.log")).map(|s| s.lines().count()).unwrap_or(0);

    let report = ReportRunner::new(
        Some(format!("sh {} {{vmcore}}", script.display())),
        Duration::from_secs(30),
    )
    .with_exact_timeout(Duration::from_secs(30));
    let app = create_router_with_state(AppState::new(h.manager.clone()).with_report(report));
    let id = open(&app, &h, "vmcore").await;
    let uri = format!("/api/v1/sessions/{}/info", id);

    let (status, first) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["cached"], false);
    assert_eq!(first["findings"]["panic"], "NULL pointer dereference");
    assert!(first["findings"]["vmcore"].as_str().unwrap().ends_with("vmcore"));
    assert_eq!(first["command_id"].as_str().unwrap().split(':').next(), Some("script"));

    let (_, second) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(second["cached"], true);
    assert_eq!(second["findings"], first["findings"]);
    assert_eq!(runs(), 1);

    let (_, forced) = call(&app, Method::GET, &format!("{}?force=true", uri), None).await;
    assert_eq!(forced["cached"], false);
    assert_eq!(runs(), 2);

    // The raw report pages like any command output.
    let (status, page) = call(
        &app,
        Method::GET,
        &format!("/api/v1/sessions/{}/commands/{}/lines", id, first["command_id"].as_str().unwrap()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total_lines"], 4);
}

#[tokio::test]
async fn test_crash_info_not_configured() {
    let h = Harness::new(Behavior::default());
    let app = app(&h);
    let id = open(&app, &h, "vmcore").await;

    let (status, json) = call(&app, Method::GET, &format!("/api/v1/sessions/{}/info", id), None).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(json["code"], "NOT_CONFIGURED");
}

// ============================================================================
// Audit Log Tests
// ============================================================================

#[tokio::test]
async fn test_audit_log_records_api_calls() {
    let h = Harness::new(Behavior::default());
    let audit = AuditLog::in_dir(&h.sessions_root().join("audit"));
    let app = create_router_with_state(AppState::new(h.manager.clone()).with_audit(audit.clone()));

    let id = open(&app, &h, "vmcore").await;
    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/api/v1/sessions/{}/commands", id),
        Some(json!({ "command": "lines 5000" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    call(&app, Method::GET, "/health", None).await;
    call(&app, Method::GET, "/api/v1/sessions/sess-deadbeef", None).await;

    let text = std::fs::read_to_string(audit.path()).unwrap();
    let entries: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(entries.len(), 3);

    assert_eq!(entries[0]["method"], "POST");
    assert_eq!(entries[0]["path"], "/api/v1/sessions");
    assert_eq!(entries[0]["status"], 201);
    assert!(entries[0]["args"]["dump_path"].as_str().unwrap().ends_with("vmcore"));

    assert_eq!(entries[1]["args"]["command"], "lines 5000");
    assert!(entries[1]["result"].as_str().unwrap().contains("command_id"));

    assert_eq!(entries[2]["status"], 404);
    assert!(entries[2]["error"].as_str().unwrap().contains("SESSION_NOT_FOUND"));
    assert!(entries[2].get("result").is_none());
}
