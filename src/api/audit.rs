//! Per-call audit trail.
//!
//! When enabled, every `/api/v1` request is appended to
//! `<workdir_root>/tool_calls.jsonl` as one JSON object: the call, its
//! arguments, how long it took and what it returned. Large bodies are cut to
//! [`MAX_RECORDED_CHARS`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::types::ErrorResponse;
use crate::error::RelayError;

pub const AUDIT_FILE: &str = "tool_calls.jsonl";
pub const MAX_RECORDED_CHARS: usize = 2000;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// One recorded call.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub args: Value,
    pub status: u16,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only JSONL writer, opened on first use.
#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Arc::new(Mutex::new(None)),
        }
    }

    /// The log for `dir`, at `dir/tool_calls.jsonl`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(AUDIT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            info!(path = %self.path.display(), "Call audit log opened");
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

/// Middleware recording each call to the [`AuditLog`].
pub async fn record_call(State(audit): State<AuditLog>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let err = RelayError::InvalidArgument(format!("unreadable request body: {}", e));
            return (StatusCode::BAD_REQUEST, Json(ErrorResponse::from_error(&err))).into_response();
        }
    };
    let args = request_args(&body);

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;

    let (parts, body) = response.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path, error = %e, "Cannot buffer response for audit");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::internal_error("response body failed")),
            )
                .into_response();
        }
    };

    let text = clip(&String::from_utf8_lossy(&body));
    let failed = parts.status.is_client_error() || parts.status.is_server_error();
    let entry = AuditEntry {
        timestamp_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        method,
        path,
        query,
        args,
        status: parts.status.as_u16(),
        duration_ms: (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
        result: (!failed).then(|| text.clone()),
        error: failed.then_some(text),
    };
    if let Err(e) = audit.append(&entry).await {
        warn!(path = %audit.path().display(), error = %e, "Failed to record call");
    }

    Response::from_parts(parts, Body::from(body))
}

fn request_args(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(clip(&String::from_utf8_lossy(body))))
}

fn clip(text: &str) -> String {
    let total = text.chars().count();
    if total <= MAX_RECORDED_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(MAX_RECORDED_CHARS).collect();
    format!("{}... (truncated, total {} chars)", head, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip() {
        assert_eq!(clip("short"), "short");
        let long = "y".repeat(MAX_RECORDED_CHARS + 5);
        let clipped = clip(&long);
        assert!(clipped.starts_with(&"y".repeat(MAX_RECORDED_CHARS)));
        assert!(clipped.ends_with(&format!("total {} chars)", MAX_RECORDED_CHARS + 5)));
    }

    #[test]
    fn test_request_args() {
        assert_eq!(request_args(b""), Value::Null);
        assert_eq!(request_args(br#"{"command":"ps"}"#)["command"], "ps");
        assert_eq!(request_args(b"not json"), Value::String("not json".into()));
    }

    #[tokio::test]
    async fn test_append_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::in_dir(&dir.path().join("nested"));
        let entry = AuditEntry {
            timestamp_ms: 1,
            method: "GET".into(),
            path: "/api/v1/sessions".into(),
            query: None,
            args: Value::Null,
            status: 200,
            duration_ms: 0.5,
            result: Some("{}".into()),
            error: None,
        };
        log.append(&entry).await.unwrap();
        log.append(&entry).await.unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["path"], "/api/v1/sessions");
        assert!(parsed.get("error").is_none());
    }
}
