//! API request and response types.

use std::path::PathBuf;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RelayError;
use crate::scripts::{CrashReport, ScriptInfo};
use crate::session::{ArtifactLocator, CommandOutcome, RemoteTarget, SessionId, SessionInfo};
use crate::store::{SearchMatch, StoredResult};

/// Request to open (or join) a session against a dump.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenSessionRequest {
    /// Path to the dump, on the remote host if `remote_host` is set.
    pub dump_path: PathBuf,
    /// Matching vmlinux with debug info.
    #[serde(default)]
    pub symbols_path: Option<PathBuf>,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_user: Option<String>,
    /// Extra crash arguments for a newly started session.
    #[serde(default)]
    pub crash_args: Vec<String>,
}

impl OpenSessionRequest {
    pub fn locator(&self) -> ArtifactLocator {
        let mut locator = match &self.remote_host {
            Some(host) => {
                let mut target = RemoteTarget::new(host.clone());
                if let Some(user) = &self.remote_user {
                    target = target.with_user(user.clone());
                }
                ArtifactLocator::remote(self.dump_path.clone(), target)
            }
            None => ArtifactLocator::local(self.dump_path.clone()),
        };
        if let Some(symbols) = &self.symbols_path {
            locator = locator.with_symbols(symbols.clone());
        }
        locator
    }
}

/// Response for opening a session.
#[derive(Debug, Clone, Serialize)]
pub struct OpenSessionResponse {
    pub session_id: SessionId,
    /// False when an existing session for the same dump was joined.
    pub is_new: bool,
    pub session: SessionInfo,
}

/// Response for listing sessions.
#[derive(Debug, Clone, Serialize)]
pub struct ListSessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionInfo>,
}

/// Response for releasing a session reference.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseSessionResponse {
    pub session_id: SessionId,
    pub remaining_refs: usize,
    /// True when this was the last reference and the engines were stopped.
    pub closed: bool,
}

/// Request to run a command.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteCommandRequest {
    /// Command text, optionally prefixed with `crash:`, `drgn:` or `pykdump:`.
    pub command: String,
    /// Explicit engine (`crash`, `drgn`, `pykdump`); overrides any prefix.
    #[serde(default)]
    pub engine: Option<String>,
    /// Run even if a cached result exists.
    #[serde(default)]
    pub force_execute: bool,
}

/// Response for command execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteCommandResponse {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub result: CommandOutcome,
}

/// Stored results of one session.
#[derive(Debug, Clone, Serialize)]
pub struct ListCommandsResponse {
    pub session_id: SessionId,
    pub count: usize,
    pub commands: Vec<StoredResult>,
}

/// Query for a line window.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinesQuery {
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Query for a regex search.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub pattern: String,
    #[serde(default)]
    pub context_lines: Option<usize>,
}

/// Response for a search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub command_id: String,
    pub pattern: String,
    pub count: usize,
    pub matches: Vec<SearchMatch>,
}

/// Query for the script listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptsQuery {
    #[serde(default)]
    pub category: Option<String>,
}

/// Response for the script listing.
#[derive(Debug, Clone, Serialize)]
pub struct ListScriptsResponse {
    pub count: usize,
    pub scripts: Vec<ScriptInfo>,
}

/// Request to run an analysis script.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunScriptRequest {
    /// Values assigned to the script's parameters before it runs.
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub force_execute: bool,
}

/// Response for a script run.
#[derive(Debug, Clone, Serialize)]
pub struct RunScriptResponse {
    pub session_id: SessionId,
    pub script: String,
    #[serde(flatten)]
    pub result: CommandOutcome,
}

/// Query for the crash info report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrashInfoQuery {
    /// Rerun the report command even if a stored report exists.
    #[serde(default)]
    pub force: bool,
}

/// Response for the crash info report.
#[derive(Debug, Clone, Serialize)]
pub struct CrashInfoResponse {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub report: CrashReport,
}

/// Generic API error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error code (e.g., "SESSION_NOT_FOUND").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn from_error(err: &RelayError) -> Self {
        Self::new(err.code(), err.to_string())
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }
}

/// HTTP status for each error family.
pub fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::SessionNotFound(_)
        | RelayError::NoActiveSession
        | RelayError::CommandNotFound(_)
        | RelayError::ScriptNotFound(_) => StatusCode::NOT_FOUND,
        RelayError::SessionStarting(_)
        | RelayError::SessionUnusable(_)
        | RelayError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        RelayError::InvalidArgument(_) | RelayError::InvalidPattern(_) => StatusCode::BAD_REQUEST,
        RelayError::EngineUnavailable(_) | RelayError::EngineStart(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RelayError::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
        RelayError::Storage(_) | RelayError::LockPoisoned => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_open_request_local() {
        let req: OpenSessionRequest = serde_json::from_str(
            r#"{"dump_path": "/var/crash/vmcore", "symbols_path": "/usr/lib/debug/vmlinux"}"#,
        )
        .unwrap();
        let locator = req.locator();
        assert!(!locator.is_remote());
        assert_eq!(locator.symbols_path, Some(PathBuf::from("/usr/lib/debug/vmlinux")));
    }

    #[test]
    fn test_open_request_remote() {
        let req: OpenSessionRequest = serde_json::from_str(
            r#"{"dump_path": "/var/crash/vmcore", "remote_host": "kbox", "remote_user": "root"}"#,
        )
        .unwrap();
        let locator = req.locator();
        assert_eq!(locator.remote.unwrap().destination(), "root@kbox");
    }

    #[test]
    fn test_execute_request_defaults() {
        let req: ExecuteCommandRequest = serde_json::from_str(r#"{"command": "bt -a"}"#).unwrap();
        assert!(req.engine.is_none());
        assert!(!req.force_execute);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&RelayError::CommandNotFound("crash:0".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&RelayError::InvalidPattern("(".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&RelayError::EngineUnavailable("dead".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&RelayError::Timeout(Duration::from_secs(1))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&RelayError::SessionUnusable("sess-1".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&RelayError::ScriptNotFound("nope".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&RelayError::NotConfigured("crash info command".into())),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_error_response_serialization() {
        let resp = ErrorResponse::from_error(&RelayError::NoActiveSession);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["code"], "SESSION_NOT_FOUND");
        assert!(json["message"].as_str().unwrap().contains("no session"));
    }
}
