//! REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use tracing::debug;

use super::audit::AuditLog;
use super::types::{
    status_for, CrashInfoQuery, CrashInfoResponse, ErrorResponse, ExecuteCommandRequest,
    ExecuteCommandResponse, LinesQuery, ListCommandsResponse, ListScriptsResponse,
    ListSessionsResponse, OpenSessionRequest, OpenSessionResponse, ReleaseSessionResponse,
    RunScriptRequest, RunScriptResponse, ScriptsQuery, SearchQuery, SearchResponse,
};
use crate::engine::Route;
use crate::error::RelayError;
use crate::scripts::{ReportRunner, ScriptRegistry};
use crate::session::{SessionId, SessionManager, SessionOptions, UnifiedSession};
use crate::store::Page;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(err: RelayError) -> ApiError {
    debug!(code = err.code(), error = %err, "Request failed");
    (status_for(&err), Json(ErrorResponse::from_error(&err)))
}

/// Malformed query strings get the same envelope as every other failure.
fn query<T>(extracted: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    extracted
        .map(|Query(q)| q)
        .map_err(|rejection| api_error(RelayError::InvalidArgument(rejection.body_text())))
}

/// Malformed JSON bodies likewise.
fn body<T>(extracted: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    extracted
        .map(|Json(b)| b)
        .map_err(|rejection| api_error(RelayError::InvalidArgument(rejection.body_text())))
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// Context lines around search hits when the request does not say.
    pub search_context: usize,
    pub scripts: Arc<ScriptRegistry>,
    pub report: Arc<ReportRunner>,
    /// Records every `/api/v1` call when set.
    pub audit: Option<AuditLog>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            search_context: 3,
            scripts: Arc::new(ScriptRegistry::empty()),
            report: Arc::new(ReportRunner::disabled()),
            audit: None,
        }
    }

    pub fn with_search_context(mut self, lines: usize) -> Self {
        self.search_context = lines;
        self
    }

    pub fn with_scripts(mut self, scripts: ScriptRegistry) -> Self {
        self.scripts = Arc::new(scripts);
        self
    }

    pub fn with_report(mut self, report: ReportRunner) -> Self {
        self.report = Arc::new(report);
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    fn session(&self, id: &str) -> Result<Arc<UnifiedSession>, ApiError> {
        let id: SessionId = id.parse().map_err(api_error)?;
        self.manager.resolve(Some(id)).map_err(api_error)
    }
}

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}

/// API information endpoint.
pub async fn api_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "dump-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "sessions": state.manager.len(),
        "engines": state.manager.config().enabled_engines,
    }))
}

/// List ready sessions.
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<ListSessionsResponse> {
    let sessions = state.manager.list().map_err(api_error)?;
    Ok(Json(ListSessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}

/// Open a session, or join the one already open for this dump.
pub async fn open_session(
    State(state): State<AppState>,
    req: Result<Json<OpenSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OpenSessionResponse>), ApiError> {
    let req = body(req)?;
    let options = SessionOptions {
        crash_args: req.crash_args.clone(),
    };
    let acquired = state
        .manager
        .acquire(req.locator(), options)
        .await
        .map_err(api_error)?;

    let status = if acquired.is_new {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(OpenSessionResponse {
            session_id: acquired.id,
            is_new: acquired.is_new,
            session: acquired.info,
        }),
    ))
}

/// Get session status.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<crate::session::SessionInfo> {
    let id: SessionId = session_id.parse().map_err(api_error)?;
    state.manager.info(id).map(Json).map_err(api_error)
}

/// Release one reference to a session.
pub async fn release_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<ReleaseSessionResponse> {
    let id: SessionId = session_id.parse().map_err(api_error)?;
    let remaining_refs = state.manager.release(id).await.map_err(api_error)?;
    Ok(Json(ReleaseSessionResponse {
        session_id: id,
        remaining_refs,
        closed: remaining_refs == 0,
    }))
}

async fn run_command(
    session: Arc<UnifiedSession>,
    req: ExecuteCommandRequest,
) -> ApiResult<ExecuteCommandResponse> {
    let result = match req.engine.as_deref() {
        Some(engine) => {
            let route = Route::from_name(engine).map_err(api_error)?;
            session.execute_routed(route, &req.command, req.force_execute).await
        }
        None => session.execute_with_store(&req.command, req.force_execute).await,
    }
    .map_err(api_error)?;

    Ok(Json(ExecuteCommandResponse {
        session_id: session.id(),
        result,
    }))
}

/// Execute a command in a session.
pub async fn execute_command(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    req: Result<Json<ExecuteCommandRequest>, JsonRejection>,
) -> ApiResult<ExecuteCommandResponse> {
    let req = body(req)?;
    let session = state.session(&session_id)?;
    run_command(session, req).await
}

/// Execute a command in the most recently used session.
pub async fn execute_default(
    State(state): State<AppState>,
    req: Result<Json<ExecuteCommandRequest>, JsonRejection>,
) -> ApiResult<ExecuteCommandResponse> {
    let req = body(req)?;
    let session = state.manager.resolve(None).map_err(api_error)?;
    run_command(session, req).await
}

/// List stored results of a session.
pub async fn list_commands(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<ListCommandsResponse> {
    let session = state.session(&session_id)?;
    let commands = session.store().list().map_err(api_error)?;
    Ok(Json(ListCommandsResponse {
        session_id: session.id(),
        count: commands.len(),
        commands,
    }))
}

/// Read a window of lines from a stored result.
pub async fn get_lines(
    State(state): State<AppState>,
    Path((session_id, command_id)): Path<(String, String)>,
    lines: Result<Query<LinesQuery>, QueryRejection>,
) -> ApiResult<Page> {
    let lines = query(lines)?;
    let session = state.session(&session_id)?;
    session
        .read_lines(&command_id, lines.offset.unwrap_or(0), lines.limit)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Regex-search a stored result.
pub async fn search_output(
    State(state): State<AppState>,
    Path((session_id, command_id)): Path<(String, String)>,
    search: Result<Query<SearchQuery>, QueryRejection>,
) -> ApiResult<SearchResponse> {
    let search = query(search)?;
    let session = state.session(&session_id)?;
    let context = search.context_lines.unwrap_or(state.search_context);
    let matches = session
        .search_output(&command_id, &search.pattern, context)
        .await
        .map_err(api_error)?;
    Ok(Json(SearchResponse {
        command_id,
        pattern: search.pattern,
        count: matches.len(),
        matches,
    }))
}

/// List discovered analysis scripts.
pub async fn list_scripts(
    State(state): State<AppState>,
    filter: Result<Query<ScriptsQuery>, QueryRejection>,
) -> ApiResult<ListScriptsResponse> {
    let filter = query(filter)?;
    let scripts: Vec<_> = state
        .scripts
        .list(filter.category.as_deref())
        .into_iter()
        .cloned()
        .collect();
    Ok(Json(ListScriptsResponse {
        count: scripts.len(),
        scripts,
    }))
}

/// Run an analysis script through the session's drgn engine.
pub async fn run_script(
    State(state): State<AppState>,
    Path((session_id, name)): Path<(String, String)>,
    req: Result<Json<RunScriptRequest>, JsonRejection>,
) -> ApiResult<RunScriptResponse> {
    let req = body(req)?;
    let session = state.session(&session_id)?;
    let source = state.scripts.build(&name, &req.params).map_err(api_error)?;
    debug!(session_id = %session.id(), script = %name, "Running analysis script");

    let result = session
        .execute_routed(Route::Drgn, &source, req.force_execute)
        .await
        .map_err(api_error)?;
    Ok(Json(RunScriptResponse {
        session_id: session.id(),
        script: name,
        result,
    }))
}

/// Crash info report for a session, from the store when available.
pub async fn crash_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    info: Result<Query<CrashInfoQuery>, QueryRejection>,
) -> ApiResult<CrashInfoResponse> {
    let info = query(info)?;
    let session = state.session(&session_id)?;
    let report = state
        .report
        .report(&session, info.force)
        .await
        .map_err(api_error)?;
    Ok(Json(CrashInfoResponse {
        session_id: session.id(),
        report,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        assert_eq!(health().await, "OK");
    }

    #[test]
    fn test_api_error_shape() {
        let (status, Json(body)) = api_error(RelayError::InvalidArgument("offset".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "INVALID_ARGUMENT");
    }
}
