//! HTTP API for dump-relay.
//!
//! ## Endpoints
//!
//! ### Health & Info
//! - `GET /health` - Health check
//! - `GET /api/v1` - API information
//!
//! ### Sessions
//! - `GET /api/v1/sessions` - List ready sessions
//! - `POST /api/v1/sessions` - Open a session for a dump, or join the existing one
//! - `GET /api/v1/sessions/{id}` - Session status
//! - `DELETE /api/v1/sessions/{id}` - Release one reference
//!
//! ### Commands
//! - `POST /api/v1/sessions/{id}/commands` - Execute a command
//! - `GET /api/v1/sessions/{id}/commands` - List stored results
//! - `GET /api/v1/sessions/{id}/commands/{command_id}/lines?offset=&limit=` - Page through output
//! - `GET /api/v1/sessions/{id}/commands/{command_id}/search?pattern=&context_lines=` - Regex search
//! - `POST /api/v1/commands` - Execute in the most recently used session
//!
//! ### Analysis
//! - `GET /api/v1/scripts?category=` - List analysis scripts
//! - `POST /api/v1/sessions/{id}/scripts/{name}` - Run a script with parameters
//! - `GET /api/v1/sessions/{id}/info?force=` - Crash info report
//!
//! With auditing enabled, every `/api/v1` call is appended to
//! `<workdir_root>/tool_calls.jsonl`.

pub mod audit;
pub mod handlers;
pub mod router;
pub mod types;

pub use audit::{AuditEntry, AuditLog};
pub use handlers::AppState;
pub use router::{create_router_with_state, serve_with_state, ServerConfig};
pub use types::{
    CrashInfoResponse, ErrorResponse, ExecuteCommandRequest, ExecuteCommandResponse,
    ListScriptsResponse, ListSessionsResponse, OpenSessionRequest, OpenSessionResponse,
    ReleaseSessionResponse, RunScriptRequest, RunScriptResponse, SearchResponse,
};
