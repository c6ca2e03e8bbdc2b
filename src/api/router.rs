//! API router configuration.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use super::audit::record_call;
use super::handlers::{
    api_info, crash_info, execute_command, execute_default, get_lines, get_session, health,
    list_commands, list_scripts, list_sessions, open_session, release_session, run_script,
    search_output, AppState,
};

/// Create the API router with the given state.
pub fn create_router_with_state(state: AppState) -> Router {
    // Session routes
    let session_routes = Router::new()
        .route("/", get(list_sessions).post(open_session))
        .route("/{id}", get(get_session).delete(release_session))
        .route("/{id}/commands", get(list_commands).post(execute_command))
        .route("/{id}/commands/{command_id}/lines", get(get_lines))
        .route("/{id}/commands/{command_id}/search", get(search_output))
        .route("/{id}/scripts/{name}", post(run_script))
        .route("/{id}/info", get(crash_info));

    // API v1 routes
    let api_v1 = Router::new()
        .route("/", get(api_info))
        .route("/commands", post(execute_default))
        .route("/scripts", get(list_scripts))
        .nest("/sessions", session_routes);
    let api_v1 = match state.audit.clone() {
        Some(audit) => api_v1.layer(middleware::from_fn_with_state(audit, record_call)),
        None => api_v1,
    };

    // Build main router
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Default context lines for search requests.
    pub search_context: usize,
    /// Stop on SIGINT/SIGTERM and close all sessions first.
    pub graceful_shutdown: bool,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_search_context(mut self, lines: usize) -> Self {
        self.search_context = lines;
        self
    }

    pub fn without_graceful_shutdown(mut self) -> Self {
        self.graceful_shutdown = false;
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            search_context: 3,
            graceful_shutdown: true,
        }
    }
}

/// Start the API server.
///
/// Returns once the listener stops; every open session is closed before
/// returning.
pub async fn serve_with_state(config: ServerConfig, state: AppState) -> crate::Result<()> {
    let addr = config.bind_address();
    let manager = state.manager.clone();
    let router = create_router_with_state(state.with_search_context(config.search_context));

    info!("Starting dump-relay API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let served = if config.graceful_shutdown {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
    } else {
        axum::serve(listener, router).await
    };

    manager.shutdown_all().await;
    served.map_err(|e| std::io::Error::other(e.to_string()))?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.bind_address(), "127.0.0.1:3000");
        assert!(config.graceful_shutdown);
    }

    #[test]
    fn test_server_config_custom() {
        let config = ServerConfig::new("0.0.0.0", 8080)
            .with_search_context(5)
            .without_graceful_shutdown();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.search_context, 5);
        assert!(!config.graceful_shutdown);
    }
}
