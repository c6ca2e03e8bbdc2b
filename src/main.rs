//! dump-relay binary entry point.

use std::process::ExitCode;
use std::sync::Arc;

use dump_relay::api::{serve_with_state, AppState};
use dump_relay::cli::{self, parse_args};
use dump_relay::config::Config;
use dump_relay::engine::PtyEngineFactory;
use dump_relay::logging;
use dump_relay::session::{SessionManager, SshProbe};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Try 'dump-relay --help' for more information.");
            return ExitCode::FAILURE;
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    logging::init(Some(config.log_filter()));
    info!("dump-relay v{}", env!("CARGO_PKG_VERSION"));

    let server_config = match config.to_server_config() {
        Ok(server_config) => server_config,
        Err(e) => {
            error!("Invalid server configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let probe = Arc::new(SshProbe::new(config.engines.ssh_key.clone()));
    let factory = Arc::new(PtyEngineFactory::new(config.engine_settings()));
    let manager = SessionManager::new(config.manager_config(), factory, config.fingerprinter(probe));
    info!(
        workdir = %config.session.workdir_root.display(),
        engines = ?config.engines.enabled,
        "Session manager initialized"
    );

    let scripts = config.script_registry();
    let report = config.report_runner();
    info!(
        scripts = scripts.len(),
        crash_info = report.is_configured(),
        "Analysis tools initialized"
    );

    let mut state = AppState::new(Arc::new(manager))
        .with_scripts(scripts)
        .with_report(report);
    if let Some(audit) = config.audit_log() {
        info!(path = %audit.path().display(), "Auditing API calls");
        state = state.with_audit(audit);
    }
    if let Err(e) = serve_with_state(server_config, state).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
