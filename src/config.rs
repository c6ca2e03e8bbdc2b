//! Configuration management for dump-relay.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values
//!
//! Components never read this struct directly; it is converted into the
//! parameter structs they take ([`ManagerConfig`], [`EngineSettings`], ...).

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{AuditLog, ServerConfig};
use crate::cli::Args;
use crate::engine::{EngineKind, EngineSettings};
use crate::session::{
    Fingerprinter, ManagerConfig, RemoteFingerprintPolicy, RemoteProbe, SessionSettings,
    DEFAULT_PREFIX_BYTES,
};
use crate::scripts::{ReportRunner, ScriptRegistry, MIN_REPORT_TIMEOUT};
use crate::store::StoreSettings;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub session: SessionSection,
    pub output: OutputSection,
    pub engines: EnginesSection,
    pub scripts: ScriptsSection,
    pub logging: LoggingSection,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Release every session on Ctrl-C before exiting.
    pub graceful_shutdown: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            graceful_shutdown: true,
        }
    }
}

/// Session lifecycle section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Each session gets `<workdir_root>/<fingerprint>/<session id>`.
    pub workdir_root: PathBuf,
    pub cleanup_workdir_on_close: bool,
    pub start_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Time an interrupted engine gets to show its prompt again.
    pub recovery_timeout_secs: u64,
    /// Bytes of the dump hashed for its fingerprint.
    pub fingerprint_prefix_bytes: u64,
    pub remote_fingerprint: RemoteFingerprintPolicy,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            workdir_root: PathBuf::from("/tmp/dump-relay-sessions"),
            cleanup_workdir_on_close: false,
            start_timeout_secs: 120,
            command_timeout_secs: 60,
            recovery_timeout_secs: 5,
            fingerprint_prefix_bytes: DEFAULT_PREFIX_BYTES,
            remote_fingerprint: RemoteFingerprintPolicy::default(),
        }
    }
}

/// Output delivery and cache section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    /// Lines returned inline per command; 0 returns everything.
    pub truncate_lines: usize,
    pub cache_enabled: bool,
    pub default_page_limit: usize,
    pub max_page_limit: usize,
    /// Context lines around search hits when the caller does not say.
    pub default_search_context: usize,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            truncate_lines: 20,
            cache_enabled: true,
            default_page_limit: 50,
            max_page_limit: 500,
            default_search_context: 3,
        }
    }
}

/// Engine binaries and launch options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesSection {
    pub crash_binary: String,
    pub drgn_binary: String,
    pub crash_args: Vec<String>,
    pub load_extensions: bool,
    pub ssh_key: Option<PathBuf>,
    pub enabled: Vec<EngineKind>,
}

impl Default for EnginesSection {
    fn default() -> Self {
        Self {
            crash_binary: "crash".to_string(),
            drgn_binary: "drgn".to_string(),
            crash_args: Vec::new(),
            load_extensions: true,
            ssh_key: None,
            enabled: EngineKind::ALL.to_vec(),
        }
    }
}

/// Analysis scripts and the crash info report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsSection {
    /// Directories searched for drgn scripts, in order.
    pub dirs: Vec<PathBuf>,
    /// Shell template with `{vmcore}` and `{vmlinux}`; unset disables the report.
    pub info_command: Option<String>,
    pub info_timeout_secs: u64,
}

impl Default for ScriptsSection {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            info_command: None,
            info_timeout_secs: MIN_REPORT_TIMEOUT.as_secs(),
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a full filter.
    pub level: String,
    /// Append every API call to `<workdir_root>/tool_calls.jsonl`.
    pub audit_calls: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            audit_calls: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_env_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("DUMP_RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("DUMP_RELAY_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(dir) = var("DUMP_RELAY_WORKDIR").filter(|d| !d.is_empty()) {
            self.session.workdir_root = PathBuf::from(dir);
        }
        if let Some(lines) = var("DUMP_RELAY_TRUNCATE_LINES").and_then(|n| n.parse().ok()) {
            self.output.truncate_lines = lines;
        }
        if let Some(cache) = var("DUMP_RELAY_CACHE").and_then(|c| parse_bool(&c)) {
            self.output.cache_enabled = cache;
        }

        if let Some(paths) = var("DUMP_RELAY_SCRIPTS_PATH") {
            self.scripts.dirs = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        if let Some(command) = var("DUMP_RELAY_INFO_COMMAND") {
            self.scripts.info_command = Some(command).filter(|c| !c.trim().is_empty());
        }
        if let Some(audit) = var("DUMP_RELAY_AUDIT").and_then(|a| parse_bool(&a)) {
            self.logging.audit_calls = audit;
        }

        if let Some(level) = var("DUMP_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = args.host {
            self.server.host = host.to_string();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(ref dir) = args.workdir {
            self.session.workdir_root = dir.clone();
        }
        if let Some(lines) = args.truncate_lines {
            self.output.truncate_lines = lines;
        }
        if args.no_cache {
            self.output.cache_enabled = false;
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match args.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env();
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output.max_page_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "output.max_page_limit",
                "must be at least 1".to_string(),
            ));
        }
        if self.output.default_page_limit > self.output.max_page_limit {
            return Err(ConfigError::InvalidValue(
                "output.default_page_limit",
                format!("exceeds max_page_limit ({})", self.output.max_page_limit),
            ));
        }
        if self.engines.enabled.is_empty() {
            return Err(ConfigError::InvalidValue(
                "engines.enabled",
                "at least one engine is required".to_string(),
            ));
        }
        if self.session.command_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "session.command_timeout_secs",
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Convert to ServerConfig for the API server.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let host: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.server.host.clone()))?;

        let mut server_config = ServerConfig::new(host.to_string(), self.server.port)
            .with_search_context(self.output.default_search_context);
        if !self.server.graceful_shutdown {
            server_config = server_config.without_graceful_shutdown();
        }
        Ok(server_config)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            command_timeout: Duration::from_secs(self.session.command_timeout_secs),
            recovery_grace: Duration::from_secs(self.session.recovery_timeout_secs),
            truncate_lines: self.output.truncate_lines,
            cache_enabled: self.output.cache_enabled,
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            default_page_limit: self.output.default_page_limit,
            max_page_limit: self.output.max_page_limit,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            workdir_root: self.session.workdir_root.clone(),
            cleanup_workdir_on_close: self.session.cleanup_workdir_on_close,
            start_timeout: Duration::from_secs(self.session.start_timeout_secs),
            enabled_engines: self.engines.enabled.clone(),
            session: self.session_settings(),
            store: self.store_settings(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            crash_binary: self.engines.crash_binary.clone(),
            drgn_binary: self.engines.drgn_binary.clone(),
            crash_args: self.engines.crash_args.clone(),
            load_extensions: self.engines.load_extensions,
            ssh_key: self.engines.ssh_key.clone(),
            recovery_timeout: Duration::from_secs(self.session.recovery_timeout_secs),
        }
    }

    pub fn fingerprinter(&self, probe: Arc<dyn RemoteProbe>) -> Fingerprinter {
        Fingerprinter::new(
            self.session.fingerprint_prefix_bytes,
            self.session.remote_fingerprint,
            probe,
        )
    }

    /// Scan the configured script directories.
    pub fn script_registry(&self) -> ScriptRegistry {
        ScriptRegistry::discover(&self.scripts.dirs)
    }

    pub fn report_runner(&self) -> ReportRunner {
        ReportRunner::new(
            self.scripts.info_command.clone(),
            Duration::from_secs(self.scripts.info_timeout_secs),
        )
    }

    /// The call audit log, if enabled.
    pub fn audit_log(&self) -> Option<AuditLog> {
        self.logging
            .audit_calls
            .then(|| AuditLog::in_dir(&self.session.workdir_root))
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid host address: {0}")]
    InvalidHost(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
