//! Crash-info report produced by an external diagnosis command.
//!
//! The command is a shell template with `{vmcore}` and `{vmlinux}`
//! placeholders. Its stdout is stored in the session's command store under
//! the `script` tag, so a second request is answered without rerunning it.
//! A JSON document between the report markers becomes the findings; any
//! other output is returned as its tail.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::session::{ArtifactLocator, UnifiedSession};
use crate::store::SaveOptions;

/// Store tag for externally produced output.
pub const REPORT_TAG: &str = "script";
/// Store key of the report.
pub const REPORT_COMMAND: &str = "get_crash_info";
/// Large dumps take minutes; shorter bounds are raised to this.
pub const MIN_REPORT_TIMEOUT: Duration = Duration::from_secs(300);

const START_MARKER: &str = "--- JSON REPORT START ---";
const END_MARKER: &str = "--- JSON REPORT END ---";
const RAW_TAIL_CHARS: usize = 2000;
const STDERR_TAIL_CHARS: usize = 500;

/// Report returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CrashReport {
    pub command_id: String,
    pub findings: Value,
    pub cached: bool,
    /// The command exited non-zero.
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Runs the configured report command.
#[derive(Debug, Clone)]
pub struct ReportRunner {
    template: Option<String>,
    timeout: Duration,
}

impl ReportRunner {
    pub fn new(template: Option<String>, timeout: Duration) -> Self {
        if timeout < MIN_REPORT_TIMEOUT {
            debug!(requested = ?timeout, "Raising report timeout to the minimum");
        }
        Self {
            template: template.filter(|t| !t.trim().is_empty()),
            timeout: timeout.max(MIN_REPORT_TIMEOUT),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, MIN_REPORT_TIMEOUT)
    }

    /// Use `timeout` as given, even below [`MIN_REPORT_TIMEOUT`].
    pub fn with_exact_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.template.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The shell command for `locator`, with paths quoted.
    pub fn command_for(&self, locator: &ArtifactLocator) -> Result<String> {
        let template = self
            .template
            .as_deref()
            .ok_or_else(|| RelayError::NotConfigured("crash info command".to_string()))?;

        let vmcore = quote(&locator.dump_path.to_string_lossy())?;
        let vmlinux = match &locator.symbols_path {
            Some(path) => quote(&path.to_string_lossy())?,
            None => "''".to_string(),
        };
        Ok(template
            .replace("{vmcore}", &vmcore)
            .replace("{vmlinux}", &vmlinux))
    }

    /// Cached report for `session`, or a fresh run when there is none,
    /// the cached one failed to parse, or `force` is set.
    pub async fn report(&self, session: &UnifiedSession, force: bool) -> Result<CrashReport> {
        let command = self.command_for(session.locator())?;

        if !force {
            if let Some(hit) = session.lookup_cached(REPORT_TAG, REPORT_COMMAND, None).await? {
                let findings = parse_report(&hit.text);
                if findings.get("parse_error").is_none() {
                    debug!(session_id = %session.id(), "Serving cached crash info");
                    return Ok(CrashReport {
                        command_id: hit.result.command_id,
                        findings,
                        cached: true,
                        is_error: false,
                        stderr: None,
                    });
                }
                warn!(session_id = %session.id(), "Cached crash info does not parse, rerunning");
            }
        }

        info!(session_id = %session.id(), command = %command, "Running crash info command");
        let started = Instant::now();
        let run = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RelayError::EngineUnavailable(format!(
                    "crash info command failed to start: {}",
                    e
                )))
            }
            Err(_) => {
                warn!(session_id = %session.id(), timeout = ?self.timeout, "Crash info command timed out");
                return Err(RelayError::Timeout(self.timeout));
            }
        };
        let duration = started.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let is_error = !output.status.success();
        let findings = parse_report(&stdout);
        let saved = session
            .persist(
                REPORT_TAG,
                REPORT_COMMAND,
                stdout,
                None,
                SaveOptions {
                    is_error,
                    duration: Some(duration),
                },
            )
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = (is_error && !stderr.trim().is_empty()).then(|| tail(&stderr, STDERR_TAIL_CHARS));
        if is_error {
            warn!(session_id = %session.id(), status = %output.status, "Crash info command failed");
        }

        Ok(CrashReport {
            command_id: saved.command_id,
            findings,
            cached: false,
            is_error,
            stderr,
        })
    }
}

fn quote(path: &str) -> Result<String> {
    shlex::try_quote(path)
        .map(|q| q.into_owned())
        .map_err(|e| RelayError::InvalidArgument(format!("cannot quote '{}': {}", path, e)))
}

/// Findings between the report markers, or the tail of the raw output.
pub fn parse_report(output: &str) -> Value {
    let Some(start) = output.find(START_MARKER) else {
        return json!({ "raw_output": tail(output, RAW_TAIL_CHARS) });
    };
    let body = &output[start + START_MARKER.len()..];
    let parsed = match body.find(END_MARKER) {
        Some(end) => serde_json::from_str::<Value>(body[..end].trim()).map_err(|e| e.to_string()),
        None => Err("missing end marker".to_string()),
    };
    match parsed {
        Ok(findings) => findings,
        Err(reason) => json!({
            "parse_error": reason,
            "raw_output": tail(output, RAW_TAIL_CHARS),
        }),
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
