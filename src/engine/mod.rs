//! Engine adapter contract and command routing.
//!
//! An engine is one running interactive analysis backend (crash or drgn).
//! The session layer only talks to engines through the [`Engine`] and
//! [`EngineFactory`] traits; [`PtyEngineFactory`] is the production
//! implementation that drives the real tools under a pseudo-terminal.

mod profile;
mod pty;

pub use profile::{EngineProfile, EngineSettings};
pub use pty::{PtyEngine, PtyEngineFactory};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{ArtifactLocator, CommandContext};

/// Crash commands whose output depends on the selected task or cpu.
const CRASH_CONTEXT_COMMANDS: &[&str] = &["bt", "task", "vm", "vtop", "ptov", "rd", "wr"];

/// Crash commands that move the selected task or cpu.
const CRASH_CONTEXT_SETTERS: &[&str] = &["set"];

/// Closed set of backend engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// The `crash` utility (gdb based). Primary engine.
    Crash,
    /// The `drgn` programmable debugger (Python REPL).
    Drgn,
}

impl EngineKind {
    pub const ALL: [EngineKind; 2] = [EngineKind::Crash, EngineKind::Drgn];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Drgn => "drgn",
        }
    }

    /// Fixed lookup: does `body` read implicit session state on this engine?
    pub fn is_context_sensitive(&self, body: &str) -> bool {
        match self {
            Self::Crash => body
                .split_whitespace()
                .next()
                .is_some_and(|word| CRASH_CONTEXT_COMMANDS.contains(&word)),
            Self::Drgn => false,
        }
    }

    /// Does `body` change the state other commands are keyed by?
    pub fn changes_context(&self, body: &str) -> bool {
        match self {
            Self::Crash => body
                .split_whitespace()
                .next()
                .is_some_and(|word| CRASH_CONTEXT_SETTERS.contains(&word)),
            Self::Drgn => false,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = crate::error::RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crash" => Ok(Self::Crash),
            "drgn" => Ok(Self::Drgn),
            other => Err(crate::error::RelayError::InvalidArgument(format!(
                "unknown engine '{}'",
                other
            ))),
        }
    }
}

/// Where a command goes. Pykdump is a mode of the crash engine, not an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Crash { pykdump: bool },
    Drgn,
}

impl Route {
    /// Split an optional `<engine>:` prefix off `raw`.
    ///
    /// Unprefixed commands go to crash. Only the three known prefixes are
    /// stripped, so drgn code such as `x: int = 1` sent with `drgn:` survives.
    pub fn parse(raw: &str) -> (Route, &str) {
        let trimmed = raw.trim();
        for (prefix, route) in [
            ("crash:", Route::Crash { pykdump: false }),
            ("drgn:", Route::Drgn),
            ("pykdump:", Route::Crash { pykdump: true }),
        ] {
            if let Some(body) = trimmed.strip_prefix(prefix) {
                return (route, body.trim());
            }
        }
        (Route::Crash { pykdump: false }, trimmed)
    }

    /// Look up a route by the name a caller passes as `engine`.
    pub fn from_name(name: &str) -> crate::Result<Route> {
        match name.trim().to_ascii_lowercase().as_str() {
            "crash" => Ok(Route::Crash { pykdump: false }),
            "pykdump" => Ok(Route::Crash { pykdump: true }),
            "drgn" => Ok(Route::Drgn),
            other => Err(crate::error::RelayError::InvalidArgument(format!(
                "unknown engine '{}'",
                other
            ))),
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Route::Crash { .. } => EngineKind::Crash,
            Route::Drgn => EngineKind::Drgn,
        }
    }

    /// Tag used in command identifiers.
    pub fn tag(&self) -> &'static str {
        match self {
            Route::Crash { pykdump: false } => "crash",
            Route::Crash { pykdump: true } => "pykdump",
            Route::Drgn => "drgn",
        }
    }

    pub fn is_context_sensitive(&self, body: &str) -> bool {
        match self {
            Route::Crash { pykdump: true } => false,
            _ => self.kind().is_context_sensitive(body),
        }
    }

    /// Commands that move the context always run; a cached answer would
    /// leave the engine where it was.
    pub fn changes_context(&self, body: &str) -> bool {
        match self {
            Route::Crash { pykdump: true } => false,
            _ => self.kind().changes_context(body),
        }
    }

    /// Whether `output` is the tool reporting a failed command.
    pub fn output_is_error(&self, output: &str) -> bool {
        let first = output.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
        if first.starts_with("Traceback (most recent call last)") {
            return true;
        }
        match self {
            Route::Crash { pykdump: false } => {
                first.starts_with("crash: ")
                    || first.contains(": invalid ")
                    || first.starts_with("Usage:")
            }
            _ => is_python_exception(first),
        }
    }
}

/// `NameError: ...`, `drgn.FaultError: ...` and the like.
fn is_python_exception(line: &str) -> bool {
    match line.split_once(": ") {
        Some((name, _)) => {
            let name = name.rsplit('.').next().unwrap_or(name);
            (name.ends_with("Error") || name.ends_with("Exception"))
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// A routed command handed to an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub route: Route,
    pub body: String,
}

impl EngineCommand {
    pub fn new(route: Route, body: impl Into<String>) -> Self {
        Self {
            route,
            body: body.into(),
        }
    }
}

/// What an engine needs to start against a dump.
#[derive(Debug, Clone)]
pub struct EngineLaunch {
    pub locator: ArtifactLocator,
    /// Session workdir; engines may put scratch files here.
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Per-session crash arguments, appended after the configured ones.
    pub crash_args: Vec<String>,
}

/// Engine-level failures.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to start {engine}: {reason}")]
    Start { engine: EngineKind, reason: String },

    #[error("{0}")]
    Unavailable(String),

    /// The command overran its bound. `recovered` tells whether the engine
    /// was interrupted back to a ready prompt.
    #[error("command timed out (recovered: {recovered})")]
    Timeout { recovered: bool },

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One running interactive backend process.
///
/// Implementations serialize access to their pipe internally; the session
/// layer additionally holds one execution lock per session.
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Run one command and return its cleaned output.
    ///
    /// On timeout the adapter must interrupt the process and confirm it is
    /// back at its prompt before returning `Timeout { recovered: true }`.
    async fn execute(
        &self,
        command: &EngineCommand,
        timeout: Duration,
    ) -> Result<String, EngineError>;

    /// Side-effect-free query of the implicit state commands run under.
    async fn current_context(&self) -> Result<CommandContext, EngineError>;

    /// Best-effort shutdown.
    async fn terminate(&self);

    fn is_alive(&self) -> bool;
}

/// Starts engines for a session.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn start(
        &self,
        kind: EngineKind,
        launch: &EngineLaunch,
    ) -> Result<Arc<dyn Engine>, EngineError>;
}
