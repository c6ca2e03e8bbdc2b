//! Per-tool launch and prompt conventions.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use regex::Regex;

use super::{EngineError, EngineKind, EngineLaunch};

/// Settings shared by every engine the factory starts.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub crash_binary: String,
    pub drgn_binary: String,
    /// Extra arguments for every crash invocation.
    pub crash_args: Vec<String>,
    /// Pass `-x` so crash auto-loads extensions.
    pub load_extensions: bool,
    pub ssh_key: Option<PathBuf>,
    /// How long an interrupted engine gets to show its prompt again.
    pub recovery_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            crash_binary: "crash".to_string(),
            drgn_binary: "drgn".to_string(),
            crash_args: Vec::new(),
            load_extensions: true,
            ssh_key: None,
            recovery_timeout: Duration::from_secs(5),
        }
    }
}

/// How to launch and talk to one tool.
#[derive(Debug, Clone)]
pub struct EngineProfile {
    pub kind: EngineKind,
    pub program: String,
    pub args: Vec<String>,
    /// Matches the prompt at the very end of the sanitized output.
    pub prompt: Regex,
    /// Commands run once after the first prompt.
    pub init_commands: Vec<String>,
    pub quit_command: &'static str,
}

impl EngineProfile {
    /// Build the profile for `kind` against the dump described by `launch`.
    pub fn for_launch(
        kind: EngineKind,
        settings: &EngineSettings,
        launch: &EngineLaunch,
    ) -> Result<Self, EngineError> {
        let locator = &launch.locator;
        let dump = locator.dump_path.to_string_lossy().into_owned();
        let symbols = locator
            .symbols_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let (program, args, prompt, init_commands, quit_command) = match kind {
            EngineKind::Crash => {
                let mut args = Vec::new();
                if settings.load_extensions {
                    args.push("-x".to_string());
                }
                // Suppress the banner for cleaner parsing.
                args.push("-s".to_string());
                args.extend(settings.crash_args.iter().cloned());
                args.extend(launch.crash_args.iter().cloned());
                args.extend(symbols);
                args.push(dump);
                (
                    settings.crash_binary.clone(),
                    args,
                    r"crash[-\w]*> $",
                    vec![
                        "set scroll off".to_string(),
                        "gdb set debuginfod enabled off".to_string(),
                    ],
                    "quit",
                )
            }
            EngineKind::Drgn => {
                let mut args = vec!["-q".to_string(), "-c".to_string(), dump];
                if let Some(symbols) = symbols {
                    args.push("-s".to_string());
                    args.push(symbols);
                }
                (settings.drgn_binary.clone(), args, r">>> $", Vec::new(), "exit()")
            }
        };

        let (program, args) = match &locator.remote {
            Some(remote) => {
                let mut parts = Vec::with_capacity(args.len() + 1);
                parts.push(program.as_str());
                parts.extend(args.iter().map(String::as_str));
                let remote_command = shlex::try_join(parts).map_err(|e| EngineError::Start {
                    engine: kind,
                    reason: format!("cannot quote remote command: {}", e),
                })?;

                let mut ssh_args = vec![
                    // Force a remote tty so the tool stays interactive.
                    "-tt".to_string(),
                    "-o".to_string(),
                    "StrictHostKeyChecking=no".to_string(),
                ];
                if let Some(key) = &settings.ssh_key {
                    ssh_args.push("-i".to_string());
                    ssh_args.push(key.to_string_lossy().into_owned());
                }
                ssh_args.push(remote.destination());
                ssh_args.push(remote_command);
                ("ssh".to_string(), ssh_args)
            }
            None => (program, args),
        };

        let prompt = Regex::new(prompt).map_err(|e| EngineError::Start {
            engine: kind,
            reason: e.to_string(),
        })?;

        Ok(Self {
            kind,
            program,
            args,
            prompt,
            init_commands,
            quit_command,
        })
    }

    /// Turn a drgn body into a single line the REPL will accept.
    pub fn drgn_line(body: &str) -> String {
        if body.contains('\n') {
            let encoded = base64::engine::general_purpose::STANDARD.encode(body.as_bytes());
            format!(
                "exec(__import__('base64').b64decode('{}').decode())",
                encoded
            )
        } else {
            body.to_string()
        }
    }

    /// Strip echoed input and REPL continuation noise from raw output.
    pub fn clean_output(&self, sent: &str, raw: &str) -> String {
        let normalized = raw.replace("\r\n", "\n").replace('\r', "");
        let sent = sent.trim();
        let mut lines = normalized.lines().peekable();

        if let Some(first) = lines.peek() {
            if !sent.is_empty() && first.contains(sent) {
                lines.next();
            }
        }

        let body: Vec<&str> = match self.kind {
            EngineKind::Drgn => lines
                .skip_while(|line| line.starts_with("... ") || line.trim() == "...")
                .collect(),
            EngineKind::Crash => lines.collect(),
        };

        // Keep column alignment of the first line.
        body.join("\n")
            .trim_start_matches('\n')
            .trim_end()
            .to_string()
    }
}
