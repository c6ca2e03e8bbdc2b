//! PTY-driven engine adapter using portable-pty.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use regex::Regex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::profile::{EngineProfile, EngineSettings};
use super::{Engine, EngineCommand, EngineError, EngineFactory, EngineKind, EngineLaunch, Route};
use crate::output::OutputSanitizer;
use crate::session::{CommandContext, ContextProbe};

/// Buffer size for reading PTY output.
const READ_BUFFER_SIZE: usize = 8192;

/// Only this much of the buffer tail is scanned for the prompt.
const PROMPT_SCAN_BYTES: usize = 512;

/// Bound for the context query and init commands.
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(30);

/// Wide terminal so tools don't wrap long lines.
const PTY_COLS: u16 = 512;

/// Starts crash and drgn under pseudo-terminals.
pub struct PtyEngineFactory {
    settings: EngineSettings,
}

impl PtyEngineFactory {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EngineFactory for PtyEngineFactory {
    async fn start(
        &self,
        kind: EngineKind,
        launch: &EngineLaunch,
    ) -> Result<Arc<dyn Engine>, EngineError> {
        let profile = EngineProfile::for_launch(kind, &self.settings, launch)?;
        info!(
            engine = %kind,
            program = %profile.program,
            args = ?profile.args,
            "Starting engine"
        );

        let engine = PtyEngine::spawn(
            profile,
            launch.workdir.clone(),
            self.settings.recovery_timeout,
        )?;

        if let Err(e) = engine.wait_ready(launch.timeout).await {
            engine.terminate().await;
            return Err(e);
        }

        Ok(Arc::new(engine))
    }
}

/// Exclusive access to the process pipe.
struct PtyIo {
    writer: Box<dyn Write + Send>,
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

enum ReadFailure {
    TimedOut,
    Closed,
}

/// One interactive tool running under a PTY.
pub struct PtyEngine {
    profile: EngineProfile,
    io: Mutex<PtyIo>,
    child: std::sync::Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    /// Kept alive so the PTY is not torn down under the child.
    _master: std::sync::Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    alive: AtomicBool,
    scratch_dir: PathBuf,
    scratch_seq: AtomicU64,
    recovery_timeout: Duration,
}

impl PtyEngine {
    /// Spawn the tool described by `profile`. Does not wait for the prompt.
    pub fn spawn(
        profile: EngineProfile,
        scratch_dir: PathBuf,
        recovery_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let kind = profile.kind;
        let start_err = |reason: String| EngineError::Start {
            engine: kind,
            reason,
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| start_err(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&profile.program);
        cmd.args(&profile.args);
        cmd.env("TERM", "dumb");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| start_err(e.to_string()))?;
        debug!(engine = %kind, pid = ?child.process_id(), "Engine process spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| start_err(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| start_err(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        spawn_reader(kind, reader, tx)?;

        Ok(Self {
            profile,
            io: Mutex::new(PtyIo {
                writer,
                rx,
                pending: Vec::new(),
            }),
            child: std::sync::Mutex::new(child),
            _master: std::sync::Mutex::new(pair.master),
            alive: AtomicBool::new(true),
            scratch_dir,
            scratch_seq: AtomicU64::new(0),
            recovery_timeout,
        })
    }

    /// Wait for the first prompt, then run the profile's init commands.
    async fn wait_ready(&self, timeout: Duration) -> Result<(), EngineError> {
        let kind = self.profile.kind;
        let mut io = self.io.lock().await;

        match read_until_prompt(&self.profile.prompt, &mut io, timeout).await {
            Ok(banner) => trace!(engine = %kind, banner = %banner.trim(), "Engine prompt reached"),
            Err(ReadFailure::TimedOut) => {
                return Err(EngineError::Start {
                    engine: kind,
                    reason: format!("no prompt within {:?}", timeout),
                })
            }
            Err(ReadFailure::Closed) => {
                self.alive.store(false, Ordering::SeqCst);
                return Err(EngineError::Start {
                    engine: kind,
                    reason: "process exited before showing its prompt".to_string(),
                });
            }
        }

        for init in &self.profile.init_commands {
            self.run_line(&mut io, init, HOUSEKEEPING_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Send one line and collect everything up to the next prompt.
    async fn run_line(
        &self,
        io: &mut PtyIo,
        line: &str,
        timeout: Duration,
    ) -> Result<String, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::Unavailable(format!(
                "{} process is not running",
                self.profile.kind
            )));
        }

        drain(io);
        write_line(io, line)?;

        match read_until_prompt(&self.profile.prompt, io, timeout).await {
            Ok(raw) => Ok(self.profile.clean_output(line, &raw)),
            Err(ReadFailure::Closed) => {
                self.alive.store(false, Ordering::SeqCst);
                error!(engine = %self.profile.kind, "Engine process closed its terminal");
                Err(EngineError::Unavailable(format!(
                    "{} process exited unexpectedly",
                    self.profile.kind
                )))
            }
            Err(ReadFailure::TimedOut) => {
                let recovered = self.interrupt(io).await;
                if !recovered {
                    self.alive.store(false, Ordering::SeqCst);
                }
                Err(EngineError::Timeout { recovered })
            }
        }
    }

    /// Send Ctrl-C and check the prompt comes back.
    async fn interrupt(&self, io: &mut PtyIo) -> bool {
        warn!(engine = %self.profile.kind, "Command timed out, interrupting");
        if io.writer.write_all(b"\x03").and_then(|_| io.writer.flush()).is_err() {
            return false;
        }
        io.pending.clear();

        let recovered = read_until_prompt(&self.profile.prompt, io, self.recovery_timeout)
            .await
            .is_ok();
        if recovered {
            info!(engine = %self.profile.kind, "Engine recovered after interrupt");
        } else {
            error!(engine = %self.profile.kind, "Engine did not recover after interrupt");
        }
        recovered
    }

    /// Write pykdump code to a scratch file for `epython`.
    async fn write_scratch(&self, code: &str) -> Result<PathBuf, EngineError> {
        let seq = self.scratch_seq.fetch_add(1, Ordering::Relaxed);
        let path = self.scratch_dir.join(format!(".pykdump_{:04}.py", seq));
        // Callers often double-escape newlines.
        tokio::fs::write(&path, code.replace("\\n", "\n")).await?;
        Ok(path)
    }
}

#[async_trait]
impl Engine for PtyEngine {
    fn kind(&self) -> EngineKind {
        self.profile.kind
    }

    async fn execute(
        &self,
        command: &EngineCommand,
        timeout: Duration,
    ) -> Result<String, EngineError> {
        let mut scratch = None;
        let line = match command.route {
            Route::Crash { pykdump: true } => {
                let path = self.write_scratch(&command.body).await?;
                let line = format!("epython {}", path.display());
                scratch = Some(path);
                line
            }
            Route::Drgn => EngineProfile::drgn_line(&command.body),
            Route::Crash { pykdump: false } => command.body.clone(),
        };

        let result = {
            let mut io = self.io.lock().await;
            self.run_line(&mut io, &line, timeout).await
        };

        if let Some(path) = scratch {
            let _ = tokio::fs::remove_file(path).await;
        }
        result
    }

    async fn current_context(&self) -> Result<CommandContext, EngineError> {
        match self.profile.kind {
            EngineKind::Crash => {
                let mut io = self.io.lock().await;
                let output = self
                    .run_line(&mut io, ContextProbe::crash_query(), HOUSEKEEPING_TIMEOUT)
                    .await?;
                Ok(ContextProbe::parse_crash_set(&output))
            }
            EngineKind::Drgn => Ok(CommandContext::new()),
        }
    }

    async fn terminate(&self) {
        let kind = self.profile.kind;
        let was_alive = self.alive.swap(false, Ordering::SeqCst);

        // An in-flight command keeps the pipe; skip the polite quit then.
        if was_alive {
            if let Ok(mut io) = self.io.try_lock() {
                let _ = write_line(&mut io, self.profile.quit_command);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        match self.child.lock() {
            Ok(mut child) => {
                if let Ok(None) = child.try_wait() {
                    if let Err(e) = child.kill() {
                        warn!(engine = %kind, error = %e, "Failed to kill engine process");
                    }
                }
            }
            Err(_) => warn!(engine = %kind, "Engine child handle poisoned"),
        }
        info!(engine = %kind, "Engine terminated");
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Pump blocking PTY reads into a channel from a dedicated thread.
fn spawn_reader(
    kind: EngineKind,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<(), EngineError> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", kind))
        .spawn(move || {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!(engine = %kind, "PTY reader: EOF");
                        break;
                    }
                    Ok(n) => {
                        trace!(engine = %kind, "PTY reader: read {} bytes", n);
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            debug!(engine = %kind, "PTY reader: channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO on Unix means the slave side was closed.
                        #[cfg(unix)]
                        if e.raw_os_error() == Some(libc::EIO) {
                            debug!(engine = %kind, "PTY reader: PTY closed (EIO)");
                            break;
                        }
                        if e.kind() == std::io::ErrorKind::Interrupted {
                            continue;
                        }
                        error!(engine = %kind, "PTY reader error: {}", e);
                        break;
                    }
                }
            }
        })
        .map(|_| ())
        .map_err(EngineError::Io)
}

fn write_line(io: &mut PtyIo, line: &str) -> Result<(), EngineError> {
    io.writer.write_all(line.as_bytes())?;
    io.writer.write_all(b"\n")?;
    io.writer.flush()?;
    Ok(())
}

/// Discard anything left over from a previous command.
fn drain(io: &mut PtyIo) {
    io.pending.clear();
    while let Ok(chunk) = io.rx.try_recv() {
        trace!("Discarding {} stale bytes", chunk.len());
    }
}

/// Accumulate output until `prompt` matches the end of the sanitized tail.
async fn read_until_prompt(
    prompt: &Regex,
    io: &mut PtyIo,
    limit: Duration,
) -> Result<String, ReadFailure> {
    let deadline = tokio::time::Instant::now() + limit;

    loop {
        let tail_start = io.pending.len().saturating_sub(PROMPT_SCAN_BYTES);
        let tail = OutputSanitizer::strip_ansi(&io.pending[tail_start..]);
        if prompt.is_match(&tail) {
            let text = OutputSanitizer::strip_ansi(&io.pending);
            io.pending.clear();
            let end = prompt.find(&text).map(|m| m.start()).unwrap_or(text.len());
            return Ok(text[..end].to_string());
        }

        match tokio::time::timeout_at(deadline, io.rx.recv()).await {
            Ok(Some(chunk)) => io.pending.extend_from_slice(&chunk),
            Ok(None) => return Err(ReadFailure::Closed),
            Err(_) => return Err(ReadFailure::TimedOut),
        }
    }
}
