//! Scripted engines for exercising sessions without crash or drgn installed.
//!
//! Bodies understood by [`FakeEngine`]:
//! - `set pid <N>` / `set <N>`: moves the selected task.
//! - `lines <N>`: prints `N` numbered lines.
//! - `slow`: sleeps for the configured delay before answering.
//! - `hang`: overruns the timeout and reports an unrecovered engine.
//! - `stall`: overruns the timeout, interrupts itself, reports recovery.
//! - `die`: the process exits.
//! - `bogus`: crash-style error output.
//!
//! Anything else echoes `<kind>:<body> pid=<pid>`.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dump_relay::engine::{
    Engine, EngineCommand, EngineError, EngineFactory, EngineKind, EngineLaunch,
};
use dump_relay::session::{
    ArtifactLocator, CommandContext, Fingerprinter, ManagerConfig, SessionManager,
    SessionSettings, SshProbe, DEFAULT_PREFIX_BYTES,
};
use dump_relay::store::StoreSettings;
use tempfile::TempDir;

/// Shared counters across every engine a factory started.
#[derive(Default)]
pub struct Counters {
    pub starts: AtomicUsize,
    pub executes: AtomicUsize,
    pub context_queries: AtomicUsize,
    pub terminations: AtomicUsize,
    /// Commands currently inside any engine.
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Set if one engine ever saw two calls at once.
    pub overlapped: AtomicBool,
}

impl Counters {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

/// How fake engines behave.
#[derive(Clone, Default)]
pub struct Behavior {
    /// Delay for `slow` commands.
    pub delay: Duration,
    /// Delay before `start` returns.
    pub start_delay: Duration,
    /// Delay before `terminate` returns.
    pub terminate_delay: Duration,
    /// Engines whose start fails.
    pub fail_start: HashSet<EngineKind>,
    /// Fail the test if any command reaches an engine.
    pub forbid_execute: bool,
}

pub struct FakeEngine {
    kind: EngineKind,
    behavior: Behavior,
    counters: Arc<Counters>,
    busy: AtomicBool,
    alive: AtomicBool,
    pid: Mutex<String>,
}

impl FakeEngine {
    fn new(kind: EngineKind, behavior: Behavior, counters: Arc<Counters>) -> Self {
        Self {
            kind,
            behavior,
            counters,
            busy: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            pid: Mutex::new("1".to_string()),
        }
    }

    fn enter(&self) -> Busy<'_> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.counters.overlapped.store(true, Ordering::SeqCst);
        }
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Busy(self)
    }

    fn pid(&self) -> String {
        self.pid.lock().unwrap().clone()
    }
}

struct Busy<'a>(&'a FakeEngine);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn execute(
        &self,
        command: &EngineCommand,
        timeout: Duration,
    ) -> Result<String, EngineError> {
        assert!(
            !self.behavior.forbid_execute,
            "engine invoked for '{}'",
            command.body
        );
        if !self.alive.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("engine process has exited".into()));
        }

        let _busy = self.enter();
        self.counters.executes.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let body = command.body.as_str();
        let mut words = body.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("set"), Some("pid"), Some(pid)) | (Some("set"), Some(pid), None) => {
                *self.pid.lock().unwrap() = pid.to_string();
                Ok(format!("    PID: {}", pid))
            }
            (Some("lines"), Some(n), None) => {
                let n: usize = n.parse().unwrap();
                Ok((1..=n)
                    .map(|i| format!("line {}", i))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            (Some("slow"), _, _) => {
                tokio::time::sleep(self.behavior.delay).await;
                Ok(format!("{}:slow pid={}", self.kind, self.pid()))
            }
            (Some("hang"), _, _) => {
                tokio::time::sleep(timeout).await;
                Err(EngineError::Timeout { recovered: false })
            }
            (Some("stall"), _, _) => {
                tokio::time::sleep(timeout).await;
                Err(EngineError::Timeout { recovered: true })
            }
            (Some("die"), _, _) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(EngineError::Unavailable("engine process has exited".into()))
            }
            (Some("bogus"), _, _) => Ok("crash: command not found: bogus".to_string()),
            _ => Ok(format!("{}:{} pid={}", self.kind, body, self.pid())),
        }
    }

    async fn current_context(&self) -> Result<CommandContext, EngineError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("engine process has exited".into()));
        }
        let _busy = self.enter();
        self.counters.context_queries.fetch_add(1, Ordering::SeqCst);
        Ok(match self.kind {
            EngineKind::Crash => CommandContext::new().with("pid", self.pid()),
            EngineKind::Drgn => CommandContext::new(),
        })
    }

    async fn terminate(&self) {
        if !self.behavior.terminate_delay.is_zero() {
            tokio::time::sleep(self.behavior.terminate_delay).await;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.counters.terminations.fetch_add(1, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

pub struct FakeFactory {
    pub behavior: Behavior,
    pub counters: Arc<Counters>,
    launches: Mutex<Vec<PathBuf>>,
}

impl FakeFactory {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            counters: Arc::new(Counters::default()),
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Workdirs engines were started for.
    pub fn launches(&self) -> Vec<PathBuf> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineFactory for FakeFactory {
    async fn start(
        &self,
        kind: EngineKind,
        launch: &EngineLaunch,
    ) -> Result<Arc<dyn Engine>, EngineError> {
        if !self.behavior.start_delay.is_zero() {
            tokio::time::sleep(self.behavior.start_delay).await;
        }
        if self.behavior.fail_start.contains(&kind) {
            return Err(EngineError::Start {
                engine: kind,
                reason: "binary not found".into(),
            });
        }
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        self.launches.lock().unwrap().push(launch.workdir.clone());
        Ok(Arc::new(FakeEngine::new(
            kind,
            self.behavior.clone(),
            Arc::clone(&self.counters),
        )))
    }
}

/// A manager wired to fake engines, with its own dumps and workdir root.
pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub factory: Arc<FakeFactory>,
    pub root: TempDir,
}

impl Harness {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_settings(behavior, SessionSettings::default())
    }

    pub fn with_settings(behavior: Behavior, session: SessionSettings) -> Self {
        Self::configured(behavior, |config| config.session = session)
    }

    /// Harness whose manager config is adjusted by `tweak`.
    pub fn configured(behavior: Behavior, tweak: impl FnOnce(&mut ManagerConfig)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new(behavior));
        let mut config = ManagerConfig {
            workdir_root: root.path().join("sessions"),
            start_timeout: Duration::from_secs(5),
            session: SessionSettings::default(),
            store: StoreSettings::default(),
            ..ManagerConfig::default()
        };
        tweak(&mut config);
        let fingerprinter = Fingerprinter::new(
            DEFAULT_PREFIX_BYTES,
            Default::default(),
            Arc::new(SshProbe::new(None)),
        );
        let manager = Arc::new(SessionManager::new(
            config,
            factory.clone() as Arc<dyn EngineFactory>,
            fingerprinter,
        ));
        Self {
            manager,
            factory,
            root,
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.factory.counters
    }

    /// Write a dump with the given content and return its locator.
    pub fn dump(&self, name: &str, content: &[u8]) -> ArtifactLocator {
        let path = self.root.path().join(name);
        std::fs::write(&path, content).unwrap();
        ArtifactLocator::local(path)
    }

    pub fn sessions_root(&self) -> &Path {
        self.root.path()
    }

    /// Directory holding every session workdir.
    pub fn workdir_root(&self) -> PathBuf {
        self.manager.config().workdir_root.clone()
    }
}

/// Settings with a short command bound for timeout tests.
pub fn quick_timeouts() -> SessionSettings {
    SessionSettings {
        command_timeout: Duration::from_millis(100),
        recovery_grace: Duration::from_millis(100),
        ..SessionSettings::default()
    }
}
