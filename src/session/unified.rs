//! A session against one dump: engines, context tracking and the result cache.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::{ArtifactLocator, CommandContext, Fingerprint, SessionId, SessionState};
use crate::engine::{
    Engine, EngineCommand, EngineError, EngineFactory, EngineKind, EngineLaunch, Route,
};
use crate::error::{RelayError, Result};
use crate::store::{
    preview, CachedOutput, CommandStore, Page, SaveOptions, SearchMatch, StoreSettings,
    StoredResult,
};

/// Per-command behaviour of a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub command_timeout: Duration,
    /// Extra time the engine gets to recover from an interrupt before the
    /// session gives up on it.
    pub recovery_grace: Duration,
    /// Inline output is cut to this many lines; 0 disables truncation.
    pub truncate_lines: usize,
    pub cache_enabled: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            recovery_grace: Duration::from_secs(5),
            truncate_lines: 20,
            cache_enabled: true,
        }
    }
}

/// Caller-supplied options for opening a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub crash_args: Vec<String>,
}

/// Everything needed to bring a session up.
pub(crate) struct SessionSeed {
    pub id: SessionId,
    pub fingerprint: Fingerprint,
    pub locator: ArtifactLocator,
    pub options: SessionOptions,
    pub workdir: PathBuf,
    pub enabled: Vec<EngineKind>,
    pub start_timeout: Duration,
}

/// Result of one command as returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub command_id: String,
    pub engine: String,
    pub output: String,
    pub truncated: bool,
    pub total_lines: usize,
    pub returned_lines: usize,
    pub cached: bool,
    pub is_error: bool,
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub fingerprint: Fingerprint,
    pub dump_path: String,
    pub symbols_path: Option<String>,
    pub remote_host: Option<String>,
    pub workdir: String,
    pub state: SessionState,
    pub ref_count: usize,
    pub engines: Vec<EngineKind>,
    pub engine_errors: BTreeMap<EngineKind, String>,
    pub context: CommandContext,
    pub stored_commands: usize,
}

/// One live session. Owned by exactly one registry record.
pub struct UnifiedSession {
    id: SessionId,
    fingerprint: Fingerprint,
    locator: ArtifactLocator,
    workdir: PathBuf,
    engines: HashMap<EngineKind, Arc<dyn Engine>>,
    start_errors: BTreeMap<EngineKind, String>,
    /// Shared with blocking tasks that do the file I/O.
    store: Arc<CommandStore>,
    settings: SessionSettings,
    /// Serializes engine calls; the engine is one process behind one pipe.
    exec_lock: Mutex<()>,
    state: RwLock<SessionState>,
    context: RwLock<CommandContext>,
}

impl UnifiedSession {
    /// Start the enabled engines in parallel and open the result store.
    ///
    /// Succeeds if at least one engine comes up.
    pub(crate) async fn start(
        seed: SessionSeed,
        factory: &dyn EngineFactory,
        settings: SessionSettings,
        store_settings: StoreSettings,
    ) -> Result<Self> {
        let launch = EngineLaunch {
            locator: seed.locator.clone(),
            workdir: seed.workdir.clone(),
            timeout: seed.start_timeout,
            crash_args: seed.options.crash_args.clone(),
        };

        let starts = seed.enabled.iter().map(|&kind| {
            let launch = &launch;
            async move { (kind, factory.start(kind, launch).await) }
        });

        let mut engines = HashMap::new();
        let mut start_errors = BTreeMap::new();
        for (kind, result) in join_all(starts).await {
            match result {
                Ok(engine) => {
                    info!(session_id = %seed.id, engine = %kind, "Engine started");
                    engines.insert(kind, engine);
                }
                Err(e) => {
                    error!(session_id = %seed.id, engine = %kind, error = %e, "Engine failed to start");
                    start_errors.insert(kind, e.to_string());
                }
            }
        }

        if engines.is_empty() {
            let reasons = start_errors
                .iter()
                .map(|(k, e)| format!("{}: {}", k, e))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RelayError::EngineStart(if reasons.is_empty() {
                "no engines enabled".to_string()
            } else {
                reasons
            }));
        }

        let store = match CommandStore::open(&seed.workdir, store_settings) {
            Ok(store) => store,
            Err(e) => {
                join_all(engines.values().map(|e| e.terminate())).await;
                return Err(e);
            }
        };

        let session = Self {
            id: seed.id,
            fingerprint: seed.fingerprint,
            locator: seed.locator,
            workdir: seed.workdir,
            engines,
            start_errors,
            store: Arc::new(store),
            settings,
            exec_lock: Mutex::new(()),
            state: RwLock::new(SessionState::Starting),
            context: RwLock::new(CommandContext::new()),
        };

        if let Some(crash) = session.engines.get(&EngineKind::Crash) {
            match crash.current_context().await {
                Ok(ctx) => {
                    debug!(session_id = %session.id, context = %ctx, "Seeded context");
                    session.set_context(ctx);
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to seed context"),
            }
        }

        session.transition(SessionState::Ready)?;
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn locator(&self) -> &ArtifactLocator {
        &self.locator
    }

    pub fn store(&self) -> &CommandStore {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.state.read().map(|s| *s).unwrap_or(SessionState::Unusable)
    }

    /// Last known context snapshot.
    pub fn context(&self) -> CommandContext {
        self.context.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn has_engine(&self, kind: EngineKind) -> bool {
        self.engines.contains_key(&kind)
    }

    /// Split an optional engine prefix off `raw`.
    pub fn route(raw: &str) -> (Route, &str) {
        Route::parse(raw)
    }

    /// Route `raw` by its prefix and run it through the cache.
    pub async fn execute_with_store(&self, raw: &str, force_execute: bool) -> Result<CommandOutcome> {
        let (route, body) = Route::parse(raw);
        self.execute_routed(route, body, force_execute).await
    }

    /// Run `body` on `route`, answering from the cache when allowed.
    #[instrument(skip(self), fields(session_id = %self.id, engine = route.tag()))]
    pub async fn execute_routed(
        &self,
        route: Route,
        body: &str,
        force_execute: bool,
    ) -> Result<CommandOutcome> {
        let body = body.trim();
        if body.is_empty() {
            return Err(RelayError::InvalidArgument("empty command".to_string()));
        }
        self.ensure_usable()?;
        let engine = self.engine(route.kind())?;

        let sensitive = route.is_context_sensitive(body);
        let use_cache =
            self.settings.cache_enabled && !force_execute && !route.changes_context(body);

        // Context-free hits never wait behind a running command.
        if use_cache && !sensitive {
            if let Some(hit) = self.lookup_cached(route.tag(), body, None).await? {
                return Ok(self.cached_outcome(hit));
            }
        }

        let _guard = self.exec_lock.lock().await;
        self.ensure_usable()?;

        let context = if sensitive {
            let ctx = self.query_context(&engine).await?;
            Some(ctx)
        } else {
            None
        };

        if use_cache {
            if let Some(hit) = self.lookup_cached(route.tag(), body, context.clone()).await? {
                return Ok(self.cached_outcome(hit));
            }
        }

        let started = Instant::now();
        let command = EngineCommand::new(route, body);
        let output = self.run_engine(&engine, &command).await?;
        let duration = started.elapsed();

        // Commands like `set pid` move the context; later lookups must see it.
        if let Route::Crash { .. } = route {
            if let Err(e) = self.query_context(&engine).await {
                warn!(error = %e, "Failed to refresh context after command");
            }
        }

        let is_error = route.output_is_error(&output);
        let saved = self
            .persist(
                route.tag(),
                body,
                output.clone(),
                context,
                SaveOptions {
                    is_error,
                    duration: Some(duration),
                },
            )
            .await?;

        info!(
            command_id = %saved.command_id,
            lines = saved.total_lines,
            elapsed_ms = duration.as_millis() as u64,
            "Command executed"
        );
        Ok(self.outcome(&saved, &output, false))
    }

    /// Read a window of a stored result off the async workers.
    pub async fn read_lines(
        &self,
        command_id: &str,
        offset: i64,
        limit: Option<usize>,
    ) -> Result<Page> {
        let command_id = command_id.to_string();
        self.on_store(move |store| store.get_lines(&command_id, offset, limit))
            .await
    }

    /// Regex-search a stored result off the async workers.
    pub async fn search_output(
        &self,
        command_id: &str,
        pattern: &str,
        context_lines: usize,
    ) -> Result<Vec<SearchMatch>> {
        let command_id = command_id.to_string();
        let pattern = pattern.to_string();
        self.on_store(move |store| store.search(&command_id, &pattern, context_lines))
            .await
    }

    /// Cache lookup for output produced outside the engines.
    pub async fn lookup_cached(
        &self,
        tag: &str,
        command: &str,
        context: Option<CommandContext>,
    ) -> Result<Option<CachedOutput>> {
        let tag = tag.to_string();
        let command = command.to_string();
        self.on_store(move |store| store.get_cached(&tag, &command, context.as_ref()))
            .await
    }

    /// Persist output under `tag`, replacing any earlier result for it.
    pub async fn persist(
        &self,
        tag: &str,
        command: &str,
        text: String,
        context: Option<CommandContext>,
        options: SaveOptions,
    ) -> Result<StoredResult> {
        let tag = tag.to_string();
        let command = command.to_string();
        self.on_store(move |store| store.save_with(&tag, &command, &text, context.as_ref(), options))
            .await
    }

    /// Run `f` against the store on the blocking pool.
    async fn on_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&CommandStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| RelayError::Storage(std::io::Error::other(format!("store task failed: {}", e))))?
    }

    /// Snapshot for API responses.
    pub fn info(&self, ref_count: usize) -> SessionInfo {
        let mut engines: Vec<EngineKind> = self.engines.keys().copied().collect();
        engines.sort();
        SessionInfo {
            id: self.id,
            fingerprint: self.fingerprint.clone(),
            dump_path: self.locator.dump_path.display().to_string(),
            symbols_path: self
                .locator
                .symbols_path
                .as_ref()
                .map(|p| p.display().to_string()),
            remote_host: self.locator.remote.as_ref().map(|r| r.host.clone()),
            workdir: self.workdir.display().to_string(),
            state: self.state(),
            ref_count,
            engines,
            engine_errors: self.start_errors.clone(),
            context: self.context(),
            stored_commands: self.store.len(),
        }
    }

    /// Move to Closing and stop every engine. Called once, by the manager.
    pub(crate) async fn close(&self, clear_workdir: bool) {
        if let Err(e) = self.transition(SessionState::Closing) {
            warn!(session_id = %self.id, error = %e, "Closing session from unexpected state");
            if let Ok(mut state) = self.state.write() {
                *state = SessionState::Closing;
            }
        }

        join_all(self.engines.values().map(|engine| engine.terminate())).await;

        if clear_workdir {
            let workdir = self.workdir.clone();
            let cleared = self
                .on_store(move |store| {
                    store.clear()?;
                    std::fs::remove_dir(&workdir)?;
                    // The fingerprint directory is shared; it only goes once empty.
                    if let Some(parent) = workdir.parent() {
                        let _ = std::fs::remove_dir(parent);
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = cleared {
                warn!(session_id = %self.id, error = %e, "Failed to clean up workdir");
            }
        }
        info!(session_id = %self.id, fingerprint = %self.fingerprint, "Session closed");
    }

    fn engine(&self, kind: EngineKind) -> Result<Arc<dyn Engine>> {
        match self.engines.get(&kind) {
            Some(engine) => Ok(Arc::clone(engine)),
            None => Err(RelayError::EngineUnavailable(match self.start_errors.get(&kind) {
                Some(reason) => format!("{} is not running: {}", kind, reason),
                None => format!("{} is not enabled", kind),
            })),
        }
    }

    async fn query_context(&self, engine: &Arc<dyn Engine>) -> Result<CommandContext> {
        let ctx = engine
            .current_context()
            .await
            .map_err(|e| self.engine_failure(engine.kind(), e))?;
        self.set_context(ctx.clone());
        Ok(ctx)
    }

    async fn run_engine(&self, engine: &Arc<dyn Engine>, command: &EngineCommand) -> Result<String> {
        let limit = self.settings.command_timeout;
        let guard = limit + self.settings.recovery_grace + Duration::from_secs(1);

        match tokio::time::timeout(guard, engine.execute(command, limit)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(self.engine_failure(engine.kind(), e)),
            Err(_) => {
                // The adapter ignored its own bound; nothing vouches for the pipe.
                self.mark_unusable("engine did not return after its timeout");
                Err(RelayError::Timeout(limit))
            }
        }
    }

    fn engine_failure(&self, kind: EngineKind, err: EngineError) -> RelayError {
        match err {
            EngineError::Timeout { recovered: true } => {
                warn!(session_id = %self.id, engine = %kind, "Command timed out, engine recovered");
                RelayError::Timeout(self.settings.command_timeout)
            }
            EngineError::Timeout { recovered: false } => {
                self.mark_unusable(&format!("{} did not recover from a timeout", kind));
                RelayError::Timeout(self.settings.command_timeout)
            }
            EngineError::Unavailable(reason) => RelayError::EngineUnavailable(reason),
            EngineError::Start { reason, .. } => {
                RelayError::EngineUnavailable(format!("{}: {}", kind, reason))
            }
            EngineError::Io(e) => RelayError::EngineUnavailable(format!("{}: {}", kind, e)),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        let state = self.state();
        if state.can_execute() {
            return Ok(());
        }
        Err(match state {
            SessionState::Unusable => RelayError::SessionUnusable(self.id.to_string()),
            SessionState::Starting => RelayError::SessionStarting(self.id.to_string()),
            _ => RelayError::SessionNotFound(self.id.to_string()),
        })
    }

    fn mark_unusable(&self, reason: &str) {
        match self.transition(SessionState::Unusable) {
            Ok(()) => error!(session_id = %self.id, reason, "Session is now unusable"),
            Err(e) => debug!(session_id = %self.id, error = %e, "Not marking session unusable"),
        }
    }

    fn transition(&self, target: SessionState) -> Result<()> {
        let mut state = self.state.write().map_err(|_| RelayError::LockPoisoned)?;
        state.transition_to(target)
    }

    fn set_context(&self, ctx: CommandContext) {
        if let Ok(mut current) = self.context.write() {
            *current = ctx;
        }
    }

    fn cached_outcome(&self, hit: CachedOutput) -> CommandOutcome {
        debug!(session_id = %self.id, command_id = %hit.result.command_id, "Serving cached output");
        self.outcome(&hit.result, &hit.text, true)
    }

    fn outcome(&self, result: &StoredResult, text: &str, cached: bool) -> CommandOutcome {
        let head = preview(text, self.settings.truncate_lines);
        CommandOutcome {
            command_id: result.command_id.clone(),
            engine: result.engine.clone(),
            output: head.text,
            truncated: head.truncated,
            total_lines: head.total_lines,
            returned_lines: head.returned_lines,
            cached,
            is_error: result.is_error,
        }
    }
}
