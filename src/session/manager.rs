//! Registry of live sessions, deduplicated by dump fingerprint.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::unified::SessionSeed;
use super::{
    ArtifactLocator, Fingerprint, Fingerprinter, SessionId, SessionInfo, SessionOptions,
    SessionSettings, UnifiedSession,
};
use crate::engine::{EngineFactory, EngineKind};
use crate::error::{RelayError, Result};
use crate::store::StoreSettings;

/// Injected parameters for the [`SessionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub workdir_root: PathBuf,
    pub cleanup_workdir_on_close: bool,
    pub start_timeout: Duration,
    pub enabled_engines: Vec<EngineKind>,
    pub session: SessionSettings,
    pub store: StoreSettings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workdir_root: PathBuf::from("/tmp/dump-relay-sessions"),
            cleanup_workdir_on_close: false,
            start_timeout: Duration::from_secs(120),
            enabled_engines: EngineKind::ALL.to_vec(),
            session: SessionSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

/// Returned by [`SessionManager::acquire`].
#[derive(Clone)]
pub struct Acquired {
    pub id: SessionId,
    pub session: Arc<UnifiedSession>,
    pub info: SessionInfo,
    pub is_new: bool,
}

/// Published once by the task that starts a session.
#[derive(Clone)]
enum StartOutcome {
    Ready(Arc<UnifiedSession>),
    Failed(String),
}

enum Slot {
    Starting(watch::Receiver<Option<StartOutcome>>),
    Live(Arc<UnifiedSession>),
}

struct SessionRecord {
    fingerprint: Fingerprint,
    ref_count: usize,
    touched: Instant,
    slot: Slot,
}

#[derive(Default)]
struct Registry {
    by_fingerprint: HashMap<Fingerprint, SessionId>,
    records: HashMap<SessionId, SessionRecord>,
    last_touched: Option<SessionId>,
}

impl Registry {
    fn touch(&mut self, id: SessionId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.touched = Instant::now();
            self.last_touched = Some(id);
        }
    }

    fn remove(&mut self, id: SessionId) -> Option<SessionRecord> {
        let record = self.records.remove(&id)?;
        self.by_fingerprint.remove(&record.fingerprint);
        if self.last_touched == Some(id) {
            self.last_touched = self
                .records
                .iter()
                .max_by_key(|(_, r)| r.touched)
                .map(|(id, _)| *id);
        }
        Some(record)
    }
}

enum Step {
    Existing(Arc<UnifiedSession>, usize),
    Wait(SessionId, watch::Receiver<Option<StartOutcome>>),
    Create(SessionId, watch::Sender<Option<StartOutcome>>),
}

/// Owns the fingerprint to session registry.
///
/// The registry mutex only guards map bookkeeping. Fingerprinting, engine
/// start and engine shutdown all run outside it, so a slow dump never blocks
/// lookups for another.
pub struct SessionManager {
    registry: Arc<Mutex<Registry>>,
    factory: Arc<dyn EngineFactory>,
    fingerprinter: Fingerprinter,
    config: Arc<ManagerConfig>,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        factory: Arc<dyn EngineFactory>,
        fingerprinter: Fingerprinter,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            factory,
            fingerprinter,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| RelayError::LockPoisoned)
    }

    /// Get the session for this dump, starting one if none exists.
    ///
    /// Concurrent calls for the same dump share a single start; late callers
    /// wait for it instead of launching a second engine set.
    pub async fn acquire(
        &self,
        locator: ArtifactLocator,
        options: SessionOptions,
    ) -> Result<Acquired> {
        let fingerprint = self.fingerprinter.compute(&locator).await;

        let step = {
            let mut registry = self.lock()?;
            match registry.by_fingerprint.get(&fingerprint).copied() {
                Some(id) => {
                    registry.touch(id);
                    let record = registry
                        .records
                        .get_mut(&id)
                        .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?;
                    record.ref_count += 1;
                    match &record.slot {
                        Slot::Live(session) => Step::Existing(Arc::clone(session), record.ref_count),
                        Slot::Starting(rx) => Step::Wait(id, rx.clone()),
                    }
                }
                None => {
                    let id = SessionId::next();
                    let (tx, rx) = watch::channel(None);
                    registry.records.insert(
                        id,
                        SessionRecord {
                            fingerprint: fingerprint.clone(),
                            ref_count: 1,
                            touched: Instant::now(),
                            slot: Slot::Starting(rx),
                        },
                    );
                    registry.by_fingerprint.insert(fingerprint.clone(), id);
                    registry.last_touched = Some(id);
                    Step::Create(id, tx)
                }
            }
        };

        match step {
            Step::Existing(session, ref_count) => {
                info!(session_id = %session.id(), %fingerprint, ref_count, "Reusing session");
                Ok(Acquired {
                    id: session.id(),
                    info: session.info(ref_count),
                    session,
                    is_new: false,
                })
            }
            Step::Wait(id, rx) => {
                debug!(session_id = %id, %fingerprint, "Waiting for session start");
                let session = wait_for_start(id, rx).await?;
                let ref_count = self.ref_count(id)?;
                Ok(Acquired {
                    id,
                    info: session.info(ref_count),
                    session,
                    is_new: false,
                })
            }
            Step::Create(id, tx) => {
                let seed = SessionSeed {
                    id,
                    // A session being torn down may still own the previous directory.
                    workdir: self
                        .config
                        .workdir_root
                        .join(fingerprint.as_str())
                        .join(id.to_string()),
                    fingerprint: fingerprint.clone(),
                    locator,
                    options,
                    enabled: self.config.enabled_engines.clone(),
                    start_timeout: self.config.start_timeout,
                };
                info!(session_id = %id, %fingerprint, "Starting new session");

                // Detached so a dropped caller cannot strand a Starting record.
                let task = tokio::spawn(Self::create(
                    Arc::clone(&self.registry),
                    Arc::clone(&self.factory),
                    Arc::clone(&self.config),
                    seed,
                    tx,
                ));
                let session = task
                    .await
                    .map_err(|e| RelayError::EngineStart(format!("start task failed: {}", e)))??;

                let ref_count = self.ref_count(id)?;
                Ok(Acquired {
                    id,
                    info: session.info(ref_count),
                    session,
                    is_new: true,
                })
            }
        }
    }

    async fn create(
        registry: Arc<Mutex<Registry>>,
        factory: Arc<dyn EngineFactory>,
        config: Arc<ManagerConfig>,
        seed: SessionSeed,
        tx: watch::Sender<Option<StartOutcome>>,
    ) -> Result<Arc<UnifiedSession>> {
        let id = seed.id;
        let result = UnifiedSession::start(
            seed,
            factory.as_ref(),
            config.session.clone(),
            config.store,
        )
        .await;

        let mut guard = registry.lock().map_err(|_| RelayError::LockPoisoned)?;
        match result {
            Ok(session) => {
                let session = Arc::new(session);
                if let Some(record) = guard.records.get_mut(&id) {
                    record.slot = Slot::Live(Arc::clone(&session));
                }
                drop(guard);
                let _ = tx.send(Some(StartOutcome::Ready(Arc::clone(&session))));
                info!(session_id = %id, "Session ready");
                Ok(session)
            }
            Err(e) => {
                guard.remove(id);
                drop(guard);
                error!(session_id = %id, error = %e, "Session failed to start");
                let _ = tx.send(Some(StartOutcome::Failed(e.to_string())));
                Err(e)
            }
        }
    }

    /// Drop one reference. The last release closes the session.
    ///
    /// Returns the remaining reference count.
    pub async fn release(&self, id: SessionId) -> Result<usize> {
        let closing = {
            let mut registry = self.lock()?;
            let record = registry
                .records
                .get_mut(&id)
                .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?;
            if let Slot::Starting(_) = record.slot {
                return Err(RelayError::SessionStarting(id.to_string()));
            }

            record.ref_count = record.ref_count.saturating_sub(1);
            if record.ref_count > 0 {
                debug!(session_id = %id, ref_count = record.ref_count, "Session released");
                return Ok(record.ref_count);
            }

            match registry.remove(id).map(|r| r.slot) {
                Some(Slot::Live(session)) => session,
                _ => return Ok(0),
            }
        };

        info!(session_id = %id, "Last reference released, closing session");
        closing.close(self.config.cleanup_workdir_on_close).await;
        Ok(0)
    }

    /// The named session, or the most recently used one.
    pub fn resolve(&self, id: Option<SessionId>) -> Result<Arc<UnifiedSession>> {
        let mut registry = self.lock()?;
        let id = match id {
            Some(id) => id,
            None => registry.last_touched.ok_or(RelayError::NoActiveSession)?,
        };

        let session = match registry.records.get(&id).map(|r| &r.slot) {
            Some(Slot::Live(session)) => Arc::clone(session),
            Some(Slot::Starting(_)) => return Err(RelayError::SessionStarting(id.to_string())),
            None => return Err(RelayError::SessionNotFound(id.to_string())),
        };
        registry.touch(id);
        Ok(session)
    }

    pub fn ref_count(&self, id: SessionId) -> Result<usize> {
        self.lock()?
            .records
            .get(&id)
            .map(|r| r.ref_count)
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))
    }

    pub fn info(&self, id: SessionId) -> Result<SessionInfo> {
        let (session, ref_count) = {
            let registry = self.lock()?;
            match registry.records.get(&id) {
                Some(SessionRecord {
                    slot: Slot::Live(session),
                    ref_count,
                    ..
                }) => (Arc::clone(session), *ref_count),
                Some(_) => return Err(RelayError::SessionStarting(id.to_string())),
                None => return Err(RelayError::SessionNotFound(id.to_string())),
            }
        };
        Ok(session.info(ref_count))
    }

    /// Ready sessions, by id.
    pub fn list(&self) -> Result<Vec<SessionInfo>> {
        let live: Vec<(Arc<UnifiedSession>, usize)> = {
            let registry = self.lock()?;
            registry
                .records
                .values()
                .filter_map(|r| match &r.slot {
                    Slot::Live(s) => Some((Arc::clone(s), r.ref_count)),
                    Slot::Starting(_) => None,
                })
                .collect()
        };
        let mut infos: Vec<SessionInfo> = live.iter().map(|(s, n)| s.info(*n)).collect();
        infos.sort_by_key(|i| i.id);
        Ok(infos)
    }

    pub fn len(&self) -> usize {
        self.registry.lock().map(|r| r.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every live session regardless of reference count.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<UnifiedSession>> = match self.registry.lock() {
            Ok(mut registry) => {
                let ids: Vec<SessionId> = registry
                    .records
                    .iter()
                    .filter(|(_, r)| matches!(r.slot, Slot::Live(_)))
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| registry.remove(id))
                    .filter_map(|r| match r.slot {
                        Slot::Live(s) => Some(s),
                        Slot::Starting(_) => None,
                    })
                    .collect()
            }
            Err(_) => {
                warn!("Session registry poisoned during shutdown");
                return;
            }
        };

        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Closing all sessions");
        let cleanup = self.config.cleanup_workdir_on_close;
        join_all(sessions.iter().map(|s| s.close(cleanup))).await;
    }
}

async fn wait_for_start(
    id: SessionId,
    mut rx: watch::Receiver<Option<StartOutcome>>,
) -> Result<Arc<UnifiedSession>> {
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| RelayError::EngineStart(format!("start of {} was abandoned", id)))?
        .clone();

    match outcome {
        Some(StartOutcome::Ready(session)) => Ok(session),
        Some(StartOutcome::Failed(reason)) => Err(RelayError::EngineStart(reason)),
        None => Err(RelayError::SessionNotFound(id.to_string())),
    }
}
