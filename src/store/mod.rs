//! Command Store: persisted, paginated, searchable command output.
//!
//! Every result lives in its own file under the session workdir and is
//! addressed by a deterministic identifier:
//!
//! ```text
//! <tag>:<sha256(command)[..8]>[@<sha256(context)[..6]>]
//! ```
//!
//! Files are written to a temporary name and renamed into place, so a
//! concurrent reader sees either the previous or the new content, never a
//! partial write. The in-memory index is guarded by an `RwLock`; readers
//! never wait on the session's execution lock.

mod page;

pub use page::{preview, Page, Preview, SearchMatch};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::RegexBuilder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::error::{RelayError, Result};
use crate::session::CommandContext;

/// Pagination limits.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    pub default_page_limit: usize,
    pub max_page_limit: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            default_page_limit: 50,
            max_page_limit: 500,
        }
    }
}

/// Build the identifier for `command` under `context`.
///
/// `context` is `Some` exactly when the command is context-sensitive; an
/// empty context still yields an `@` component.
pub fn command_id(engine: &str, command: &str, context: Option<&CommandContext>) -> String {
    let base = format!("{}:{}", engine, short_hash(command.trim(), 8));
    match context {
        Some(ctx) => format!("{}@{}", base, short_hash(&ctx.canonical(), 6)),
        None => base,
    }
}

fn short_hash(text: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(len);
    hex
}

/// Metadata of one stored result.
#[derive(Debug, Clone, Serialize)]
pub struct StoredResult {
    pub command_id: String,
    /// Route tag: `crash`, `pykdump` or `drgn`.
    pub engine: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<CommandContext>,
    pub total_lines: usize,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Error output is kept for paging but never served as a cache hit.
    pub is_error: bool,
    #[serde(skip)]
    file: PathBuf,
    #[serde(skip)]
    seq: u64,
}

/// A cache hit: metadata plus the full text.
#[derive(Debug, Clone)]
pub struct CachedOutput {
    pub result: StoredResult,
    pub text: String,
}

/// Extra attributes recorded with a result.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    pub is_error: bool,
    pub duration: Option<Duration>,
}

#[derive(Default)]
struct StoreIndex {
    results: HashMap<String, StoredResult>,
    /// File reserved for each identifier, so re-saves overwrite in place.
    files: HashMap<String, (u64, PathBuf)>,
    next_seq: u64,
}

/// Per-session result store rooted at the session workdir.
pub struct CommandStore {
    dir: PathBuf,
    settings: StoreSettings,
    index: RwLock<StoreIndex>,
    tmp_seq: AtomicU64,
}

impl CommandStore {
    /// Open a store in `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>, settings: StoreSettings) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!(workdir = %dir.display(), "Command store opened");
        Ok(Self {
            dir,
            settings,
            index: RwLock::new(StoreIndex::default()),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> StoreSettings {
        self.settings
    }

    /// Persist `text` and return its metadata.
    pub fn save(
        &self,
        engine: &str,
        command: &str,
        text: &str,
        context: Option<&CommandContext>,
    ) -> Result<StoredResult> {
        self.save_with(engine, command, text, context, SaveOptions::default())
    }

    pub fn save_with(
        &self,
        engine: &str,
        command: &str,
        text: &str,
        context: Option<&CommandContext>,
        options: SaveOptions,
    ) -> Result<StoredResult> {
        let id = command_id(engine, command, context);

        let (seq, file) = {
            let mut index = self.index.write().map_err(|_| RelayError::LockPoisoned)?;
            match index.files.get(&id) {
                Some(reserved) => reserved.clone(),
                None => {
                    index.next_seq += 1;
                    let seq = index.next_seq;
                    let name = format!("{:04}_{}_{}.txt", seq, engine, file_stem(command));
                    let reserved = (seq, self.dir.join(name));
                    index.files.insert(id.clone(), reserved.clone());
                    reserved
                }
            }
        };

        self.write_atomic(&file, text).map_err(|e| {
            error!(command_id = %id, error = %e, "Failed to persist command output");
            RelayError::Storage(e)
        })?;

        let result = StoredResult {
            command_id: id.clone(),
            engine: engine.to_string(),
            command: command.trim().to_string(),
            context: context.cloned(),
            total_lines: text.lines().count(),
            created_at: unix_now(),
            duration_ms: options.duration.map(|d| d.as_millis() as u64),
            is_error: options.is_error,
            file,
            seq,
        };

        self.index
            .write()
            .map_err(|_| RelayError::LockPoisoned)?
            .results
            .insert(id.clone(), result.clone());

        debug!(
            command_id = %id,
            lines = result.total_lines,
            file = %result.file.display(),
            "Saved command output"
        );
        Ok(result)
    }

    /// Pure lookup; never runs anything. Error results are not hits.
    pub fn get_cached(
        &self,
        engine: &str,
        command: &str,
        context: Option<&CommandContext>,
    ) -> Result<Option<CachedOutput>> {
        let id = command_id(engine, command, context);
        let result = match self.lookup(&id)? {
            Some(r) if !r.is_error => r,
            _ => return Ok(None),
        };
        let text = std::fs::read_to_string(&result.file)?;
        debug!(command_id = %id, "Cache hit");
        Ok(Some(CachedOutput { result, text }))
    }

    pub fn get_result(&self, command_id: &str) -> Result<StoredResult> {
        self.lookup(command_id)?
            .ok_or_else(|| RelayError::CommandNotFound(command_id.to_string()))
    }

    /// Full text of a stored result.
    pub fn read_text(&self, command_id: &str) -> Result<String> {
        let result = self.get_result(command_id)?;
        Ok(std::fs::read_to_string(&result.file)?)
    }

    /// Read a window of lines. `limit` defaults to the configured page size
    /// and is clamped to `[1, max_page_limit]`.
    pub fn get_lines(&self, command_id: &str, offset: i64, limit: Option<usize>) -> Result<Page> {
        if offset < 0 {
            return Err(RelayError::InvalidArgument(format!(
                "offset must be non-negative, got {}",
                offset
            )));
        }
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let limit = limit
            .unwrap_or(self.settings.default_page_limit)
            .clamp(1, self.settings.max_page_limit.max(1));

        let text = self.read_text(command_id)?;
        let lines: Vec<&str> = text.lines().collect();
        let (slice, returned_lines, has_more) = page::window(&lines, offset, limit);

        Ok(Page {
            command_id: command_id.to_string(),
            text: slice,
            offset,
            returned_lines,
            total_lines: lines.len(),
            has_more,
        })
    }

    /// Case-insensitive regex search with `context_lines` around each hit.
    pub fn search(
        &self,
        command_id: &str,
        pattern: &str,
        context_lines: usize,
    ) -> Result<Vec<SearchMatch>> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| RelayError::InvalidPattern(e.to_string()))?;

        let text = self.read_text(command_id)?;
        let lines: Vec<&str> = text.lines().collect();
        let matches = page::find_matches(&lines, &regex, context_lines);
        debug!(
            command_id = %command_id,
            pattern = %pattern,
            matches = matches.len(),
            "Searched command output"
        );
        Ok(matches)
    }

    /// All stored results, oldest first.
    pub fn list(&self) -> Result<Vec<StoredResult>> {
        let index = self.index.read().map_err(|_| RelayError::LockPoisoned)?;
        let mut results: Vec<StoredResult> = index.results.values().cloned().collect();
        results.sort_by_key(|r| r.seq);
        Ok(results)
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|i| i.results.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every result and delete the workdir contents.
    pub fn clear(&self) -> Result<()> {
        {
            let mut index = self.index.write().map_err(|_| RelayError::LockPoisoned)?;
            *index = StoreIndex::default();
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        debug!(workdir = %self.dir.display(), "Command store cleared");
        Ok(())
    }

    fn lookup(&self, command_id: &str) -> Result<Option<StoredResult>> {
        let index = self.index.read().map_err(|_| RelayError::LockPoisoned)?;
        Ok(index.results.get(command_id).cloned())
    }

    fn write_atomic(&self, target: &Path, text: &str) -> std::io::Result<()> {
        let n = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self.dir.join(format!(".{}.{}.tmp", name, n));
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, target).inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp);
        })
    }
}

/// Filename-safe first word of a command.
fn file_stem(command: &str) -> String {
    let word = command.split_whitespace().next().unwrap_or("cmd");
    let stem: String = word
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(20)
        .collect();
    if stem.is_empty() {
        "cmd".to_string()
    } else {
        stem
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
