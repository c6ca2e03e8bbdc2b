//! # dump-relay
//!
//! Session-caching relay in front of the `crash` and `drgn` kernel dump
//! debuggers, built for AI agents that issue many small queries.
//!
//! - **Deduplicated sessions**: clients opening the same dump share one set
//!   of engine processes, keyed by a content fingerprint and reference counted.
//! - **Unified routing**: `crash:`, `drgn:` and `pykdump:` prefixes pick the
//!   backend; unprefixed commands go to crash.
//! - **Command store**: every result is persisted per session, addressed by a
//!   deterministic id, and can be paged through or regex-searched later.
//! - **Context-aware cache**: commands that depend on the selected task are
//!   cached per context, so `set <pid>` never serves stale output.
//! - **Analysis scripts**: parameterised drgn scripts discovered on disk, and
//!   an optional external crash-info report stored alongside command output.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dump_relay::config::Config;
//! use dump_relay::engine::PtyEngineFactory;
//! use dump_relay::session::{ArtifactLocator, SessionManager, SessionOptions, SshProbe};
//!
//! #[tokio::main]
//! async fn main() -> dump_relay::Result<()> {
//!     dump_relay::logging::try_init(None).ok();
//!
//!     let config = Config::default();
//!     let manager = SessionManager::new(
//!         config.manager_config(),
//!         Arc::new(PtyEngineFactory::new(config.engine_settings())),
//!         config.fingerprinter(Arc::new(SshProbe::new(None))),
//!     );
//!
//!     let acquired = manager
//!         .acquire(ArtifactLocator::local("/var/crash/vmcore"), SessionOptions::default())
//!         .await?;
//!     let outcome = acquired.session.execute_with_store("bt -a", false).await?;
//!     println!("{}: {} lines", outcome.command_id, outcome.total_lines);
//!
//!     manager.release(acquired.id).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod output;
pub mod scripts;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use engine::{Engine, EngineFactory, EngineKind, Route};
pub use error::{RelayError, Result};
pub use output::OutputSanitizer;
pub use session::{
    ArtifactLocator, CommandContext, Fingerprint, SessionId, SessionManager, SessionState,
    UnifiedSession,
};
pub use store::{CommandStore, Page, SearchMatch};
