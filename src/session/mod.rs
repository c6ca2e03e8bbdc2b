//! Session management module.
//!
//! A session is one dump opened under one or both engines. The
//! [`SessionManager`] deduplicates sessions by [`Fingerprint`] and counts
//! references; each [`UnifiedSession`] routes commands to its engines and
//! fronts its own [`CommandStore`](crate::store::CommandStore).

mod context;
mod fingerprint;
mod id;
mod manager;
mod state;
mod unified;

pub use context::{CommandContext, ContextProbe};
pub use fingerprint::{
    ArtifactLocator, Fingerprint, Fingerprinter, RemoteFingerprintPolicy, RemoteProbe,
    RemoteStat, RemoteTarget, SshProbe, DEFAULT_PREFIX_BYTES,
};
pub use id::SessionId;
pub use manager::{Acquired, ManagerConfig, SessionManager};
pub use state::SessionState;
pub use unified::{CommandOutcome, SessionInfo, SessionOptions, SessionSettings, UnifiedSession};
