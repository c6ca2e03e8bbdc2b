//! Dump identity used to deduplicate sessions.
//!
//! Local dumps are identified by a SHA-256 of a bounded prefix of their
//! content. Two dumps that only differ past the prefix collide; the bound is
//! configurable (`fingerprint_prefix_bytes`) and defaults to 64 MiB.
//!
//! Remote dumps would need to be transferred to be hashed. The default
//! [`RemoteFingerprintPolicy::Surrogate`] instead hashes `host|path|size|mtime`
//! as reported by the remote host. [`RemoteFingerprintPolicy::PrefixRead`]
//! streams the bounded prefix over ssh and hashes it like a local file.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, warn};

/// Hex characters kept from the digest.
const FINGERPRINT_LEN: usize = 16;

/// Default number of dump bytes hashed.
pub const DEFAULT_PREFIX_BYTES: u64 = 64 * 1024 * 1024;

/// A host reachable over ssh that holds the dump.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    pub host: String,
    pub user: Option<String>,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// `user@host`, or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Where a session's dump (and its symbols) live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocator {
    pub dump_path: PathBuf,
    pub symbols_path: Option<PathBuf>,
    pub remote: Option<RemoteTarget>,
}

impl ArtifactLocator {
    pub fn local(dump_path: impl Into<PathBuf>) -> Self {
        Self {
            dump_path: dump_path.into(),
            symbols_path: None,
            remote: None,
        }
    }

    pub fn remote(dump_path: impl Into<PathBuf>, target: RemoteTarget) -> Self {
        Self {
            dump_path: dump_path.into(),
            symbols_path: None,
            remote: Some(target),
        }
    }

    pub fn with_symbols(mut self, symbols_path: impl Into<PathBuf>) -> Self {
        self.symbols_path = Some(symbols_path.into());
        self
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }
}

/// Stable identity of a dump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    fn from_digest(hasher: Sha256) -> Self {
        let mut hex = format!("{:x}", hasher.finalize());
        hex.truncate(FINGERPRINT_LEN);
        Self(hex)
    }

    fn of_text(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self::from_digest(hasher)
    }

    fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_digest(hasher)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How remote dumps are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFingerprintPolicy {
    /// Hash of `host|path|size|mtime`. No dump content crosses the network.
    #[default]
    Surrogate,
    /// Hash of the bounded content prefix, read over ssh.
    PrefixRead,
}

impl FromStr for RemoteFingerprintPolicy {
    type Err = crate::error::RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "surrogate" => Ok(Self::Surrogate),
            "prefix_read" => Ok(Self::PrefixRead),
            other => Err(crate::error::RelayError::InvalidArgument(format!(
                "unknown remote fingerprint policy '{}'",
                other
            ))),
        }
    }
}

/// Size and modification time of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub mtime: i64,
}

/// Remote file metadata and content access.
#[async_trait]
pub trait RemoteProbe: Send + Sync {
    async fn stat(&self, target: &RemoteTarget, path: &Path) -> std::io::Result<RemoteStat>;

    async fn read_prefix(
        &self,
        target: &RemoteTarget,
        path: &Path,
        limit: u64,
    ) -> std::io::Result<Vec<u8>>;
}

/// [`RemoteProbe`] backed by the system `ssh` client.
#[derive(Debug, Clone, Default)]
pub struct SshProbe {
    ssh_key: Option<PathBuf>,
}

impl SshProbe {
    pub fn new(ssh_key: Option<PathBuf>) -> Self {
        Self { ssh_key }
    }

    async fn run(&self, target: &RemoteTarget, remote_command: String) -> std::io::Result<Vec<u8>> {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "StrictHostKeyChecking=no", "-o", "BatchMode=yes"]);
        if let Some(key) = &self.ssh_key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(target.destination()).arg(&remote_command);
        cmd.kill_on_drop(true);

        debug!(host = %target.host, command = %remote_command, "Running remote probe");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "ssh {} exited with {}: {}",
                target.destination(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

fn quote_path(path: &Path) -> std::io::Result<String> {
    let raw = path.to_string_lossy();
    shlex::try_quote(&raw)
        .map(|q| q.into_owned())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))
}

#[async_trait]
impl RemoteProbe for SshProbe {
    async fn stat(&self, target: &RemoteTarget, path: &Path) -> std::io::Result<RemoteStat> {
        let out = self
            .run(target, format!("stat -L -c '%s %Y' {}", quote_path(path)?))
            .await?;
        let text = String::from_utf8_lossy(&out);
        parse_stat(&text).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected stat output: {}", text.trim()),
            )
        })
    }

    async fn read_prefix(
        &self,
        target: &RemoteTarget,
        path: &Path,
        limit: u64,
    ) -> std::io::Result<Vec<u8>> {
        self.run(target, format!("head -c {} {}", limit, quote_path(path)?))
            .await
    }
}

fn parse_stat(text: &str) -> Option<RemoteStat> {
    let mut parts = text.split_whitespace();
    let size = parts.next()?.parse().ok()?;
    let mtime = parts.next()?.parse().ok()?;
    Some(RemoteStat { size, mtime })
}

/// Computes [`Fingerprint`]s according to the configured policy.
#[derive(Clone)]
pub struct Fingerprinter {
    prefix_bytes: u64,
    remote_policy: RemoteFingerprintPolicy,
    probe: Arc<dyn RemoteProbe>,
}

impl Fingerprinter {
    pub fn new(
        prefix_bytes: u64,
        remote_policy: RemoteFingerprintPolicy,
        probe: Arc<dyn RemoteProbe>,
    ) -> Self {
        Self {
            prefix_bytes: prefix_bytes.max(1),
            remote_policy,
            probe,
        }
    }

    /// Identify the dump behind `locator`. Never fails: unreadable dumps fall
    /// back to a hash of their location.
    pub async fn compute(&self, locator: &ArtifactLocator) -> Fingerprint {
        match &locator.remote {
            None => {
                let path = locator.dump_path.clone();
                let limit = self.prefix_bytes;
                match tokio::task::spawn_blocking(move || hash_local_prefix(&path, limit)).await {
                    Ok(Ok(fp)) => fp,
                    Ok(Err(e)) => {
                        warn!(
                            path = %locator.dump_path.display(),
                            error = %e,
                            "Cannot read dump for fingerprinting, using path hash"
                        );
                        Self::location_hash(locator)
                    }
                    Err(e) => {
                        warn!(error = %e, "Fingerprint task failed, using path hash");
                        Self::location_hash(locator)
                    }
                }
            }
            Some(target) => match self.compute_remote(target, &locator.dump_path).await {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(
                        host = %target.host,
                        path = %locator.dump_path.display(),
                        error = %e,
                        "Remote fingerprint failed, using path hash"
                    );
                    Self::location_hash(locator)
                }
            },
        }
    }

    async fn compute_remote(
        &self,
        target: &RemoteTarget,
        path: &Path,
    ) -> std::io::Result<Fingerprint> {
        match self.remote_policy {
            RemoteFingerprintPolicy::Surrogate => {
                let stat = self.probe.stat(target, path).await?;
                Ok(Fingerprint::of_text(&format!(
                    "{}|{}|{}|{}",
                    target.host,
                    path.display(),
                    stat.size,
                    stat.mtime
                )))
            }
            RemoteFingerprintPolicy::PrefixRead => {
                let mut bytes = self.probe.read_prefix(target, path, self.prefix_bytes).await?;
                bytes.truncate(self.prefix_bytes as usize);
                Ok(Fingerprint::of_bytes(&bytes))
            }
        }
    }

    fn location_hash(locator: &ArtifactLocator) -> Fingerprint {
        let host = locator.remote.as_ref().map(|r| r.host.as_str()).unwrap_or("");
        Fingerprint::of_text(&format!("{}:{}", host, locator.dump_path.display()))
    }
}

fn hash_local_prefix(path: &Path, limit: u64) -> std::io::Result<Fingerprint> {
    let file = std::fs::File::open(path)?;
    let mut reader = file.take(limit);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Fingerprint::from_digest(hasher))
}
