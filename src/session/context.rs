//! Implicit engine state folded into cache keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Snapshot of session-implicit engine state (selected task, cpu, ...).
///
/// Keys are kept sorted so the canonical form, and therefore the cache key
/// derived from it, does not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CommandContext {
    values: BTreeMap<String, String>,
}

impl CommandContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Canonical `k=v,k=v` form used for hashing.
    pub fn canonical(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Parsers for engine output that reveals the current context.
pub struct ContextProbe;

impl ContextProbe {
    /// Read-only crash command that prints the current context.
    pub fn crash_query() -> &'static str {
        "set"
    }

    /// Parse crash `set` output.
    ///
    /// Lines look like `    PID: 1234` / `    CPU: 0` (older builds use lower
    /// case). A cpu of `-1` means "any cpu" and is left out.
    pub fn parse_crash_set(output: &str) -> CommandContext {
        let mut ctx = CommandContext::new();

        for line in output.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            let Some(first) = value.split_whitespace().next() else {
                continue;
            };

            match key.as_str() {
                "pid" if first.parse::<u64>().is_ok() => ctx.set("pid", first),
                "cpu" if first.parse::<i64>().is_ok() && first != "-1" => ctx.set("cpu", first),
                _ => {}
            }
        }

        ctx
    }
}
