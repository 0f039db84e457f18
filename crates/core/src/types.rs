//! Shared domain types.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identity of the user that owns a sandbox.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-assigned identifier of a sandbox (the container id).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SandboxId(pub String);

impl SandboxId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-assigned identifier of a process started inside a sandbox.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecId(pub String);

impl std::fmt::Display for ExecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which process stream a chunk of output came from.
///
/// TTY-attached processes only ever produce `Stdout`, since the engine
/// does not separate the streams once a pseudo-terminal is allocated.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A known user, as returned by the identity store.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: OwnerId,
    pub email: Option<String>,
}

/// Container resource limits.
///
/// Values are passed to the engine unchanged; `cpu_quota_micros == 0`
/// and `cpu_shares == 0` mean "engine default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub cpu_quota_micros: i64,
    pub cpu_period_micros: i64,
}

/// Smallest memory limit the container engine accepts.
pub const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;

impl ResourceLimits {
    /// Check the limits against what the engine will accept.
    pub fn validate(&self) -> Result<()> {
        if self.memory_bytes < MIN_MEMORY_BYTES {
            return Err(Error::resource_limit(format!(
                "memory_bytes must be at least {} (got {})",
                MIN_MEMORY_BYTES, self.memory_bytes
            )));
        }
        if self.cpu_shares < 0 {
            return Err(Error::resource_limit(format!(
                "cpu_shares must not be negative (got {})",
                self.cpu_shares
            )));
        }
        if !(1_000..=1_000_000).contains(&self.cpu_period_micros) {
            return Err(Error::resource_limit(format!(
                "cpu_period_micros must be between 1000 and 1000000 (got {})",
                self.cpu_period_micros
            )));
        }
        if self.cpu_quota_micros != 0 && self.cpu_quota_micros < 1_000 {
            return Err(Error::resource_limit(format!(
                "cpu_quota_micros must be 0 or at least 1000 (got {})",
                self.cpu_quota_micros
            )));
        }
        Ok(())
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024, // 512MB
            cpu_shares: 512,
            cpu_quota_micros: 100_000, // 1 CPU core
            cpu_period_micros: 100_000,
        }
    }
}

/// Completion status of a one-shot command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStatus {
    /// Exit code, if the engine reported one.
    pub exit_code: Option<i64>,
}

impl ExecStatus {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}
