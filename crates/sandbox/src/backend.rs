//! Container backend seam.
//!
//! `SandboxBackend` is the narrow set of container-engine calls the session
//! engine needs. [`DockerBackend`](crate::docker::DockerBackend) talks to a
//! real daemon through `bollard`; [`MockBackend`](crate::mock::MockBackend)
//! keeps everything in memory for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use cloudrepl_core::{ExecId, ResourceLimits, Result, SandboxId};

/// Label key put on every container the engine creates.
pub const MANAGED_BY_LABEL: &str = "managed-by";

/// Label key carrying the owner id.
pub const OWNER_LABEL: &str = "cloudrepl.owner";

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// Host directory bind-mounted at `workdir`.
    pub host_mount: PathBuf,
    pub workdir: String,
    pub limits: ResourceLimits,
    pub network_enabled: bool,
}

/// A process to start inside a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub tty: bool,
    /// Attach stdin so the caller can write to the process.
    pub attach_stdin: bool,
    pub workdir: Option<String>,
}

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Streams of an attached process.
///
/// `output` carries the multiplexed frame format when the process has no
/// TTY and raw terminal bytes when it does. Dropping `input` closes the
/// process's stdin.
pub struct ExecAttachment {
    pub output: BoxedReader,
    pub input: BoxedWriter,
}

impl std::fmt::Debug for ExecAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecAttachment").finish_non_exhaustive()
    }
}

/// Container engine operations used by the session engine.
///
/// Implementations map engine-specific failures onto the core error
/// taxonomy: a missing container is `SandboxNotFound`, an unreachable or
/// failing daemon is `EngineUnavailable`.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Check that the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Make sure `image` is present locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<SandboxId>;

    async fn start_container(&self, id: &SandboxId) -> Result<()>;

    /// Stop a container, killing it after `grace`. Stopping an already
    /// stopped container succeeds.
    async fn stop_container(&self, id: &SandboxId, grace: Duration) -> Result<()>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &SandboxId) -> Result<()>;

    /// Whether the container exists and is running. Unknown ids are `false`.
    async fn is_running(&self, id: &SandboxId) -> Result<bool>;

    /// Ids of every container carrying `managed-by=<label>`, running or not.
    async fn list_managed(&self, label: &str) -> Result<Vec<SandboxId>>;

    /// Create a process inside a running container.
    async fn create_exec(&self, id: &SandboxId, spec: &ExecSpec) -> Result<ExecId>;

    /// Start a created process and attach to its streams.
    async fn attach_exec(&self, exec: &ExecId, tty: bool) -> Result<ExecAttachment>;

    /// Resize the pseudo-terminal of a TTY process.
    async fn resize_exec(&self, exec: &ExecId, rows: u16, cols: u16) -> Result<()>;

    /// Exit code of a finished process, if the engine reports one.
    async fn exec_exit_code(&self, exec: &ExecId) -> Result<Option<i64>>;
}
