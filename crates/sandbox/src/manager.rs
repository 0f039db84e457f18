//! Per-owner facade over the engine, exec channel, terminals and files.
//!
//! Transports talk to the `SandboxManager` with an owner id; it resolves
//! the owner's sandbox and routes the call. Only [`init_project`]
//! provisions: every other operation on an owner without a sandbox fails
//! with `SandboxNotFound`.
//!
//! [`init_project`]: SandboxManager::init_project

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cloudrepl_core::config::SandboxConfig;
use cloudrepl_core::policy::resolve_sandbox_path;
use cloudrepl_core::{ExecId, ExecStatus, IdentityStore, OutputSink, OwnerId, Result, SandboxId};

use crate::backend::SandboxBackend;
use crate::engine::{Sandbox, SandboxEngine, StopAllReport};
use crate::exec::{ExecChannel, ExecRequest};
use crate::files::{FileEntry, FileOps};
use crate::interactive::{InteractiveBridge, InteractiveHandle, SessionState};

pub struct SandboxManager {
    identity: Arc<dyn IdentityStore>,
    engine: Arc<SandboxEngine>,
    exec: ExecChannel,
    files: FileOps,
    terminals: InteractiveBridge,
    workdir: String,
}

impl SandboxManager {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        identity: Arc<dyn IdentityStore>,
        config: SandboxConfig,
    ) -> Self {
        let workdir = config.container_workdir.clone();
        let exec = ExecChannel::new(backend.clone()).with_workdir(workdir.clone());
        let terminals = InteractiveBridge::new(backend.clone(), config.interactive_cmd.clone())
            .with_workdir(workdir.clone());
        let engine = Arc::new(SandboxEngine::new(backend, config));

        Self {
            identity,
            engine,
            files: FileOps::new(exec.clone()),
            exec,
            terminals,
            workdir,
        }
    }

    pub fn engine(&self) -> &Arc<SandboxEngine> {
        &self.engine
    }

    pub fn terminals(&self) -> &InteractiveBridge {
        &self.terminals
    }

    /// Check the identity store, then return the owner's running sandbox,
    /// creating it if needed.
    pub async fn init_project(&self, owner: &OwnerId, cancel: &CancellationToken) -> Result<Sandbox> {
        let user = self.identity.find_user(owner).await?;
        tracing::debug!(owner_id = %user.id, "Identity confirmed");
        self.engine.ensure_sandbox(owner, cancel).await
    }

    pub fn sandbox_for(&self, owner: &OwnerId) -> Result<SandboxId> {
        self.engine.resolve(owner)
    }

    fn path(&self, input: &str) -> Result<String> {
        resolve_sandbox_path(&self.workdir, input)
    }

    pub async fn exec(
        &self,
        owner: &OwnerId,
        request: &ExecRequest,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let sandbox = self.sandbox_for(owner)?;
        self.exec.execute(&sandbox, request, sink, cancel).await
    }

    /// Start a long-running process (a dev server, a watcher) in the
    /// owner's sandbox and return its exec id without waiting for it.
    pub async fn spawn_process(
        &self,
        owner: &OwnerId,
        request: &ExecRequest,
        sink: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecId> {
        let sandbox = self.sandbox_for(owner)?;
        self.exec.spawn_detached(&sandbox, request, sink, cancel).await
    }

    /// Stop relaying output of a process started by
    /// [`spawn_process`](Self::spawn_process).
    pub fn stop_process(&self, exec: &ExecId) -> bool {
        self.exec.stop_detached(exec)
    }

    pub async fn write_file(
        &self,
        owner: &OwnerId,
        path: &str,
        content: &[u8],
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let sandbox = self.sandbox_for(owner)?;
        let path = self.path(path)?;
        self.files.write_file(&sandbox, &path, content, sink, cancel).await
    }

    pub async fn read_file(
        &self,
        owner: &OwnerId,
        path: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let sandbox = self.sandbox_for(owner)?;
        let path = self.path(path)?;
        self.files.read_file(&sandbox, &path, sink, cancel).await
    }

    pub async fn remove_file(
        &self,
        owner: &OwnerId,
        path: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let sandbox = self.sandbox_for(owner)?;
        let path = self.path(path)?;
        self.files.remove_file(&sandbox, &path, sink, cancel).await
    }

    pub async fn create_dir(
        &self,
        owner: &OwnerId,
        path: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let sandbox = self.sandbox_for(owner)?;
        let path = self.path(path)?;
        self.files.create_dir(&sandbox, &path, sink, cancel).await
    }

    pub async fn search_in_file(
        &self,
        owner: &OwnerId,
        path: &str,
        term: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let sandbox = self.sandbox_for(owner)?;
        let path = self.path(path)?;
        self.files
            .search_in_file(&sandbox, &path, term, sink, cancel)
            .await
    }

    pub async fn rename(
        &self,
        owner: &OwnerId,
        from: &str,
        to: &str,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let sandbox = self.sandbox_for(owner)?;
        let from = self.path(from)?;
        let to = self.path(to)?;
        self.files.rename(&sandbox, &from, &to, sink, cancel).await
    }

    pub async fn list_files(
        &self,
        owner: &OwnerId,
        path: &str,
        stderr: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileEntry>> {
        let sandbox = self.sandbox_for(owner)?;
        let path = self.path(path)?;
        self.files.list_files(&sandbox, &path, stderr, cancel).await
    }

    pub async fn stat_file(
        &self,
        owner: &OwnerId,
        path: &str,
        stderr: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<FileEntry> {
        let sandbox = self.sandbox_for(owner)?;
        let path = self.path(path)?;
        self.files.stat_file(&sandbox, &path, stderr, cancel).await
    }

    pub async fn start_terminal(
        &self,
        owner: &OwnerId,
        input: mpsc::Receiver<Bytes>,
        output: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<InteractiveHandle> {
        let sandbox = self.sandbox_for(owner)?;
        self.terminals.start(&sandbox, input, output, cancel).await
    }

    /// Best-effort resize; `Ok(false)` when nothing was resized.
    pub async fn resize_terminal(&self, owner: &OwnerId, rows: u16, cols: u16) -> Result<bool> {
        let sandbox = self.sandbox_for(owner)?;
        Ok(self.terminals.resize(&sandbox, rows, cols).await)
    }

    pub fn stop_terminal(&self, owner: &OwnerId) -> Result<bool> {
        let sandbox = self.sandbox_for(owner)?;
        Ok(self.terminals.stop(&sandbox))
    }

    pub fn terminal_state(&self, owner: &OwnerId) -> Result<SessionState> {
        let sandbox = self.sandbox_for(owner)?;
        Ok(self.terminals.state(&sandbox))
    }

    /// Close the owner's terminal, drop their background relays and
    /// destroy their sandbox.
    pub async fn destroy(&self, owner: &OwnerId, cancel: &CancellationToken) -> Result<()> {
        let sandbox = self.sandbox_for(owner)?;
        self.terminals.stop(&sandbox);
        self.exec.stop_detached_in(Some(&sandbox));
        self.engine.destroy_sandbox(&sandbox, cancel).await
    }

    /// Close every terminal and background relay, then force-stop and
    /// remove every managed sandbox.
    pub async fn stop_all(&self, cancel: &CancellationToken) -> Result<StopAllReport> {
        self.terminals.stop_all();
        let relays = self.exec.stop_detached_in(None);
        tracing::debug!(relays, "Stopped background relays");
        self.engine.stop_all(cancel).await
    }
}
