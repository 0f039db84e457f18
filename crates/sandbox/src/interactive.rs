//! Interactive terminal sessions.
//!
//! Each sandbox has at most one attached shell. A session relays client
//! keystrokes into the shell's stdin and the shell's terminal output back to
//! the client; whichever relay stops first ends the session.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use cloudrepl_core::{Error, ExecId, OutputSink, Result, SandboxId, StreamKind};

use crate::backend::{BoxedReader, BoxedWriter, ExecSpec, SandboxBackend};
use crate::exec::cancellable;

/// Upper bound on engine calls made outside of a relay (resize, exit code).
const ENGINE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a session: `Idle → Attached → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Attached,
    Closed,
}

struct SessionSlot {
    exec: OnceLock<ExecId>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

type Sessions = Arc<DashMap<SandboxId, Arc<SessionSlot>>>;

/// Handle to a running session.
#[derive(Debug)]
pub struct InteractiveHandle {
    sandbox: SandboxId,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

impl InteractiveHandle {
    pub fn sandbox(&self) -> &SandboxId {
        &self.sandbox
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Close the session. Both relays stop; waiting for `Closed` is
    /// done through [`wait`](Self::wait).
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session has closed.
    pub async fn wait(&mut self) -> SessionState {
        let _ = self
            .state
            .wait_for(|state| *state == SessionState::Closed)
            .await;
        SessionState::Closed
    }
}

/// Owner of every interactive session.
#[derive(Clone)]
pub struct InteractiveBridge {
    backend: Arc<dyn SandboxBackend>,
    sessions: Sessions,
    shell: Vec<String>,
    workdir: Option<String>,
    call_timeout: Duration,
}

impl InteractiveBridge {
    /// `shell` is the argv started for every session, e.g. `["sh"]`.
    pub fn new(backend: Arc<dyn SandboxBackend>, shell: Vec<String>) -> Self {
        Self {
            backend,
            sessions: Arc::new(DashMap::new()),
            shell,
            workdir: None,
            call_timeout: ENGINE_CALL_TIMEOUT,
        }
    }

    /// Give up on a resize or exit-code lookup after `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Attach a new shell to `sandbox`.
    ///
    /// `input` feeds the shell's stdin; terminal output goes to `output`.
    /// Fails with `AlreadyAttached` when a session is live, leaving it
    /// untouched. The session ends when `cancel` fires, when the input
    /// channel closes, or when the shell exits; a non-zero exit is
    /// reported once through `output`.
    pub async fn start(
        &self,
        sandbox: &SandboxId,
        input: mpsc::Receiver<Bytes>,
        output: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<InteractiveHandle> {
        if self.shell.is_empty() {
            return Err(Error::invalid_request("interactive command is empty"));
        }

        let session_cancel = cancel.child_token();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let slot = Arc::new(SessionSlot {
            exec: OnceLock::new(),
            cancel: session_cancel.clone(),
            state: state_tx,
        });

        match self.sessions.entry(sandbox.clone()) {
            Entry::Occupied(_) => {
                metrics::counter!("sandbox_interactive_sessions_total", "outcome" => "rejected")
                    .increment(1);
                tracing::debug!(sandbox_id = %sandbox, "Interactive session already attached");
                return Err(Error::AlreadyAttached(sandbox.to_string()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot.clone());
            }
        }

        let attached = cancellable(&session_cancel, "interactive attach", self.attach(sandbox)).await;
        let (exec, output_stream, input_stream) = match attached {
            Ok(parts) => parts,
            Err(e) => {
                release(&self.sessions, sandbox, &slot);
                let _ = slot.state.send(SessionState::Closed);
                metrics::counter!("sandbox_interactive_sessions_total", "outcome" => "failed")
                    .increment(1);
                return Err(e);
            }
        };

        let _ = slot.exec.set(exec.clone());
        let _ = slot.state.send(SessionState::Attached);
        metrics::counter!("sandbox_interactive_sessions_total", "outcome" => "started").increment(1);
        tracing::info!(sandbox_id = %sandbox, exec_id = %exec, "Interactive session attached");

        tokio::spawn(run_session(
            self.backend.clone(),
            self.sessions.clone(),
            sandbox.clone(),
            slot,
            exec,
            input,
            input_stream,
            output_stream,
            output,
            self.call_timeout,
        ));

        Ok(InteractiveHandle {
            sandbox: sandbox.clone(),
            cancel: session_cancel,
            state: state_rx,
        })
    }

    async fn attach(&self, sandbox: &SandboxId) -> Result<(ExecId, BoxedReader, BoxedWriter)> {
        let spec = ExecSpec {
            argv: self.shell.clone(),
            tty: true,
            attach_stdin: true,
            workdir: self.workdir.clone(),
        };
        let exec = self.backend.create_exec(sandbox, &spec).await?;
        let attachment = self.backend.attach_exec(&exec, true).await?;
        Ok((exec, attachment.output, attachment.input))
    }

    /// Resize the attached terminal.
    ///
    /// Best-effort: returns `false` when no session is attached or the
    /// engine rejected the resize, which is logged and otherwise ignored.
    pub async fn resize(&self, sandbox: &SandboxId, rows: u16, cols: u16) -> bool {
        let exec = self
            .sessions
            .get(sandbox)
            .filter(|slot| *slot.state.borrow() == SessionState::Attached)
            .and_then(|slot| slot.exec.get().cloned());

        let Some(exec) = exec else {
            tracing::debug!(sandbox_id = %sandbox, "Resize ignored, no attached session");
            return false;
        };

        match tokio::time::timeout(self.call_timeout, self.backend.resize_exec(&exec, rows, cols)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(sandbox_id = %sandbox, rows, cols, error = %e, "Terminal resize failed");
                false
            }
            Err(_) => {
                tracing::warn!(sandbox_id = %sandbox, rows, cols, "Terminal resize timed out");
                false
            }
        }
    }

    /// Close the session on `sandbox`, if any. Returns whether one existed.
    pub fn stop(&self, sandbox: &SandboxId) -> bool {
        match self.sessions.get(sandbox) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Close every session.
    pub fn stop_all(&self) {
        for slot in self.sessions.iter() {
            slot.cancel.cancel();
        }
    }

    pub fn state(&self, sandbox: &SandboxId) -> SessionState {
        self.sessions
            .get(sandbox)
            .map(|slot| *slot.state.borrow())
            .unwrap_or(SessionState::Idle)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// Remove `slot` from the session map if it is still the registered one.
fn release(sessions: &Sessions, sandbox: &SandboxId, slot: &Arc<SessionSlot>) {
    sessions.remove_if(sandbox, |_, current| Arc::ptr_eq(current, slot));
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    backend: Arc<dyn SandboxBackend>,
    sessions: Sessions,
    sandbox: SandboxId,
    slot: Arc<SessionSlot>,
    exec: ExecId,
    input: mpsc::Receiver<Bytes>,
    stdin: BoxedWriter,
    stdout: BoxedReader,
    output: Arc<dyn OutputSink>,
    call_timeout: Duration,
) {
    // Dropping the losing relay closes its half of the attachment.
    let reason = tokio::select! {
        reason = relay_input(input, stdin) => reason,
        reason = relay_output(stdout, output.as_ref()) => reason,
        _ = slot.cancel.cancelled() => "session closed",
    };
    slot.cancel.cancel();
    tracing::debug!(sandbox_id = %sandbox, reason, "Interactive relays stopped");

    let exit_code = tokio::time::timeout(call_timeout, backend.exec_exit_code(&exec))
        .await
        .unwrap_or_else(|_| Err(Error::stream("timed out waiting for exit code")));
    match exit_code {
        Ok(Some(code)) if code != 0 => {
            let notice = format!("process exited with code {}\n", code);
            if let Err(e) = output.write(StreamKind::Stdout, Bytes::from(notice)).await {
                tracing::debug!(sandbox_id = %sandbox, error = %e, "Could not report exit code");
            }
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(sandbox_id = %sandbox, error = %e, "Exit code unavailable");
        }
    }

    let _ = slot.state.send(SessionState::Closed);
    release(&sessions, &sandbox, &slot);
    tracing::info!(sandbox_id = %sandbox, exec_id = %exec, "Interactive session closed");
}

async fn relay_input(mut input: mpsc::Receiver<Bytes>, mut stdin: BoxedWriter) -> &'static str {
    while let Some(chunk) = input.recv().await {
        if stdin.write_all(&chunk).await.is_err() || stdin.flush().await.is_err() {
            return "stdin closed";
        }
    }
    let _ = stdin.shutdown().await;
    "input channel closed"
}

async fn relay_output(stdout: BoxedReader, output: &dyn OutputSink) -> &'static str {
    let mut chunks = ReaderStream::new(stdout);
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => {
                if output.write(StreamKind::Stdout, chunk).await.is_err() {
                    return "output sink closed";
                }
            }
            Err(_) => return "terminal stream error",
        }
    }
    "process output ended"
}
