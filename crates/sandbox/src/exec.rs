//! One-shot command execution inside a sandbox.

use dashmap::DashMap;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::codec::FramedRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use cloudrepl_core::{Error, ExecId, ExecStatus, OutputSink, Result, SandboxId, StreamKind};

use crate::backend::{BoxedReader, ExecSpec, SandboxBackend};
use crate::codec::FrameCodec;

/// A command to run: discrete argv elements, never a joined shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub tty: bool,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            tty: false,
        }
    }

    /// Allocate a pseudo-terminal; output then arrives raw, as stdout only.
    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }
}

/// How long a finished process gets to report its exit code.
const EXIT_CODE_TIMEOUT: Duration = Duration::from_secs(10);

struct Detached {
    sandbox: SandboxId,
    stop: CancellationToken,
}

/// Runs processes and relays their output, either to completion or in the
/// background.
///
/// Clones share the table of background processes.
#[derive(Clone)]
pub struct ExecChannel {
    backend: Arc<dyn SandboxBackend>,
    workdir: Option<String>,
    detached: Arc<DashMap<ExecId, Detached>>,
}

impl ExecChannel {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            workdir: None,
            detached: Arc::new(DashMap::new()),
        }
    }

    /// Run every command from `workdir` inside the container.
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Run `request` in `sandbox`, streaming output to `sink` until the
    /// process closes its output.
    ///
    /// With no sink the output is drained and discarded. Cancelling
    /// `cancel` abandons the attachment and returns `Error::Cancelled`.
    pub async fn execute(
        &self,
        sandbox: &SandboxId,
        request: &ExecRequest,
        sink: Option<&dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        if request.argv.is_empty() {
            return Err(Error::invalid_request("argv must not be empty"));
        }

        let started = Instant::now();
        let result = cancellable(cancel, "exec", self.run(sandbox, request, sink)).await;

        let outcome = match &result {
            Ok(status) if status.success() => "success",
            Ok(_) => "failure",
            Err(Error::Cancelled(_)) => "cancelled",
            Err(_) => "error",
        };
        metrics::counter!("sandbox_exec_total", "outcome" => outcome).increment(1);
        metrics::histogram!("sandbox_exec_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(status) => tracing::debug!(
                sandbox_id = %sandbox,
                program = %request.argv[0],
                exit_code = ?status.exit_code,
                "Exec finished"
            ),
            Err(e) => tracing::debug!(
                sandbox_id = %sandbox,
                program = %request.argv[0],
                error = %e,
                "Exec failed"
            ),
        }

        result
    }

    async fn run(
        &self,
        sandbox: &SandboxId,
        request: &ExecRequest,
        sink: Option<&dyn OutputSink>,
    ) -> Result<ExecStatus> {
        let spec = ExecSpec {
            argv: request.argv.clone(),
            tty: request.tty,
            attach_stdin: false,
            workdir: self.workdir.clone(),
        };
        let exec = self.backend.create_exec(sandbox, &spec).await?;
        let attachment = self.backend.attach_exec(&exec, request.tty).await?;
        drop(attachment.input);

        relay_output(attachment.output, request.tty, sink).await?;

        let exit_code = self.backend.exec_exit_code(&exec).await?;
        Ok(ExecStatus { exit_code })
    }

    /// Start a long-running process and return once it is attached.
    ///
    /// Output is relayed to `sink` from a background task until the process
    /// closes it, `cancel` fires, or [`stop_detached`](Self::stop_detached)
    /// is called for the returned id. Stopping only ends the relay; the
    /// process itself lives until it exits or its sandbox goes away.
    pub async fn spawn_detached(
        &self,
        sandbox: &SandboxId,
        request: &ExecRequest,
        sink: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ExecId> {
        let program = request
            .argv
            .first()
            .cloned()
            .ok_or_else(|| Error::invalid_request("argv must not be empty"))?;

        let spec = ExecSpec {
            argv: request.argv.clone(),
            tty: request.tty,
            attach_stdin: false,
            workdir: self.workdir.clone(),
        };
        let (exec, attachment) = cancellable(cancel, "spawn process", async {
            let exec = self.backend.create_exec(sandbox, &spec).await?;
            let attachment = self.backend.attach_exec(&exec, request.tty).await?;
            Ok((exec, attachment))
        })
        .await?;
        drop(attachment.input);
        let output = attachment.output;

        let stop = cancel.child_token();
        self.detached.insert(
            exec.clone(),
            Detached {
                sandbox: sandbox.clone(),
                stop: stop.clone(),
            },
        );
        metrics::gauge!("sandbox_detached_processes").increment(1.0);
        tracing::info!(sandbox_id = %sandbox, exec_id = %exec, program = %program, "Detached process started");

        let backend = self.backend.clone();
        let detached = self.detached.clone();
        let sandbox = sandbox.clone();
        let exec_id = exec.clone();
        let tty = request.tty;
        tokio::spawn(async move {
            let relayed = tokio::select! {
                biased;
                _ = stop.cancelled() => Err(Error::cancelled("detached process")),
                result = relay_output(output, tty, Some(sink.as_ref())) => result,
            };

            match relayed {
                Ok(()) => {
                    match tokio::time::timeout(EXIT_CODE_TIMEOUT, backend.exec_exit_code(&exec_id)).await {
                        Ok(Ok(exit_code)) => tracing::info!(
                            sandbox_id = %sandbox,
                            exec_id = %exec_id,
                            program = %program,
                            exit_code = ?exit_code,
                            "Detached process exited"
                        ),
                        Ok(Err(e)) => tracing::debug!(exec_id = %exec_id, error = %e, "No exit code for detached process"),
                        Err(_) => tracing::warn!(exec_id = %exec_id, "Timed out waiting for detached exit code"),
                    }
                }
                Err(e) => {
                    tracing::debug!(sandbox_id = %sandbox, exec_id = %exec_id, error = %e, "Detached relay ended")
                }
            }

            detached.remove(&exec_id);
            metrics::gauge!("sandbox_detached_processes").decrement(1.0);
        });

        Ok(exec)
    }

    /// Stop relaying output of a detached process. `false` if it is not
    /// (or no longer) tracked.
    pub fn stop_detached(&self, exec: &ExecId) -> bool {
        match self.detached.get(exec) {
            Some(entry) => {
                entry.stop.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every relay for processes in `sandbox`, or in every sandbox
    /// when `sandbox` is `None`. Returns how many were stopped.
    pub fn stop_detached_in(&self, sandbox: Option<&SandboxId>) -> usize {
        let mut stopped = 0;
        for entry in self.detached.iter() {
            if sandbox.map_or(true, |id| &entry.sandbox == id) {
                entry.stop.cancel();
                stopped += 1;
            }
        }
        stopped
    }

    /// Whether the output of `exec` is still being relayed.
    pub fn is_detached(&self, exec: &ExecId) -> bool {
        self.detached.contains_key(exec)
    }
}

/// Copy process output into `sink`, decoding frames unless `tty`.
async fn relay_output(output: BoxedReader, tty: bool, sink: Option<&dyn OutputSink>) -> Result<()> {
    if tty {
        let mut chunks = ReaderStream::new(output);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            deliver(sink, StreamKind::Stdout, chunk).await?;
        }
    } else {
        let mut frames = FramedRead::new(output, FrameCodec);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            deliver(sink, frame.kind, frame.payload).await?;
        }
    }
    Ok(())
}

async fn deliver(sink: Option<&dyn OutputSink>, kind: StreamKind, data: bytes::Bytes) -> Result<()> {
    match sink {
        Some(sink) => sink
            .write(kind, data)
            .await
            .map_err(|e| Error::stream(format!("output sink failed: {}", e))),
        None => Ok(()),
    }
}

/// Race `fut` against `cancel`.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(what.to_string())),
        result = fut => result,
    }
}
