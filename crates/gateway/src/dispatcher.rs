//! Per-connection message dispatch.
//!
//! A `Dispatcher` owns the state of one client connection: the output sink,
//! the connection's cancellation token and the input side of any terminals
//! the client started. It knows nothing about sockets, so it can be driven
//! directly in tests.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use cloudrepl_core::{Error, OutputSink, OwnerId, Result, StreamKind};
use cloudrepl_sandbox::{InteractiveHandle, SandboxManager, SessionState};

use crate::messages::{InboundMessage, MessageKind};

/// Buffered keystroke chunks per terminal.
const TERMINAL_INPUT_BUFFER: usize = 64;

struct Terminal {
    input: mpsc::Sender<Bytes>,
    handle: InteractiveHandle,
}

impl Terminal {
    fn is_live(&self) -> bool {
        self.handle.state() != SessionState::Closed && !self.input.is_closed()
    }
}

pub struct Dispatcher {
    manager: Arc<SandboxManager>,
    sink: Arc<dyn OutputSink>,
    cancel: CancellationToken,
    terminals: Mutex<HashMap<OwnerId, Terminal>>,
}

impl Dispatcher {
    /// `cancel` is the connection's token; everything started on behalf of
    /// this connection is tied to it.
    pub fn new(
        manager: Arc<SandboxManager>,
        sink: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            sink,
            cancel,
            terminals: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one raw client message.
    ///
    /// Never fails: every problem is reported to the client through the
    /// output sink and the connection stays usable.
    pub async fn handle_text(&self, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            Ok(_) | Err(_) => {
                tracing::debug!("Rejected malformed message");
                self.emit("invalid JSON\n").await;
                return;
            }
        };

        // Classify before decoding the rest, so a bad field on an unknown
        // type still gets the unknown-type reply.
        let type_name = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let kind = MessageKind::parse(type_name);
        metrics::counter!("gateway_messages_total", "type" => kind.as_str()).increment(1);

        if kind == MessageKind::Unknown {
            tracing::debug!(message_type = %type_name, "Unknown message type");
            self.emit("unknown message type\n").await;
            return;
        }

        let message: InboundMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                self.emit(&format!("error: invalid request: {}\n", e)).await;
                return;
            }
        };

        if let Err(e) = self.dispatch(kind, &message).await {
            tracing::debug!(message_type = kind.as_str(), error = %e, "Request failed");
            self.emit(&format!("error: {}\n", e)).await;
        }
    }

    async fn dispatch(&self, kind: MessageKind, message: &InboundMessage) -> Result<()> {
        let owner = message.owner()?;
        let sink = Some(self.sink.as_ref());
        let cancel = &self.cancel;
        let manager = &self.manager;

        match kind {
            MessageKind::InitProject => {
                let sandbox = manager.init_project(&owner, cancel).await?;
                self.emit(&format!("sandbox {} ready\n", sandbox.id)).await;
            }
            MessageKind::WriteFile => {
                let content = message.content.as_deref().unwrap_or_default();
                manager
                    .write_file(&owner, message.path()?, content.as_bytes(), sink, cancel)
                    .await?;
            }
            MessageKind::ReadFile => {
                manager.read_file(&owner, message.path()?, sink, cancel).await?;
            }
            MessageKind::RemoveFile => {
                manager.remove_file(&owner, message.path()?, sink, cancel).await?;
            }
            MessageKind::CreateDir => {
                manager.create_dir(&owner, message.path()?, sink, cancel).await?;
            }
            MessageKind::SearchFile => {
                manager
                    .search_in_file(&owner, message.path()?, message.search()?, sink, cancel)
                    .await?;
            }
            MessageKind::RenameFile => {
                manager
                    .rename(&owner, message.path()?, message.new_name()?, sink, cancel)
                    .await?;
            }
            MessageKind::ListFiles => {
                let entries = manager
                    .list_files(&owner, message.path_or_root(), sink, cancel)
                    .await?;
                self.emit(&serde_json::to_string_pretty(&entries)?).await;
            }
            MessageKind::StatFile => {
                let entry = manager.stat_file(&owner, message.path()?, sink, cancel).await?;
                self.emit(&serde_json::to_string(&entry)?).await;
            }
            MessageKind::ResizeTerminal => {
                let (rows, cols) = message.dimensions()?;
                manager.resize_terminal(&owner, rows, cols).await?;
            }
            MessageKind::StartTerminal => self.start_terminal(owner).await?,
            MessageKind::Input => self.send_input(&owner, message.data()?).await?,
            MessageKind::StopTerminal => {
                self.terminals.lock().await.remove(&owner);
                manager.stop_terminal(&owner)?;
            }
            MessageKind::Unknown => {}
        }
        Ok(())
    }

    async fn start_terminal(&self, owner: OwnerId) -> Result<()> {
        let mut terminals = self.terminals.lock().await;
        if terminals.get(&owner).is_some_and(Terminal::is_live) {
            let sandbox = self.manager.sandbox_for(&owner)?;
            return Err(Error::AlreadyAttached(sandbox.to_string()));
        }

        let (input, rx) = mpsc::channel(TERMINAL_INPUT_BUFFER);
        let handle = self
            .manager
            .start_terminal(&owner, rx, self.sink.clone(), &self.cancel)
            .await?;
        terminals.insert(owner, Terminal { input, handle });
        Ok(())
    }

    async fn send_input(&self, owner: &OwnerId, data: &str) -> Result<()> {
        let input = {
            let mut terminals = self.terminals.lock().await;
            match terminals.get(owner) {
                Some(terminal) if terminal.is_live() => terminal.input.clone(),
                Some(_) => {
                    terminals.remove(owner);
                    return Err(Error::invalid_request("terminal has exited"));
                }
                None => return Err(Error::invalid_request("no terminal started")),
            }
        };
        input
            .send(Bytes::copy_from_slice(data.as_bytes()))
            .await
            .map_err(|_| Error::invalid_request("terminal has exited"))
    }

    /// Number of terminals this connection still has attached.
    pub async fn live_terminals(&self) -> usize {
        self.terminals
            .lock()
            .await
            .values()
            .filter(|terminal| terminal.is_live())
            .count()
    }

    /// Tear down everything this connection started.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for (_, terminal) in self.terminals.lock().await.drain() {
            terminal.handle.close();
        }
    }

    async fn emit(&self, text: &str) {
        if let Err(e) = self
            .sink
            .write(StreamKind::Stdout, Bytes::copy_from_slice(text.as_bytes()))
            .await
        {
            tracing::debug!(error = %e, "Dropped output for closed connection");
        }
    }
}
