//! Output sinks owned by the engine itself.
//!
//! Transports bring their own [`OutputSink`]; these cover capturing output
//! for parsing and wiring sessions to channels.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use cloudrepl_core::{Error, OutputSink, Result, StreamKind};

/// Collects stdout and stderr into separate buffers.
#[derive(Debug, Default)]
pub struct BufferSink {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stdout(&self) -> Vec<u8> {
        self.stdout.lock().await.clone()
    }

    pub async fn stderr(&self) -> Vec<u8> {
        self.stderr.lock().await.clone()
    }

    /// Stdout decoded as UTF-8, replacing invalid sequences.
    pub async fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock().await).into_owned()
    }

    pub async fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock().await).into_owned()
    }
}

#[async_trait]
impl OutputSink for BufferSink {
    async fn write(&self, kind: StreamKind, data: Bytes) -> Result<()> {
        match kind {
            StreamKind::Stdout => self.stdout.lock().await.extend_from_slice(&data),
            StreamKind::Stderr => self.stderr.lock().await.extend_from_slice(&data),
        }
        Ok(())
    }
}

/// Captures stdout for parsing while passing stderr through to another sink.
pub(crate) struct CaptureSink<'a> {
    stdout: Mutex<Vec<u8>>,
    stderr: Option<&'a dyn OutputSink>,
}

impl<'a> CaptureSink<'a> {
    pub(crate) fn new(stderr: Option<&'a dyn OutputSink>) -> Self {
        Self {
            stdout: Mutex::new(Vec::new()),
            stderr,
        }
    }

    pub(crate) fn into_stdout(self) -> Vec<u8> {
        self.stdout.into_inner()
    }
}

#[async_trait]
impl OutputSink for CaptureSink<'_> {
    async fn write(&self, kind: StreamKind, data: Bytes) -> Result<()> {
        match kind {
            StreamKind::Stdout => {
                self.stdout.lock().await.extend_from_slice(&data);
                Ok(())
            }
            StreamKind::Stderr => match self.stderr {
                Some(sink) => sink.write(kind, data).await,
                None => Ok(()),
            },
        }
    }
}

/// Forwards every chunk into an mpsc channel.
///
/// Writes fail with a stream error once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<(StreamKind, Bytes)>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<(StreamKind, Bytes)>) -> Self {
        Self { tx }
    }

    /// A sink plus the receiving end, with room for `capacity` chunks.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<(StreamKind, Bytes)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn write(&self, kind: StreamKind, data: Bytes) -> Result<()> {
        self.tx
            .send((kind, data))
            .await
            .map_err(|_| Error::stream("output receiver dropped"))
    }
}
