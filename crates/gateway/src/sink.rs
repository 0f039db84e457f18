//! Output sink that wraps engine output into WebSocket JSON frames.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

use cloudrepl_core::{Error, OutputSink, Result, StreamKind};

#[derive(Serialize)]
struct OutputFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a str,
}

/// Serializes each chunk as `{"type":"output","data":"..."}` and hands it
/// to the connection's writer task.
///
/// Chunks are decoded as UTF-8 per stream. A multi-byte character split
/// across two chunks is held back until its tail arrives; bytes that can
/// never be valid UTF-8 become U+FFFD.
pub struct WsOutputSink {
    tx: mpsc::Sender<String>,
    pending: Mutex<[Vec<u8>; 2]>,
}

impl WsOutputSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            pending: Mutex::new([Vec::new(), Vec::new()]),
        }
    }

    fn decode(&self, kind: StreamKind, data: &[u8]) -> Result<String> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| Error::internal("output sink lock poisoned"))?;
        let buf = &mut pending[match kind {
            StreamKind::Stdout => 0,
            StreamKind::Stderr => 1,
        }];
        buf.extend_from_slice(data);

        let mut text = String::new();
        let mut rest: &[u8] = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8.
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let carry = rest.to_vec();
        *buf = carry;
        Ok(text)
    }
}

/// Render one output frame.
pub fn output_frame(data: &str) -> Result<String> {
    Ok(serde_json::to_string(&OutputFrame {
        kind: "output",
        data,
    })?)
}

#[async_trait]
impl OutputSink for WsOutputSink {
    async fn write(&self, kind: StreamKind, data: Bytes) -> Result<()> {
        let text = self.decode(kind, &data)?;
        if text.is_empty() {
            return Ok(());
        }
        let frame = output_frame(&text)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::stream("websocket connection closed"))
    }
}
