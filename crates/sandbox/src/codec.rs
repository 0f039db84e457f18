//! Framing of the container engine's multiplexed attach stream.
//!
//! When a process runs without a TTY, the engine interleaves stdout and
//! stderr on one connection as a sequence of frames:
//!
//! ```text
//! [kind: u8][reserved: 3 bytes][length: u32 big-endian][payload: length bytes]
//! ```
//!
//! `kind` is 1 for stdout and 2 for stderr. TTY attachments carry raw bytes
//! and never go through this codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use cloudrepl_core::{types::StreamKind, Error, Result};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 8;

const KIND_STDOUT: u8 = 1;
const KIND_STDERR: u8 = 2;

/// Upper bound on how much buffer space is reserved up front for a payload
/// whose length was announced but has not arrived yet.
const MAX_RESERVE: usize = 64 * 1024;

/// One decoded chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl StreamFrame {
    pub fn new(kind: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Decoder/encoder for the multiplexed attach stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = StreamFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StreamFrame>> {
        loop {
            if src.len() < HEADER_LEN {
                src.reserve(HEADER_LEN - src.len());
                return Ok(None);
            }

            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
            if src.len() < HEADER_LEN + len {
                src.reserve((HEADER_LEN + len - src.len()).min(MAX_RESERVE));
                return Ok(None);
            }

            // Unknown kinds are treated as stdout.
            let kind = match src[0] {
                KIND_STDERR => StreamKind::Stderr,
                _ => StreamKind::Stdout,
            };
            src.advance(HEADER_LEN);
            let payload = src.split_to(len).freeze();

            if payload.is_empty() {
                continue;
            }
            return Ok(Some(StreamFrame { kind, payload }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<StreamFrame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < HEADER_LEN {
            return Err(Error::incomplete_frame(format!(
                "stream ended after {} of {} header bytes",
                src.len(),
                HEADER_LEN
            )));
        }
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        Err(Error::incomplete_frame(format!(
            "stream ended after {} of {} payload bytes",
            src.len() - HEADER_LEN,
            len
        )))
    }
}

impl Encoder<StreamFrame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: StreamFrame, dst: &mut BytesMut) -> Result<()> {
        let len = u32::try_from(frame.payload.len()).map_err(|_| {
            Error::invalid_request(format!(
                "frame payload of {} bytes exceeds the 4 GiB limit",
                frame.payload.len()
            ))
        })?;
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(match frame.kind {
            StreamKind::Stdout => KIND_STDOUT,
            StreamKind::Stderr => KIND_STDERR,
        });
        dst.put_bytes(0, 3);
        dst.put_u32(len);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Encode a single frame into a standalone buffer.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    FrameCodec.encode(StreamFrame::new(kind, Bytes::copy_from_slice(payload)), &mut buf)?;
    Ok(buf.freeze())
}
