//! Frame boundaries on the TCP stream.
//!
//! Two framings are supported:
//! - `Lines`: one JSON document per `\n`-terminated line. Partial reads are
//!   reassembled and over-long lines are discarded without closing the
//!   connection.
//! - `Chunk`: every socket read of at most `chunk_size` bytes is one frame.
//!   Nothing is reassembled, so a document split across two reads arrives as
//!   two undecodable frames. Kept for peers that write bare JSON without a
//!   delimiter.
//!
//! ## Wire Format
//!
//! ```text
//! lines: {"type":"LOGOUT","session_id":"..."}\n
//! chunk: {"type":"LOGOUT","session_id":"..."}
//! ```

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{trace, warn};

/// Frame delimiting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    #[default]
    Lines,
    Chunk,
}

/// Framing plus its size limits.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    pub framing: Framing,
    pub max_frame_len: usize,
    pub chunk_size: usize,
}

impl FrameCodec {
    pub fn new(framing: Framing, max_frame_len: usize, chunk_size: usize) -> Self {
        Self {
            framing,
            max_frame_len,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Serialize a payload into one outbound frame.
    pub fn encode<T: Serialize>(&self, payload: &T) -> Result<Bytes, serde_json::Error> {
        let mut out = serde_json::to_vec(payload)?;
        if self.framing == Framing::Lines {
            out.push(b'\n');
        }
        Ok(Bytes::from(out))
    }

    /// Wrap a read half in a frame reader using this codec's limits.
    pub fn reader<R: AsyncRead + Unpin>(&self, inner: R) -> FrameReader<R> {
        FrameReader {
            inner,
            codec: *self,
            buffer: BytesMut::with_capacity(self.chunk_size.max(4096)),
            discarding: false,
        }
    }
}

/// Pulls frames off an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    codec: FrameCodec,
    buffer: BytesMut,
    /// Skipping the rest of an over-long line
    discarding: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Next frame, or `None` once the peer has closed the stream.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Bytes>> {
        match self.codec.framing {
            Framing::Lines => self.next_line().await,
            Framing::Chunk => self.next_chunk().await,
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1);
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                if line.len() > self.codec.max_frame_len {
                    warn!(
                        len = line.len(),
                        limit = self.codec.max_frame_len,
                        "Frame exceeds maximum length, discarding"
                    );
                    continue;
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(line.freeze()));
            }

            // One spare byte for a trailing '\r'
            if self.buffer.len() > self.codec.max_frame_len.saturating_add(1) {
                if !self.discarding {
                    warn!(
                        limit = self.codec.max_frame_len,
                        "Frame exceeds maximum length, discarding"
                    );
                }
                self.buffer.clear();
                self.discarding = true;
            }

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                trace!("Stream closed by peer");
                // An unterminated final line is still a frame
                let rest = self.buffer.split();
                if self.discarding || rest.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Ok(Some(rest.freeze()));
            }
        }
    }

    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        self.buffer.clear();
        self.buffer.resize(self.codec.chunk_size, 0);
        let n = self.inner.read(&mut self.buffer[..]).await?;
        if n == 0 {
            return Ok(None);
        }
        self.buffer.truncate(n);
        Ok(Some(self.buffer.split().freeze()))
    }
}
