//! Common streaming infrastructure
//!
//! Chunk sources (live HTTP body or recorded playback) and the line decoder
//! for `text/event-stream` framing. Both sources feed the same decoder, so
//! playback exercises exactly the code path a live response takes.

use crate::recording::RecordedChunk;
use crate::types::{ApiError, Result};
use async_trait::async_trait;
use reqwest::Response;
use std::time::{Duration, Instant};

/// Prefix of an SSE data line
pub const DATA_PREFIX: &str = "data:";
/// Payload that marks the end of a completion stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Source of raw body chunks
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Real HTTP response chunk stream
pub struct HttpChunkStream {
    response: Response,
}

impl HttpChunkStream {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(ApiError::NetworkError(format!("HTTP chunk error: {e}")).into()),
        }
    }
}

/// Recorded chunk stream for playback
pub struct PlaybackChunkStream {
    chunks: Vec<RecordedChunk>,
    current_index: usize,
    start_time: Instant,
    fast_mode: bool,
}

impl PlaybackChunkStream {
    pub fn new(chunks: Vec<RecordedChunk>, fast_mode: bool) -> Self {
        Self {
            chunks,
            current_index: 0,
            start_time: Instant::now(),
            fast_mode,
        }
    }
}

#[async_trait]
impl ChunkStream for PlaybackChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(chunk) = self.chunks.get(self.current_index) else {
            return Ok(None);
        };

        if !self.fast_mode {
            let elapsed = self.start_time.elapsed();
            let expected_time = Duration::from_millis(chunk.timestamp_ms);
            if elapsed < expected_time {
                tokio::time::sleep(expected_time - elapsed).await;
            }
        }

        let sse_line = format!("{DATA_PREFIX} {}\n", chunk.data);
        self.current_index += 1;

        Ok(Some(sse_line.into_bytes()))
    }
}

/// Splits a byte stream into complete lines.
///
/// Network chunks can end in the middle of a line or in the middle of a
/// multi-byte UTF-8 sequence; both are held back until the rest arrives.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without terminators.
    /// Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            if let Some(line) = decode_line(&self.pending[start..end]) {
                lines.push(line);
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Return whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn decode_line(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let line = String::from_utf8_lossy(bytes);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.into_owned())
    }
}

/// Classification of one event-stream line
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine<'a> {
    /// Payload of a `data:` line
    Data(&'a str),
    /// The end-of-stream sentinel
    Done,
    /// Comments, `event:`/`id:` fields and anything else
    Other,
}

pub fn classify_line(line: &str) -> SseLine<'_> {
    let line = line.trim_end();
    match line.strip_prefix(DATA_PREFIX) {
        Some(data) => {
            let data = data.strip_prefix(' ').unwrap_or(data);
            if data.trim() == DONE_SENTINEL {
                SseLine::Done
            } else {
                SseLine::Data(data)
            }
        }
        None => SseLine::Other,
    }
}
