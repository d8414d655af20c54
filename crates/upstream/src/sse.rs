//! Server-Sent-Events decoding for upstream streaming responses
//!
//! Upstream frames are `data: <json>\n\n`, terminated by `data: [DONE]`.
//! Network reads split frames at arbitrary byte offsets (including inside a
//! multi-byte UTF-8 sequence), so bytes are buffered until a blank line
//! completes a frame.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use tracing::debug;

use crate::types::ChatCompletionChunk;
use crate::{ChunkStream, UpstreamError};

/// A complete SSE frame carrying data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
}

/// Incremental SSE frame splitter.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them.
    ///
    /// Frames without `data:` lines (comments, keep-alives, bare `event:`)
    /// are skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = find_blank_line(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&raw[..end]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever the stream left after its last blank line. Upstreams
    /// may close right after a final `data:` line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let raw = std::mem::take(&mut self.buffer);
        parse_frame(&String::from_utf8_lossy(&raw))
    }
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_frame(frame: &str) -> Option<SseFrame> {
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if data.is_empty() {
        return None;
    }
    let data = data.join("\n");
    if data.trim() == "[DONE]" {
        Some(SseFrame::Done)
    } else {
        Some(SseFrame::Data(data))
    }
}

struct DecodeState<S> {
    bytes: std::pin::Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<crate::Result<ChatCompletionChunk>>,
    finished: bool,
}

impl<S> DecodeState<S> {
    /// Queue parsed chunks up to `[DONE]`, after which nothing is read.
    fn enqueue(&mut self, frames: impl IntoIterator<Item = SseFrame>) {
        for frame in frames {
            match frame {
                SseFrame::Data(data) => {
                    let parsed = serde_json::from_str::<ChatCompletionChunk>(&data).map_err(|e| {
                        UpstreamError::InvalidResponse(format!("malformed stream chunk: {e}"))
                    });
                    self.pending.push_back(parsed);
                }
                SseFrame::Done => {
                    self.finished = true;
                    break;
                }
            }
        }
    }
}

/// Turn an upstream byte stream into a stream of parsed chunks.
///
/// A frame that is not a valid chunk yields an `InvalidResponse` item; a
/// broken byte stream yields one `Unavailable` item and ends the stream.
pub fn chunk_stream<S, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<UpstreamError> + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    let frames = state.decoder.push(&bytes);
                    state.enqueue(frames);
                }
                Some(Err(e)) => {
                    let err = match e.into() {
                        UpstreamError::Unavailable { kind, message } => UpstreamError::Unavailable {
                            kind,
                            message: format!("stream interrupted: {message}"),
                        },
                        other => other,
                    };
                    state.pending.push_back(Err(err));
                    state.finished = true;
                }
                None => {
                    let last = state.decoder.finish();
                    if !matches!(last, Some(SseFrame::Done)) {
                        debug!("upstream stream closed without [DONE]");
                    }
                    state.enqueue(last);
                    state.finished = true;
                }
            }
        }
    }))
}
