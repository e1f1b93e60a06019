//! Incremental decoder for `data: <json>` server-sent-event streams.
//!
//! The transport can cut the stream anywhere, including in the middle of a
//! line or a multi-byte character, so the decoder keeps the unterminated tail
//! as raw bytes and only decodes lines once their `\n` has arrived.

use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

pub const DATA_PREFIX: &[u8] = b"data:";

/// A single frame that could not be decoded. Logged and skipped, never fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parses one complete line. `None` means the line is not an event line.
/// Invalid UTF-8 is replaced with U+FFFD rather than dropping the frame.
pub fn parse_line(line: &[u8]) -> Option<Result<Value, DecodeError>> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).map_err(DecodeError::from))
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no `\n`.
    scanned: usize,
    skipped: usize,
}

impl SseDecoder {
    pub fn new() -> Self { Self::default() }

    /// Appends a chunk and returns the records of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            if let Some(record) = self.accept(parse_line(&self.buffer[start..end])) {
                records.push(record);
            }
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        records
    }

    /// Flushes a final line that arrived without a trailing newline.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        self.accept(parse_line(&rest))
    }

    /// Frames dropped so far because they failed to decode.
    pub fn skipped(&self) -> usize { self.skipped }

    /// Bytes held back waiting for their line terminator.
    pub fn pending(&self) -> usize { self.buffer.len() }

    fn accept(&mut self, parsed: Option<Result<Value, DecodeError>>) -> Option<Value> {
        match parsed? {
            Ok(record) => {
                let event = record.get("event").and_then(Value::as_str).unwrap_or("none");
                debug!("📦 SSE frame [event={}]", event);
                Some(record)
            }
            Err(e) => {
                self.skipped += 1;
                warn!("⚠️ Skipping undecodable SSE frame: {}", e);
                None
            }
        }
    }
}

struct RecordState<S> {
    bytes: S,
    decoder: SseDecoder,
    ready: VecDeque<Value>,
    finished: bool,
}

/// Turns a byte stream into a stream of decoded records. A transport error is
/// yielded once and ends the stream. Dropping the returned stream stops
/// reading from `bytes`.
pub fn decode_records<S, E>(bytes: S) -> impl Stream<Item = Result<Value, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let state = RecordState { bytes, decoder: SseDecoder::new(), ready: VecDeque::new(), finished: false };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(record) = state.ready.pop_front() {
                return Some((Ok(record), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let records = state.decoder.push(&chunk);
                    state.ready.extend(records);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.finished = true;
                    if let Some(record) = state.decoder.finish() {
                        state.ready.push_back(record);
                    }
                    debug!("📍 SSE stream ended ({} frames skipped)", state.decoder.skipped());
                }
            }
        }
    })
}
