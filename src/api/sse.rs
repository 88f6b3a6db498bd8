//! Incremental decoder for `data:`-framed event streams.
//!
//! Both the provider's `/chat/completions` stream and the relay's own
//! re-framed stream use the same line format:
//!
//! ```text
//! data: {"json": "payload"}\n
//! \n
//! data: [DONE]\n
//! ```
//!
//! Bytes arrive in arbitrary chunks, so the decoder is a small state machine
//! fed one chunk at a time. Lines without the `data: ` prefix (comments,
//! `event:`/`id:` fields, blank separators) are ignored. `[DONE]` moves the
//! decoder into a terminal state in which further input is discarded.
//!
//! Malformed payloads are never fatal: [`SseDecoder::decode_json`] skips
//! them, counts them, and logs a warning.

use serde::de::DeserializeOwned;

const DATA_PREFIX: &[u8] = b"data: ";
const DONE_SENTINEL: &str = "[DONE]";
/// Frames larger than this are dropped as malformed.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Trimmed payload text of a `data:` line.
    Data(String),
    /// The `[DONE]` sentinel; no further events follow.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// At (or inside) the start of a line, matching `data: `.
    AwaitingPrefix,
    /// Prefix matched; collecting payload bytes up to the newline.
    AccumulatingJson,
    /// Current line is not a data line (or overflowed); drop until newline.
    SkippingLine,
    /// `[DONE]` seen.
    Terminal,
}

/// Chunk-at-a-time decoder for `data:` event streams.
#[derive(Debug)]
pub struct SseDecoder {
    state: DecoderState,
    prefix_len: usize,
    payload: Vec<u8>,
    malformed_frames: u64,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::AwaitingPrefix,
            prefix_len: 0,
            payload: Vec::new(),
            malformed_frames: 0,
        }
    }

    /// Feed one chunk of bytes and return the frames it completed, in order.
    ///
    /// A frame split across chunks (including a split inside a multi-byte
    /// UTF-8 sequence) is emitted once its terminating newline arrives.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            match self.state {
                DecoderState::Terminal => break,
                DecoderState::AwaitingPrefix => self.step_prefix(byte),
                DecoderState::SkippingLine => {
                    if byte == b'\n' {
                        self.state = DecoderState::AwaitingPrefix;
                    }
                }
                DecoderState::AccumulatingJson => {
                    if byte != b'\n' {
                        if self.payload.len() >= MAX_FRAME_BYTES {
                            self.payload.clear();
                            self.note_malformed("frame exceeds size limit");
                            self.state = DecoderState::SkippingLine;
                        } else {
                            self.payload.push(byte);
                        }
                        continue;
                    }
                    self.state = DecoderState::AwaitingPrefix;
                    if let Some(event) = self.take_payload() {
                        if event == SseEvent::Done {
                            self.state = DecoderState::Terminal;
                        }
                        events.push(event);
                    }
                }
            }
        }
        events
    }

    /// Flush a trailing frame that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.state != DecoderState::AccumulatingJson {
            return None;
        }
        self.state = DecoderState::AwaitingPrefix;
        let event = self.take_payload()?;
        if event == SseEvent::Done {
            self.state = DecoderState::Terminal;
        }
        Some(event)
    }

    /// True once `[DONE]` has been decoded.
    pub fn is_terminal(&self) -> bool {
        self.state == DecoderState::Terminal
    }

    /// Number of frames skipped because they could not be decoded.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    /// Parse a data payload as JSON, skipping (and counting) failures.
    pub fn decode_json<T: DeserializeOwned>(&mut self, payload: &str) -> Option<T> {
        match serde_json::from_str(payload) {
            Ok(value) => Some(value),
            Err(err) => {
                self.note_malformed(&err.to_string());
                None
            }
        }
    }

    fn step_prefix(&mut self, byte: u8) {
        if byte == b'\n' {
            self.prefix_len = 0;
            return;
        }
        if DATA_PREFIX[self.prefix_len] != byte {
            self.prefix_len = 0;
            self.state = DecoderState::SkippingLine;
            return;
        }
        self.prefix_len += 1;
        if self.prefix_len == DATA_PREFIX.len() {
            self.prefix_len = 0;
            self.payload.clear();
            self.state = DecoderState::AccumulatingJson;
        }
    }

    fn take_payload(&mut self) -> Option<SseEvent> {
        let raw = std::mem::take(&mut self.payload);
        let text = match String::from_utf8(raw) {
            Ok(text) => text,
            Err(err) => {
                self.note_malformed(&format!("invalid utf-8: {err}"));
                return None;
            }
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed == DONE_SENTINEL {
            return Some(SseEvent::Done);
        }
        Some(SseEvent::Data(trimmed.to_string()))
    }

    fn note_malformed(&mut self, reason: &str) {
        self.malformed_frames += 1;
        tracing::warn!(
            reason,
            skipped = self.malformed_frames,
            "skipping malformed stream frame"
        );
    }
}
