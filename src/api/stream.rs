//! Pull-based delta stream over a streaming `/chat/completions` body.

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;

use super::sse::{SseDecoder, SseEvent};
use crate::error::ApiError;
use crate::types::ChatChunk;

/// Lazy sequence of text deltas from one upstream call.
///
/// Restartable per call only: a stream cannot be resumed once dropped.
/// Deltas come out in arrival order; malformed frames are skipped.
pub struct CompletionStream {
    chunks: BoxStream<'static, Result<Vec<u8>, ApiError>>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    accumulated: String,
    finished: bool,
}

impl std::fmt::Debug for CompletionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionStream")
            .field("accumulated_len", &self.accumulated.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl CompletionStream {
    pub(crate) fn from_response(response: reqwest::Response) -> Self {
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ApiError::from));
        Self::from_chunks(chunks)
    }

    /// Wrap any byte-chunk stream carrying `data:` frames.
    pub fn from_chunks<S>(chunks: S) -> Self
    where
        S: Stream<Item = Result<Vec<u8>, ApiError>> + Send + 'static,
    {
        Self {
            chunks: chunks.boxed(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            accumulated: String::new(),
            finished: false,
        }
    }

    /// Next non-empty delta, `None` on `[DONE]` or end of body.
    pub async fn next_delta(&mut self) -> Option<Result<String, ApiError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                match event {
                    SseEvent::Done => {
                        self.finished = true;
                        self.pending.clear();
                        return None;
                    }
                    SseEvent::Data(payload) => {
                        let Some(chunk) = self.decoder.decode_json::<ChatChunk>(&payload) else {
                            continue;
                        };
                        if let Some(delta) = chunk.delta_text() {
                            self.accumulated.push_str(delta);
                            return Some(Ok(delta.to_string()));
                        }
                        continue;
                    }
                }
            }
            if self.finished {
                return None;
            }
            match self.chunks.next().await {
                Some(Ok(bytes)) => self.pending.extend(self.decoder.push(&bytes)),
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                None => {
                    self.finished = true;
                    self.pending.extend(self.decoder.finish());
                }
            }
        }
    }

    /// Text received so far.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn malformed_frames(&self) -> u64 {
        self.decoder.malformed_frames()
    }

    /// Drive the stream to the end, calling `on_fragment(delta, accumulated)`
    /// for each delta in order. Returns the full text.
    pub async fn for_each_fragment<F>(mut self, mut on_fragment: F) -> Result<String, ApiError>
    where
        F: FnMut(&str, &str),
    {
        while let Some(delta) = self.next_delta().await {
            let delta = delta?;
            on_fragment(&delta, &self.accumulated);
        }
        Ok(self.accumulated)
    }
}
