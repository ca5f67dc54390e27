//! Incremental parser for `data:` framed streaming responses
//!
//! Network reads do not respect line boundaries, so bytes are buffered
//! until a full line is available. Only `data:` lines carry payloads;
//! comments and other fields are ignored. Payloads that fail to decode are
//! skipped so a server adding new frame shapes does not break the stream.

use super::types::StreamChunk;

const DONE_SENTINEL: &str = "[DONE]";

/// Something the stream produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A text increment
    Delta(String),
    /// The server signalled the end of the reply
    Done,
}

/// Turns raw response bytes into [`StreamEvent`]s
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
    finished: bool,
    skipped: usize,
}

impl StreamParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[DONE]` or a finish marker has been seen
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of `data:` payloads that could not be decoded
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed one network read
    ///
    /// Returns the events completed by this read, in order. Input after the
    /// end of the stream is ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.parse_line(&line, &mut events);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Flush a final line that arrived without a trailing newline
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.finished && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.parse_line(&line, &mut events);
        }
        events
    }

    fn parse_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\n', '\r']);

        if line.is_empty() || line.starts_with(':') {
            return;
        }

        let Some(payload) = line.strip_prefix("data:") else {
            // event:, id:, retry: and unknown fields
            return;
        };
        let payload = payload.trim();

        if payload == DONE_SENTINEL {
            self.finished = true;
            events.push(StreamEvent::Done);
            return;
        }

        let chunk: StreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.skipped += 1;
                tracing::debug!(error = %e, payload, "skipping undecodable stream frame");
                return;
            }
        };

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(content) = choice.delta.and_then(|d| d.content)
            && !content.is_empty()
        {
            events.push(StreamEvent::Delta(content));
        }

        if choice.finish_reason.is_some() {
            self.finished = true;
            events.push(StreamEvent::Done);
        }
    }
}
