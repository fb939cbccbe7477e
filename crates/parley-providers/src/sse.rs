//! Generic SSE (Server-Sent Events) parser.
//!
//! [`SseDecoder`] is a pure incremental decoder over byte chunks;
//! [`parse_sse_stream`] drives it from a `reqwest::Response` body.

use std::collections::VecDeque;
use std::fmt::Display;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental SSE decoder. Chunk boundaries may fall anywhere, including
/// inside a UTF-8 sequence or between `\r` and `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(event) = self.process_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush at end of input: an unterminated last line and any pending
    /// event are dispatched.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
            let line = line.trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            self.id = Some(value.trim_start().to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(event)
    }
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    parse_sse_bytes(response.bytes_stream())
}

/// Parse any byte-chunk stream as SSE.
pub fn parse_sse_bytes<S, E>(bytes: S) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display,
{
    futures::stream::unfold(
        SseState {
            bytes: Box::pin(bytes),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push(&chunk));
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => {
                        state.done = true;
                        state.pending.extend(state.decoder.finish());
                    }
                }
            }
        },
    )
}

struct SseState<S> {
    bytes: std::pin::Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    done: bool,
}
