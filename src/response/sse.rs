use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;

use crate::error::{ClientError, DecodeKind};
use crate::response::ByteStream;

/// One parsed Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; "message" when the frame did not set one.
    pub event: String,
    /// Accumulated `data:` lines, joined with newlines.
    pub data: String,
    /// The last seen `id:` field, carried across frames.
    pub id: Option<String>,
    /// Reconnection delay from a `retry:` field in this frame.
    pub retry: Option<Duration>,
}

/// Incremental SSE parser over the response byte stream.
///
/// Framing: lines are terminated by `\n` (a preceding `\r` is stripped);
/// `field: value` lines accumulate into the pending frame; a blank line
/// dispatches the frame when it has data; `:` lines are comments. A frame
/// still holding data at end of stream is malformed and surfaces as an sse
/// decode error.
pub struct SseStream {
    inner: ByteStream,
    buf: Vec<u8>,
    event_type: String,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
    source_done: bool,
    done: bool,
}

impl SseStream {
    pub fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            event_type: String::new(),
            data: String::new(),
            has_data: false,
            last_event_id: None,
            retry: None,
            source_done: false,
            done: false,
        }
    }

    /// Process one line. Returns a dispatched event on a blank line with
    /// accumulated data.
    fn process_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };

        if line.is_empty() {
            if !self.has_data {
                // Frame without data: reset the type and move on.
                self.event_type.clear();
                self.retry = None;
                return None;
            }
            let event = SseEvent {
                event: if self.event_type.is_empty() {
                    "message".to_string()
                } else {
                    self.event_type.clone()
                },
                data: std::mem::take(&mut self.data),
                id: self.last_event_id.clone(),
                retry: self.retry.take(),
            };
            self.has_data = false;
            self.event_type.clear();
            return Some(event);
        }

        if line[0] == b':' {
            return None;
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line.as_ref(), ""),
        };

        match field {
            "event" => {
                self.event_type = value.to_string();
            }
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    /// Consume complete lines from the buffer until one dispatches.
    fn drain_buffer(&mut self) -> Option<SseEvent> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = self.process_line(&line[..line.len() - 1]) {
                return Some(event);
            }
        }
        None
    }

    /// End of stream: a trailing unterminated line still counts as input,
    /// after which leftover data means the final frame never dispatched.
    fn finish(&mut self) -> Option<Result<SseEvent, ClientError>> {
        self.done = true;
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            if let Some(event) = self.process_line(&line) {
                return Some(Ok(event));
            }
        }
        if self.has_data {
            return Some(Err(ClientError::Decode {
                kind: DecodeKind::Sse,
                message: "stream ended inside an event (missing blank line)".into(),
            }));
        }
        None
    }
}

impl Stream for SseStream {
    type Item = Result<SseEvent, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if let Some(event) = this.drain_buffer() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.source_done {
                return Poll::Ready(this.finish());
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.source_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
