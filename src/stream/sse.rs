//! SSE frame parsing and encoding.
//!
//! Handles the low-level parsing of SSE frames out of an HTTP byte stream,
//! including buffering of partial lines, per the
//! [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html).

use super::SseEvent;
use futures_util::Stream;
use memchr::memchr_iter;

// ---------------------------------------------------------------------------
// SseParser — incremental SSE line parser
// ---------------------------------------------------------------------------

/// Incremental SSE parser. Feed it raw text chunks arriving on arbitrary
/// byte boundaries; it yields fully-assembled [`SseEvent`] frames.
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            event_type: None,
            data_buffer: String::new(),
            has_data: false,
            last_event_id: None,
        }
    }

    /// Feed raw text and return any complete events parsed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    ///
    /// SSE field semantics: `event:` names the next frame; multiple `data:`
    /// lines join with `\n` (one leading space after the colon is stripped);
    /// a blank line dispatches; `:` comments and unknown fields are ignored.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.last_event_id,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        last_event_id: &mut Option<String>,
        events: &mut Vec<SseEvent>,
    ) {
        if line.is_empty() {
            if *has_data {
                events.push(SseEvent {
                    event: event_type.take(),
                    data: std::mem::take(data_buffer),
                    id: last_event_id.clone(),
                });
                *has_data = false;
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data_buffer.push('\n');
            } else {
                *has_data = true;
            }
            data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_type = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *last_event_id = Some(value.to_string());
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Encode an [`SseEvent`] into SSE wire text.
#[must_use]
pub fn encode_sse_event(event: &SseEvent) -> String {
    // Fast path for the dominant shape: unnamed, single-line data event.
    if event.event.is_none() && event.id.is_none() && !event.data.contains('\n') {
        return data_frame(&event.data);
    }

    let mut out = String::with_capacity(16 + event.data.len());
    if let Some(ev) = event.event.as_deref() {
        out.push_str("event: ");
        out.push_str(ev);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    if let Some(id) = event.id.as_deref() {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Format an OpenAI-style SSE frame (no event type, just data).
#[must_use]
pub fn data_frame(json: &str) -> String {
    let mut out = String::with_capacity(10 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

/// Format an Anthropic-style SSE frame (named event type).
#[must_use]
pub fn named_frame(event_type: &str, json: &str) -> String {
    let mut out = String::with_capacity(18 + event_type.len() + json.len());
    out.push_str("event: ");
    out.push_str(event_type);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

/// The terminal frame for OpenAI-compatible streams.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

/// Split an HTTP response byte stream into parsed SSE events.
///
/// Bytes are decoded as UTF-8 (partial sequences buffered across chunks) and
/// fed through [`SseParser`]; complete frames are yielded one at a time so
/// the pipeline converts and emits each before pulling the next.
pub fn sse_event_stream<S, E>(byte_stream: S) -> impl Stream<Item = SseEvent> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Debug + Send + 'static,
{
    use futures_util::StreamExt;

    futures_util::stream::unfold(
        (
            Box::pin(byte_stream),
            SseParser::new(),
            Vec::<u8>::new(),
            std::collections::VecDeque::<SseEvent>::new(),
        ),
        |(mut stream, mut parser, mut remainder, mut pending)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((event, (stream, parser, remainder, pending)));
                }

                let chunk = stream.as_mut().next().await?;
                let Ok(bytes) = chunk else {
                    continue;
                };

                let mut parsed = Vec::new();
                if remainder.is_empty() {
                    feed_utf8(&mut parser, &bytes, &mut remainder, &mut parsed);
                } else {
                    remainder.extend_from_slice(&bytes);
                    let carry = std::mem::take(&mut remainder);
                    feed_utf8(&mut parser, &carry, &mut remainder, &mut parsed);
                }
                pending.extend(parsed);
            }
        },
    )
}

fn feed_utf8(
    parser: &mut SseParser,
    bytes: &[u8],
    remainder: &mut Vec<u8>,
    parsed: &mut Vec<SseEvent>,
) {
    match std::str::from_utf8(bytes) {
        Ok(text) => parser.feed_into(text, parsed),
        Err(e) => {
            let valid_up_to = e.valid_up_to();
            // Safety: valid_up_to is guaranteed to be a UTF-8 boundary.
            let text = unsafe { std::str::from_utf8_unchecked(&bytes[..valid_up_to]) };
            parser.feed_into(text, parsed);
            remainder.extend_from_slice(&bytes[valid_up_to..]);
        }
    }
}
