//! Incremental decoder for the `data:`-framed JSON event stream.
//!
//! The transport hands over arbitrary byte chunks. [`FrameParser`] keeps a
//! carry-over buffer, cuts complete frames at the configured delimiter and
//! classifies each decoded record into a [`StreamEvent`]. Frames whose JSON is
//! cut short are held and joined with the next frame; frames that are simply
//! malformed are logged and dropped so they cannot stall the rest of the
//! stream.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::ChatError;
use crate::models::{RemoteErrorKind, StreamEvent};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send + 'static>>;
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ChatError>> + Send + 'static>>;

const DEFAULT_MAX_PENDING_BYTES: usize = 64 * 1024;

/// Where one frame ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameDelimiter {
    /// SSE style: frames separated by an empty line.
    #[default]
    BlankLine,
    /// One frame per line.
    Line,
}

impl FrameDelimiter {
    fn as_str(&self) -> &'static str {
        match self {
            FrameDelimiter::BlankLine => "\n\n",
            FrameDelimiter::Line => "\n",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "blank_line" | "blankline" | "sse" => Some(FrameDelimiter::BlankLine),
            "line" | "newline" => Some(FrameDelimiter::Line),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserConfig {
    pub delimiter: FrameDelimiter,
    /// Upper bound for undelimited input and for a held, not-yet-decodable
    /// payload.
    pub max_pending_bytes: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            delimiter: FrameDelimiter::BlankLine,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

/// Wire shape of one record. Only `type` is required for classification.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

enum Decoded {
    Record(RawFrame),
    Truncated,
    Malformed(serde_json::Error),
}

fn decode_record(payload: &str) -> Decoded {
    match serde_json::from_str::<RawFrame>(payload) {
        Ok(raw) => Decoded::Record(raw),
        Err(e) if e.is_eof() => Decoded::Truncated,
        Err(e) => Decoded::Malformed(e),
    }
}

pub struct FrameParser {
    config: ParserConfig,
    buffer: String,
    partial_utf8: Vec<u8>,
    carry: Option<String>,
}

impl FrameParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            partial_utf8: Vec::new(),
            carry: None,
        }
    }

    /// Feeds one transport chunk and returns every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.decode_utf8(chunk);

        let delimiter = self.config.delimiter.as_str();
        let mut events = Vec::new();
        while let Some(idx) = self.buffer.find(delimiter) {
            let frame = self.buffer[..idx].to_string();
            self.buffer.drain(..idx + delimiter.len());
            self.decode_frame(&frame, &mut events);
        }
        if self.buffer.len() > self.config.max_pending_bytes {
            warn!(
                "Discarding {} bytes of undelimited stream input (limit {})",
                self.buffer.len(),
                self.config.max_pending_bytes
            );
            self.buffer.clear();
        }
        events
    }

    /// Flushes whatever is still buffered once the transport has closed.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if !self.partial_utf8.is_empty() {
            let bytes = std::mem::take(&mut self.partial_utf8);
            self.push_text(&String::from_utf8_lossy(&bytes));
        }

        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        if !rest.trim().is_empty() {
            self.decode_frame(&rest, &mut events);
        }
        if let Some(pending) = self.carry.take() {
            debug!("Stream ended with an incomplete {}-byte frame", pending.len());
        }
        events
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        self.partial_utf8.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.partial_utf8);
        let mut rest: &[u8] = &bytes;

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.push_text(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.push_text(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            self.push_text("\u{FFFD}");
                            rest = &after[len..];
                        }
                        // Multi-byte character split across chunks.
                        None => {
                            self.partial_utf8 = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.buffer.push_str(text);
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
    }

    fn decode_frame(&mut self, frame: &str, events: &mut Vec<StreamEvent>) {
        let Some(payload) = frame_payload(frame) else {
            return;
        };

        match self.carry.take() {
            Some(pending) => {
                let joined = format!("{pending}\n{payload}");
                match decode_record(&joined) {
                    Decoded::Record(raw) => events.extend(classify(raw)),
                    Decoded::Truncated => self.hold(joined),
                    Decoded::Malformed(e) => {
                        warn!("Dropping undecodable partial stream frame: {e}");
                        self.decode_fresh(payload, events);
                    }
                }
            }
            None => self.decode_fresh(payload, events),
        }
    }

    fn decode_fresh(&mut self, payload: String, events: &mut Vec<StreamEvent>) {
        match decode_record(&payload) {
            Decoded::Record(raw) => events.extend(classify(raw)),
            Decoded::Truncated => self.hold(payload),
            Decoded::Malformed(e) => {
                warn!("Dropping malformed stream frame {payload}: {e}");
            }
        }
    }

    fn hold(&mut self, pending: String) {
        if pending.len() > self.config.max_pending_bytes {
            warn!(
                "Discarding {}-byte partial stream frame (limit {})",
                pending.len(),
                self.config.max_pending_bytes
            );
            return;
        }
        self.carry = Some(pending);
    }
}

fn strip_data_prefix(line: &str) -> &str {
    match line.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("data:") => &line[5..],
        _ => line,
    }
}

fn is_sse_field(line: &str) -> bool {
    line.starts_with("event:") || line.starts_with("id:") || line.starts_with("retry:")
}

/// Extracts the JSON payload of one frame, tolerating a doubled `data:` prefix.
fn frame_payload(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') || is_sse_field(line) {
                return None;
            }
            let stripped = strip_data_prefix(line).trim();
            (!stripped.is_empty()).then_some(stripped)
        })
        .collect();

    if lines.is_empty() {
        return None;
    }
    let joined = lines.join("\n");
    let payload = strip_data_prefix(&joined).trim();
    (!payload.is_empty()).then(|| payload.to_string())
}

fn value_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn classify(raw: RawFrame) -> Option<StreamEvent> {
    let Some(kind) = raw.kind else {
        debug!("Ignoring stream frame without a type");
        return None;
    };

    match kind.as_str() {
        "content_chunk" => {
            let text = raw
                .content
                .or_else(|| raw.data.and_then(|v| v.as_str().map(str::to_string)));
            match text {
                Some(text) => Some(StreamEvent::ContentChunk(text)),
                None => {
                    debug!("Ignoring content_chunk without text");
                    None
                }
            }
        }
        "completed" => Some(StreamEvent::Completed),
        "done" => Some(StreamEvent::Done),
        "thinking" => {
            let detail = raw.message.or(raw.content).or_else(|| raw.data.and_then(value_text));
            Some(StreamEvent::Thinking(detail))
        }
        other => {
            let detail = raw.message.or(raw.content).or_else(|| raw.data.and_then(value_text));
            match RemoteErrorKind::from_type(other) {
                Some(kind) => Some(StreamEvent::Error {
                    kind,
                    message: detail.unwrap_or_else(|| "error".to_string()),
                }),
                None => {
                    debug!("Treating unrecognized stream frame '{other}' as status");
                    Some(StreamEvent::Status { kind: other.to_string(), detail })
                }
            }
        }
    }
}

/// Turns a byte stream into a lazy event stream.
///
/// The returned stream ends after the first terminal event, after the first
/// transport error, or when the input is exhausted.
pub fn parse_events(bytes: ByteStream, config: ParserConfig) -> EventStream {
    Box::pin(async_stream::try_stream! {
        let mut parser = FrameParser::new(config);
        let mut bytes = bytes;
        let mut terminated = false;

        while !terminated {
            let chunk = match bytes.next().await {
                Some(chunk) => chunk?,
                None => break,
            };
            for event in parser.push(&chunk) {
                terminated = event.is_terminal();
                yield event;
                if terminated {
                    break;
                }
            }
        }

        if !terminated {
            for event in parser.finish() {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        }
    })
}
