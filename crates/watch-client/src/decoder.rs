//! Frame decoding for SSE bodies and WebSocket messages
//!
//! SSE chunks arrive with arbitrary boundaries, so [`SseDecoder`] buffers raw
//! bytes and only decodes complete records. WebSocket messages are whole JSON
//! objects and go straight through [`decode_message`]. Both share the same
//! payload rules.

use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{Event, EventKind};

/// One decoded unit handed to the transport driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(Event),
    /// The server ended the stream on purpose.
    Complete,
}

impl Frame {
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Event(event) if event.kind == EventKind::Error)
    }
}

/// Incremental decoder for one SSE connection attempt.
///
/// Line endings are normalized to `\n` as bytes arrive, so `\r\n` and a
/// lone `\r` both end a line even when split across chunks. Stops yielding
/// frames after a completion marker or an application error event; a fresh
/// decoder is built for each attempt.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a blank line.
    scanned: usize,
    after_cr: bool,
    halted: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Number of buffered bytes belonging to an incomplete record.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feeds one chunk and returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.halted {
            return frames;
        }

        self.append(chunk);

        let mut start = 0;
        let mut from = self.scanned.saturating_sub(1);
        while let Some(end) = find_blank_line(&self.buffer, from) {
            let halt = emit(&self.buffer[start..end], &mut frames);
            start = end + 2;
            from = start;
            if halt {
                self.halted = true;
                break;
            }
        }

        if self.halted {
            self.buffer.clear();
            self.scanned = 0;
        } else {
            self.buffer.drain(..start);
            self.scanned = self.buffer.len();
        }
        frames
    }

    /// Decodes a final record the server closed without terminating.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.halted || self.buffer.is_empty() {
            return frames;
        }

        let record = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        self.halted = emit(&record, &mut frames);
        frames
    }

    fn append(&mut self, chunk: &[u8]) {
        self.buffer.reserve(chunk.len());
        for &byte in chunk {
            match byte {
                b'\r' => {
                    self.buffer.push(b'\n');
                    self.after_cr = true;
                }
                b'\n' if self.after_cr => self.after_cr = false,
                _ => {
                    self.buffer.push(byte);
                    self.after_cr = false;
                }
            }
        }
    }
}

/// Decodes one record into `frames`; returns true if the stream should halt.
fn emit(record: &[u8], frames: &mut Vec<Frame>) -> bool {
    let Some(frame) = decode_record(record) else {
        return false;
    };

    let halt = frame == Frame::Complete || frame.is_error();
    frames.push(frame);
    halt
}

/// Start of the first `\n\n` at or after `from`.
fn find_blank_line(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|pair| pair == b"\n\n")
        .map(|pos| from + pos)
}

fn decode_record(record: &[u8]) -> Option<Frame> {
    let text = String::from_utf8_lossy(record);
    let mut data_lines: Vec<&str> = Vec::new();
    let mut last_id: Option<&str> = None;

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => data_lines.push(value),
            "id" => last_id = Some(value),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    let frame = interpret_payload(&data_lines.join("\n"))?;
    Some(match (frame, last_id) {
        (Frame::Event(mut event), Some(id)) if event.sequence.is_none() && !id.is_empty() => {
            event.sequence = Some(Value::String(id.to_string()));
            Frame::Event(event)
        }
        (frame, _) => frame,
    })
}

/// Decodes one whole WebSocket text message.
///
/// Liveness replies (`pong`, or a server-initiated `ping`) yield nothing.
pub fn decode_message(text: &str) -> Option<Frame> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Dropping malformed message: {} - {}", e, text);
            return None;
        }
    };

    if matches!(
        value.get("type").and_then(Value::as_str),
        Some("ping") | Some("pong")
    ) {
        debug!("Liveness message received");
        return None;
    }

    interpret_value(value, text)
}

fn interpret_payload(payload: &str) -> Option<Frame> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(Frame::Complete);
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => interpret_value(value, payload),
        Err(e) => {
            warn!("Dropping malformed frame: {} - {}", e, payload);
            None
        }
    }
}

fn interpret_value(value: Value, raw: &str) -> Option<Frame> {
    // `done` only marks the end on untyped payloads; typed events may carry
    // their own `done` flag.
    if value.get("type").is_none() && value.get("done").and_then(Value::as_bool) == Some(true) {
        return Some(Frame::Complete);
    }

    match Event::from_value(value) {
        Ok(event) if event.kind == EventKind::StreamComplete => Some(Frame::Complete),
        Ok(event) => {
            debug!("Decoded {} event", event.kind);
            Some(Frame::Event(event))
        }
        Err(e) => {
            warn!("Dropping undecodable frame: {} - {}", e, raw);
            None
        }
    }
}
