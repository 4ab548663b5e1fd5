//! Incremental decoder for the body of `GET /events`.
//!
//! Network reads are arbitrary slices of the byte stream: one read may carry
//! half a record or several records. Two wire shapes are understood.
//!
//! `text/event-stream` framing: bytes are split into lines (`\n`, `\r\n` or
//! `\r`) and a record is emitted on every blank line.
//! - `data:` lines are joined with `\n` and form the record payload
//! - `id:` updates the last event id (sent back as `Last-Event-ID`)
//! - `event:` names the record, `retry:` carries a reconnect hint in ms
//! - lines starting with `:` are comments
//! - any other line is kept verbatim
//!
//! Bare JSON: when a record starts with `{` or `[`, the decoder switches to
//! framing complete JSON values instead, so backends that write one object
//! per read, concatenated objects or NDJSON lines all yield one record per
//! value. Framing falls back to lines on the first byte that cannot start a
//! value.

use std::time::Duration;

use serde::de::IgnoredAny;

use crate::{domain::StreamFrame, errors::Error, Result};

/// Upper bound on buffered bytes for a single unterminated line or record.
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventRecord {
    pub event: Option<String>,
    pub id: Option<String>,
    pub payload: String,
}

impl EventRecord {
    fn bare(bytes: &[u8]) -> Self {
        Self {
            payload: String::from_utf8_lossy(bytes).trim().to_string(),
            ..Self::default()
        }
    }

    /// Parse the payload as a `{data?}` frame.
    pub fn frame(&self) -> Result<StreamFrame> {
        serde_json::from_str(&self.payload)
            .map_err(|e| Error::protocol(format!("undecodable event record: {e}")))
    }
}

#[derive(Debug, Default)]
struct PendingRecord {
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    raw: Vec<String>,
    bytes: usize,
}

impl PendingRecord {
    fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    fn take(&mut self) -> Option<EventRecord> {
        let pending = std::mem::take(self);
        let lines = if !pending.data.is_empty() {
            pending.data
        } else if !pending.raw.is_empty() {
            pending.raw
        } else {
            return None;
        };
        Some(EventRecord {
            event: pending.event,
            id: pending.id,
            payload: lines.join("\n"),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Framing {
    #[default]
    Lines,
    Json,
}

enum JsonStep {
    /// A complete value ends at this offset.
    Value(usize),
    Incomplete,
    Malformed,
}

fn next_json_value(buf: &[u8]) -> JsonStep {
    let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<IgnoredAny>();
    match values.next() {
        Some(Ok(_)) => JsonStep::Value(values.byte_offset()),
        Some(Err(e)) if e.is_eof() => JsonStep::Incomplete,
        Some(Err(_)) => JsonStep::Malformed,
        None => JsonStep::Incomplete,
    }
}

fn starts_json(b: u8) -> bool {
    matches!(b, b'{' | b'[')
}

fn is_line_end(b: &u8) -> bool {
    *b == b'\n' || *b == b'\r'
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no line terminator.
    scanned: usize,
    framing: Framing,
    /// Set when JSON framing stalled; holds the bytes that could unblock it.
    json_wait: Option<&'static [u8]>,
    pending: PendingRecord,
    last_event_id: Option<String>,
    retry_hint: Option<Duration>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a decoder that remembers the last event id of a previous connection.
    pub fn resume(last_event_id: Option<String>, retry_hint: Option<Duration>) -> Self {
        Self {
            last_event_id,
            retry_hint,
            ..Self::default()
        }
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn retry_hint(&self) -> Option<Duration> {
        self.retry_hint
    }

    /// Feed one network read and return every record it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<EventRecord>> {
        let mut skip_json = self
            .json_wait
            .is_some_and(|wanted| !chunk.iter().any(|b| wanted.contains(b)));
        self.json_wait = None;
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut start = 0;
        loop {
            match self.framing {
                Framing::Lines => {
                    if self.pending.is_empty()
                        && self.scanned <= start
                        && self.buf.get(start).copied().is_some_and(starts_json)
                    {
                        self.framing = Framing::Json;
                        continue;
                    }

                    let from = self.scanned.max(start);
                    let Some(pos) = self.buf[from..].iter().position(is_line_end).map(|p| from + p)
                    else {
                        self.scanned = self.buf.len();
                        break;
                    };
                    let next = if self.buf[pos] == b'\r' {
                        match self.buf.get(pos + 1) {
                            // Wait for the next read to know whether `\n` follows.
                            None => {
                                self.scanned = pos;
                                break;
                            }
                            Some(b'\n') => pos + 2,
                            Some(_) => pos + 1,
                        }
                    } else {
                        pos + 1
                    };

                    let line = String::from_utf8_lossy(&self.buf[start..pos]).into_owned();
                    start = next;
                    self.scanned = next;
                    match self.process_line(line) {
                        Ok(Some(record)) => out.push(record),
                        Ok(None) => {}
                        Err(e) => {
                            self.reset_buffer();
                            return Err(e);
                        }
                    }
                }
                Framing::Json => {
                    while self.buf.get(start).is_some_and(u8::is_ascii_whitespace) {
                        start += 1;
                    }
                    let Some(&first) = self.buf.get(start) else {
                        break;
                    };
                    if !starts_json(first) {
                        self.framing = Framing::Lines;
                        self.scanned = start;
                        continue;
                    }
                    if skip_json {
                        self.json_wait = Some(b"}]");
                        break;
                    }

                    match next_json_value(&self.buf[start..]) {
                        JsonStep::Value(len) => {
                            out.push(EventRecord::bare(&self.buf[start..start + len]));
                            start += len;
                        }
                        JsonStep::Incomplete => {
                            self.json_wait = Some(b"}]");
                            break;
                        }
                        // Hand the offending line over as a record; it fails to
                        // parse as a frame and gets reported there.
                        JsonStep::Malformed => {
                            match self.buf[start..].iter().position(is_line_end) {
                                Some(len) => {
                                    out.push(EventRecord::bare(&self.buf[start..start + len]));
                                    start += len + 1;
                                }
                                None => {
                                    self.json_wait = Some(b"\n\r");
                                    break;
                                }
                            }
                        }
                    }
                    skip_json = false;
                }
            }
        }

        self.buf.drain(..start);
        self.scanned = self.scanned.saturating_sub(start);

        if self.buf.len() > MAX_RECORD_BYTES {
            self.reset_buffer();
            return Err(Error::protocol(format!(
                "event stream record exceeds {MAX_RECORD_BYTES} bytes"
            )));
        }
        Ok(out)
    }

    /// Flush whatever is left once the stream ended or stalled.
    pub fn finish(&mut self) -> Result<Option<EventRecord>> {
        let mut rest = std::mem::take(&mut self.buf);
        let framing = self.framing;
        self.reset_buffer();

        if framing == Framing::Json {
            let record = EventRecord::bare(&rest);
            return Ok((!record.payload.is_empty()).then_some(record));
        }

        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        if !rest.is_empty() {
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(record) = self.process_line(line)? {
                return Ok(Some(record));
            }
        }
        Ok(self.pending.take())
    }

    fn reset_buffer(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.framing = Framing::Lines;
        self.json_wait = None;
    }

    fn process_line(&mut self, line: String) -> Result<Option<EventRecord>> {
        if line.is_empty() {
            return Ok(self.pending.take());
        }
        if line.starts_with(':') {
            return Ok(None);
        }

        self.pending.bytes += line.len();
        if self.pending.bytes > MAX_RECORD_BYTES {
            self.pending = PendingRecord::default();
            return Err(Error::protocol(format!(
                "event record exceeds {MAX_RECORD_BYTES} bytes"
            )));
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };

        match name {
            "data" => self.pending.data.push(value.to_string()),
            "event" => self.pending.event = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.pending.id = Some(value.to_string());
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    self.retry_hint = Some(Duration::from_millis(ms));
                }
            }
            _ => self.pending.raw.push(line),
        }
        Ok(None)
    }
}
