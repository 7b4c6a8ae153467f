//! Incremental parser for the `text/event-stream` wire format.
//!
//! Network reads arrive in arbitrary fragments: a record, a field name, or
//! even the `:` separator may be split across reads. [`SseCodec`] keeps the
//! undelimited tail in a [`BytesMut`] and only emits a record once its
//! terminating blank line has arrived.
//!
//! # Field handling
//!
//! | Line                | Effect                                        |
//! |---------------------|-----------------------------------------------|
//! | `event: <type>`     | Record type, last write wins                  |
//! | `data: <text>`      | Appended, successive lines joined with `\n`   |
//! | `id: <marker>`      | Resumption marker, last write wins            |
//! | `retry: <millis>`   | Server-advised reconnect delay (digits only)  |
//! | `: <anything>`      | Comment, ignored                              |
//! | *(other field)*     | Ignored; logged at `TRACE`                    |
//!
//! A record whose accumulated `data` is empty is dropped without being
//! yielded.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{trace, warn};

use crate::{AppError, Result};

/// Maximum size of one undelimited record: 1 MiB.
///
/// A record that grows past this limit before its blank-line delimiter is
/// discarded with [`AppError::Parse`]; parsing resumes after the next
/// delimiter.
pub const MAX_EVENT_BYTES: usize = 1_048_576;

/// Record type used when a record carries no `event` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One decoded stream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Record type (`message` when absent).
    pub event: String,
    /// Payload, multi-line data joined with `\n`.
    pub data: String,
    /// Resumption marker, if the record carried one.
    pub id: Option<String>,
    /// Server-advised reconnect delay in milliseconds.
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Build a record of the default type with the given payload.
    #[must_use]
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: DEFAULT_EVENT_TYPE.to_owned(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }
}

/// Streaming record parser.
///
/// Use [`feed`](Self::feed) when driving it from raw chunks, or plug it into
/// [`tokio_util::codec::FramedRead`] as a [`Decoder`].
///
/// # Examples
///
/// ```rust
/// use mcp_sse_client::sse::codec::SseCodec;
///
/// let mut codec = SseCodec::new();
/// assert!(codec.feed(b"event: endpoint\nda").is_empty());
/// let events = codec.feed(b"ta: /message?sessionId=abc\n\n");
/// assert_eq!(events[0].event, "endpoint");
/// assert_eq!(events[0].data, "/message?sessionId=abc");
/// ```
#[derive(Debug, Default)]
pub struct SseCodec {
    /// Bytes received through `feed` that do not yet form a full record.
    pending: BytesMut,
    /// Offset from which the next delimiter search resumes.
    scan_from: usize,
    /// Set after an oversized record was dropped, until its delimiter is seen.
    discarding: bool,
}

impl SseCodec {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every record it completes, in order.
    ///
    /// Malformed blocks (invalid UTF-8, oversized records) are logged and
    /// skipped; they never poison later records.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut pending = std::mem::take(&mut self.pending);
        pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            match self.decode(&mut pending) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => break,
                Err(err) => warn!(error = %err, "sse codec: discarding malformed record"),
            }
        }

        self.pending = pending;
        events
    }

    /// Number of bytes held while waiting for a record delimiter.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial record, e.g. before reading a fresh connection.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.scan_from = 0;
        self.discarding = false;
    }
}

impl Decoder for SseCodec {
    type Item = SseEvent;
    type Error = AppError;

    /// Decode the next complete record from `src`.
    ///
    /// Returns `Ok(None)` while no delimiter is buffered. A block that is
    /// not valid UTF-8 is removed from `src` before the error is returned, so
    /// calling `decode` again continues with the following record.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SseEvent>> {
        loop {
            let start = self.scan_from.min(src.len());
            let Some((end, delimiter_len)) = find_delimiter(&src[start..])
                .map(|(end, len)| (start + end, len))
            else {
                return self.await_more(src);
            };

            let block = src.split_to(end);
            src.advance(delimiter_len);
            self.scan_from = 0;

            if self.discarding {
                self.discarding = false;
                trace!("sse codec: resynchronized after oversized record");
                continue;
            }

            let text = std::str::from_utf8(&block)
                .map_err(|e| AppError::Parse(format!("record is not valid utf-8: {e}")))?;

            if let Some(event) = parse_block(text) {
                return Ok(Some(event));
            }
        }
    }

    /// An unterminated record at end of stream is incomplete and discarded.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SseEvent>> {
        let decoded = self.decode(src)?;
        if decoded.is_none() && !src.is_empty() {
            trace!(bytes = src.len(), "sse codec: dropping unterminated record at eof");
            src.clear();
            self.scan_from = 0;
        }
        Ok(decoded)
    }
}

impl SseCodec {
    /// No delimiter buffered: enforce the size limit and remember where to
    /// resume scanning.
    fn await_more(&mut self, src: &mut BytesMut) -> Result<Option<SseEvent>> {
        if self.discarding || src.len() > MAX_EVENT_BYTES {
            // Keep the last two bytes: they may be the start of a delimiter
            // that completes in the next read.
            let keep = src.len().min(2);
            src.advance(src.len() - keep);
            self.scan_from = 0;
            if !self.discarding {
                self.discarding = true;
                return Err(AppError::Parse(format!(
                    "record exceeded {MAX_EVENT_BYTES} bytes without a delimiter"
                )));
            }
            return Ok(None);
        }

        self.scan_from = src.len().saturating_sub(2);
        Ok(None)
    }
}

/// Locate the first blank-line delimiter in `buf`.
///
/// Returns the offset of the byte that ends the record block and the length
/// of the delimiter that follows it. Accepted delimiters are `\n\n` and
/// `\n\r\n` (the latter covers `\r\n\r\n`, whose leading `\r` stays with the
/// block and is stripped during line splitting).
fn find_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Split one record block into fields.
fn parse_block(text: &str) -> Option<SseEvent> {
    let mut event_type: Option<String> = None;
    let mut data = String::new();
    let mut seen_data = false;
    let mut id: Option<String> = None;
    let mut retry: Option<u64> = None;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => event_type = Some(value.to_owned()),
            "data" => {
                if seen_data {
                    data.push('\n');
                }
                data.push_str(value);
                seen_data = true;
            }
            // A NUL inside the marker makes it unusable as a header value.
            "id" if !value.contains('\0') => id = Some(value.to_owned()),
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                retry = value.parse().ok();
            }
            other => trace!(field = other, "sse codec: ignoring field"),
        }
    }

    if data.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_owned()),
        data,
        id,
        retry,
    })
}
