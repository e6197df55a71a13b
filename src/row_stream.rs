//! Streaming row parser: turns an HTTP response body into a metadata
//! header, a lazy finite sequence of row strings, and a metadata trailer,
//! while bounding buffered bytes.
//!
//! The lexer is keyed off a JSON-pointer-like path naming the rows array
//! (`/results/^`, `^` is the array wildcard). Bytes are fed incrementally;
//! parsing pauses and waits for more input whenever a value is not yet
//! fully buffered, so the lexer never assumes the whole body is present
//! up front (the one exception, noted where it matters, is that bytes
//! already delivered are kept until their row has been emitted -- the
//! *channel* enforces the backpressure bound, not a
//! hard byte ceiling on the scan buffer itself).

use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind, Result};

const ROW_CHANNEL_CAPACITY: usize = 100;
const BACKPRESSURE_HIGH_WATER: usize = 75; // percent

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Wildcard,
}

#[derive(Debug, Clone)]
pub struct JsonPointer(pub Vec<PathSegment>);

impl JsonPointer {
    /// Parses `/results/^`-style expressions.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.strip_prefix('/').unwrap_or(expr);
        if expr.is_empty() {
            return Err(Error::new(ErrorKind::LexerBadJsonPointer, "empty pointer"));
        }
        let segments = expr
            .split('/')
            .map(|s| {
                if s == "^" {
                    PathSegment::Wildcard
                } else {
                    PathSegment::Key(s.to_string())
                }
            })
            .collect();
        Ok(JsonPointer(segments))
    }
}

#[derive(Debug)]
pub enum RowEvent {
    Header(String),
    Row(String),
    Trailer(String),
}

/// Byte-level scanner. Internal; `RowParser` drives it across chunk
/// boundaries.
struct Scanner {
    buf: Vec<u8>,
    pos: usize,
}

enum Need {
    MoreData,
}

impl Scanner {
    fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn skip_ws(&mut self) {
        while self.pos < self.buf.len() && (self.buf[self.pos] as char).is_whitespace() {
            self.pos += 1;
        }
    }

    /// Advances past one complete JSON value starting at the current
    /// position (after skipping leading whitespace). Returns `Need::MoreData`
    /// if the buffer runs out mid-value.
    fn skip_value(&mut self) -> std::result::Result<std::result::Result<(), Need>, Error> {
        self.skip_ws();
        if self.pos >= self.buf.len() {
            return Ok(Err(Need::MoreData));
        }
        match self.buf[self.pos] {
            b'{' | b'[' => self.skip_container(),
            b'"' => self.skip_string(),
            b't' | b'f' | b'n' => self.skip_literal(),
            b'-' | b'0'..=b'9' => self.skip_number(),
            other => Err(Error::new(
                ErrorKind::LexerStrayToken,
                format!("unexpected byte '{}' at {}", other as char, self.pos),
            )),
        }
    }

    fn skip_container(&mut self) -> std::result::Result<std::result::Result<(), Need>, Error> {
        let open = self.buf[self.pos];
        let close = if open == b'{' { b'}' } else { b']' };
        let mut depth = 0usize;
        let mut i = self.pos;
        let mut in_string = false;
        let mut escape = false;
        loop {
            if i >= self.buf.len() {
                return Ok(Err(Need::MoreData));
            }
            let b = self.buf[i];
            if in_string {
                if escape {
                    escape = false;
                } else if b == b'\\' {
                    escape = true;
                } else if b == b'"' {
                    in_string = false;
                }
            } else {
                match b {
                    b'"' => in_string = true,
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            self.pos = i + 1;
                            let _ = close; // matched by construction
                            return Ok(Ok(()));
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
    }

    fn skip_string(&mut self) -> std::result::Result<std::result::Result<(), Need>, Error> {
        let mut i = self.pos + 1;
        let mut escape = false;
        loop {
            if i >= self.buf.len() {
                return Ok(Err(Need::MoreData));
            }
            let b = self.buf[i];
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                self.pos = i + 1;
                return Ok(Ok(()));
            }
            i += 1;
        }
    }

    fn skip_literal(&mut self) -> std::result::Result<std::result::Result<(), Need>, Error> {
        for lit in [&b"true"[..], &b"false"[..], &b"null"[..]] {
            if self.remaining().len() >= lit.len() && &self.remaining()[..lit.len()] == *lit {
                self.pos += lit.len();
                return Ok(Ok(()));
            }
            if self.remaining().len() < lit.len() && lit.starts_with(self.remaining()) {
                return Ok(Err(Need::MoreData));
            }
        }
        Err(Error::new(ErrorKind::LexerStrayToken, "invalid literal"))
    }

    fn skip_number(&mut self) -> std::result::Result<std::result::Result<(), Need>, Error> {
        let start = self.pos;
        let mut i = self.pos;
        while i < self.buf.len()
            && matches!(self.buf[i], b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')
        {
            i += 1;
        }
        if i == self.buf.len() {
            // Could still be mid-number; ask for more unless we're at EOF
            // (caller decides via `finish`).
            return Ok(Err(Need::MoreData));
        }
        if i == start {
            return Err(Error::new(ErrorKind::LexerStrayToken, "empty number"));
        }
        self.pos = i;
        Ok(Ok(()))
    }
}

/// Parses one array element and returns its raw byte range, or
/// `Need::MoreData`.
fn scan_array_element(scanner: &mut Scanner) -> std::result::Result<std::result::Result<(usize, usize), Need>, Error> {
    scanner.skip_ws();
    let start = scanner.pos;
    match scanner.skip_value()? {
        Err(Need::MoreData) => Ok(Err(Need::MoreData)),
        Ok(()) => Ok(Ok((start, scanner.pos))),
    }
}

enum Phase {
    /// Looking for the rows array, descending through `segments[cursor..]`.
    Seeking { cursor: usize, depth_stack: Vec<u8> },
    /// Inside the rows array; `first` tracks whether a comma is expected
    /// before the next element.
    InArray { depth_stack: Vec<u8>, first: bool },
    Trailing,
    Done,
}

/// Drives the byte scanner across chunk boundaries and emits `RowEvent`s.
pub struct RowParser {
    scanner: Scanner,
    pointer: JsonPointer,
    phase: Phase,
    header_emitted: bool,
    eof: bool,
}

impl RowParser {
    pub fn new(pointer: JsonPointer) -> Self {
        RowParser {
            scanner: Scanner {
                buf: Vec::new(),
                pos: 0,
            },
            pointer,
            phase: Phase::Seeking {
                cursor: 0,
                depth_stack: Vec::new(),
            },
            header_emitted: false,
            eof: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.scanner.buf.extend_from_slice(chunk);
    }

    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// Advances as far as possible, emitting events. Call repeatedly after
    /// each `feed`; stops (without error) when more input is needed.
    pub fn advance(&mut self, events: &mut Vec<RowEvent>) -> Result<()> {
        loop {
            match &mut self.phase {
                Phase::Seeking { cursor, depth_stack } => {
                    if *cursor == 0 && depth_stack.is_empty() {
                        self.scanner.skip_ws();
                        if self.scanner.pos >= self.scanner.buf.len() {
                            if self.eof {
                                return Err(Error::new(ErrorKind::LexerGarbageTrailing, "empty body"));
                            }
                            return Ok(());
                        }
                        if self.scanner.buf[self.scanner.pos] != b'{' {
                            return Err(Error::new(ErrorKind::LexerStrayToken, "expected root object"));
                        }
                        self.scanner.pos += 1;
                        depth_stack.push(b'{');
                    }

                    let segments = self.pointer.0.clone();
                    let cursor_val = *cursor;
                    match self.seek_key(&segments, cursor_val)? {
                        Err(Need::MoreData) => {
                            if self.eof {
                                return Err(Error::new(
                                    ErrorKind::LexerGarbageTrailing,
                                    "body ended before rows array was found",
                                ));
                            }
                            return Ok(());
                        }
                        Ok(SeekOutcome::FoundArray) => {
                            // scanner.pos is right after the '[' of the target array.
                            let header_end = self.scanner.pos;
                            let mut closer = String::from("]");
                            let depth_stack = match &self.phase {
                                Phase::Seeking { depth_stack, .. } => depth_stack.clone(),
                                _ => unreachable!(),
                            };
                            for d in depth_stack.iter().rev() {
                                closer.push(if *d == b'{' { '}' } else { ']' });
                            }
                            let header = String::from_utf8_lossy(&self.scanner.buf[..header_end]).to_string()
                                + &closer;
                            events.push(RowEvent::Header(header));
                            self.header_emitted = true;
                            self.phase = Phase::InArray {
                                depth_stack,
                                first: true,
                            };
                        }
                        Ok(SeekOutcome::Advance(new_cursor)) => {
                            *cursor = new_cursor;
                        }
                    }
                }
                Phase::InArray { first, .. } => {
                    self.scanner.skip_ws();
                    if self.scanner.pos >= self.scanner.buf.len() {
                        if self.eof {
                            return Err(Error::new(ErrorKind::LexerGarbageTrailing, "array not closed"));
                        }
                        return Ok(());
                    }
                    if self.scanner.buf[self.scanner.pos] == b']' {
                        self.scanner.pos += 1;
                        self.phase = Phase::Trailing;
                        continue;
                    }
                    if !*first {
                        if self.scanner.buf[self.scanner.pos] != b',' {
                            return Err(Error::new(ErrorKind::LexerStrayToken, "expected ',' between rows"));
                        }
                        self.scanner.pos += 1;
                        self.scanner.skip_ws();
                    }
                    match scan_array_element(&mut self.scanner)? {
                        Err(Need::MoreData) => {
                            if self.eof {
                                return Err(Error::new(ErrorKind::LexerGarbageTrailing, "row truncated"));
                            }
                            return Ok(());
                        }
                        Ok((start, end)) => {
                            let row = String::from_utf8_lossy(&self.scanner.buf[start..end]).to_string();
                            events.push(RowEvent::Row(row));
                            if let Phase::InArray { first, .. } = &mut self.phase {
                                *first = false;
                            }
                        }
                    }
                }
                Phase::Trailing => {
                    if self.eof {
                        let trailer =
                            String::from_utf8_lossy(&self.scanner.buf[self.scanner.pos..]).to_string();
                        events.push(RowEvent::Trailer(trailer));
                        self.phase = Phase::Done;
                        return Ok(());
                    }
                    return Ok(());
                }
                Phase::Done => return Ok(()),
            }
        }
    }

    fn seek_key(
        &mut self,
        segments: &[PathSegment],
        cursor: usize,
    ) -> std::result::Result<std::result::Result<SeekOutcome, Need>, Error> {
        self.scanner.skip_ws();
        if self.scanner.pos >= self.scanner.buf.len() {
            return Ok(Err(Need::MoreData));
        }
        if self.scanner.buf[self.scanner.pos] == b'}' {
            return Err(Error::new(
                ErrorKind::LexerBadJsonPointer,
                "rows array not found before object closed",
            ));
        }
        if self.scanner.buf[self.scanner.pos] == b',' {
            self.scanner.pos += 1;
            self.scanner.skip_ws();
        }
        if self.scanner.pos >= self.scanner.buf.len() {
            return Ok(Err(Need::MoreData));
        }
        if self.scanner.buf[self.scanner.pos] != b'"' {
            return Err(Error::new(ErrorKind::LexerStrayToken, "expected object key"));
        }
        let key_start = self.scanner.pos;
        match self.scanner.skip_string()? {
            Err(Need::MoreData) => {
                self.scanner.pos = key_start;
                return Ok(Err(Need::MoreData));
            }
            Ok(()) => {}
        }
        let key_end = self.scanner.pos;
        let key = String::from_utf8_lossy(&self.scanner.buf[key_start + 1..key_end - 1]).to_string();

        self.scanner.skip_ws();
        if self.scanner.pos >= self.scanner.buf.len() || self.scanner.buf[self.scanner.pos] != b':' {
            return Ok(Err(Need::MoreData));
        }
        self.scanner.pos += 1;

        let target_key = match segments.get(cursor) {
            Some(PathSegment::Key(k)) => k.clone(),
            _ => {
                return Err(Error::new(
                    ErrorKind::LexerBadJsonPointer,
                    "pointer does not name an object key here",
                ))
            }
        };
        let is_last_before_wildcard = segments
            .get(cursor + 1)
            .map(|s| *s == PathSegment::Wildcard)
            .unwrap_or(false);

        if key == target_key && is_last_before_wildcard {
            self.scanner.skip_ws();
            if self.scanner.pos >= self.scanner.buf.len() {
                self.scanner.pos = key_start;
                return Ok(Err(Need::MoreData));
            }
            if self.scanner.buf[self.scanner.pos] != b'[' {
                return Err(Error::new(ErrorKind::LexerBadJsonPointer, "pointer target is not an array"));
            }
            self.scanner.pos += 1;
            return Ok(Ok(SeekOutcome::FoundArray));
        }

        if key == target_key {
            // Descend: value must be an object.
            self.scanner.skip_ws();
            if self.scanner.pos >= self.scanner.buf.len() {
                self.scanner.pos = key_start;
                return Ok(Err(Need::MoreData));
            }
            if self.scanner.buf[self.scanner.pos] != b'{' {
                return Err(Error::new(ErrorKind::LexerBadJsonPointer, "pointer descends into a non-object"));
            }
            self.scanner.pos += 1;
            if let Phase::Seeking { depth_stack, .. } = &mut self.phase {
                depth_stack.push(b'{');
            }
            return Ok(Ok(SeekOutcome::Advance(cursor + 1)));
        }

        // Not on our path: skip the value and keep scanning this object's keys.
        match self.scanner.skip_value()? {
            Err(Need::MoreData) => {
                self.scanner.pos = key_start;
                Ok(Err(Need::MoreData))
            }
            Ok(()) => Ok(Ok(SeekOutcome::Advance(cursor))),
        }
    }
}

enum SeekOutcome {
    FoundArray,
    Advance(usize),
}

/// Async driver: feeds a byte stream into a `RowParser` and publishes rows
/// through a bounded channel, pausing consumption once the channel is
/// `BACKPRESSURE_HIGH_WATER`% full.
pub struct RowStreamer {
    pointer: JsonPointer,
}

impl RowStreamer {
    pub fn new(pointer_expr: &str) -> Result<Self> {
        Ok(RowStreamer {
            pointer: JsonPointer::parse(pointer_expr)?,
        })
    }

    /// Runs the parser over `body_chunks`, sending each event to `tx`.
    /// `header_ready` is signaled once via the returned oneshot-like first
    /// event on the channel itself (`RowEvent::Header`).
    pub async fn run(
        &self,
        mut body_chunks: impl futures::Stream<Item = Result<bytes::Bytes>> + Unpin,
        tx: mpsc::Sender<Result<RowEvent>>,
    ) {
        use futures::StreamExt;

        let mut parser = RowParser::new(self.pointer.clone());
        loop {
            let high_water = ROW_CHANNEL_CAPACITY * BACKPRESSURE_HIGH_WATER / 100;
            if tx.capacity() <= ROW_CHANNEL_CAPACITY - high_water {
                // Channel is at/above the high-water mark; yield so the
                // consumer can drain before we pull more body bytes.
                tokio::task::yield_now().await;
            }

            match body_chunks.next().await {
                Some(Ok(chunk)) => {
                    parser.feed(&chunk);
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                None => {
                    parser.finish();
                    let mut events = Vec::new();
                    if let Err(e) = parser.advance(&mut events) {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    for ev in events {
                        if tx.send(Ok(ev)).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
            }

            let mut events = Vec::new();
            if let Err(e) = parser.advance(&mut events) {
                let _ = tx.send(Err(e)).await;
                return;
            }
            for ev in events {
                if tx.send(Ok(ev)).await.is_err() {
                    return;
                }
            }
        }
    }
}

impl JsonPointer {
    fn clone(&self) -> Self {
        JsonPointer(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_full(body: &str, pointer: &str) -> Vec<RowEvent> {
        let mut parser = RowParser::new(JsonPointer::parse(pointer).unwrap());
        parser.feed(body.as_bytes());
        parser.finish();
        let mut events = Vec::new();
        parser.advance(&mut events).unwrap();
        events
    }

    #[test]
    fn mixed_type_array_splits_into_header_rows_and_trailer() {
        let body = r#"{"meta":{"count":5},"results":[42,"43",44,[3.14,null,false],true]}"#;
        let events = run_full(body, "/results/^");

        let header = match &events[0] {
            RowEvent::Header(h) => h.clone(),
            _ => panic!("expected header first"),
        };
        assert_eq!(header, r#"{"meta":{"count":5},"results":[]}"#);

        let rows: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                RowEvent::Row(r) => Some(r.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(rows, vec!["42", "\"43\"", "44", "[3.14,null,false]", "true"]);

        let trailer = match events.last().unwrap() {
            RowEvent::Trailer(t) => t.clone(),
            _ => panic!("expected trailer last"),
        };
        assert_eq!(trailer, "}");
    }

    #[test]
    fn byte_complete_reconstruction() {
        let body = r#"{"meta":{"count":2},"results":[1,2]}"#;
        let events = run_full(body, "/results/^");
        let header = match &events[0] {
            RowEvent::Header(h) => h.clone(),
            _ => panic!(),
        };
        let rows: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                RowEvent::Row(r) => Some(r.clone()),
                _ => None,
            })
            .collect();
        let trailer = match events.last().unwrap() {
            RowEvent::Trailer(t) => t.clone(),
            _ => panic!(),
        };
        // header ends with "[]}" -- strip the synthetic empty-array close
        // before reassembling, to check the whole thing still round-trips through a JSON parser.
        let header_prefix = &header[..header.len() - 2];
        let reconstructed = format!("{header_prefix}{}]{trailer}", rows.join(","));
        let original: serde_json::Value = serde_json::from_str(body).unwrap();
        let round_tripped: serde_json::Value = serde_json::from_str(&reconstructed).unwrap();
        assert_eq!(original, round_tripped);
    }

    #[test]
    fn incremental_feed_across_chunk_boundaries() {
        let body = r#"{"results":[1,2,3]}"#;
        let mut parser = RowParser::new(JsonPointer::parse("/results/^").unwrap());
        let mut events = Vec::new();
        for byte in body.bytes() {
            parser.feed(&[byte]);
            parser.advance(&mut events).unwrap();
        }
        parser.finish();
        parser.advance(&mut events).unwrap();

        let rows: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                RowEvent::Row(r) => Some(r.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(rows, vec!["1", "2", "3"]);
    }

    #[test]
    fn truncated_body_mid_row_is_garbage_trailing() {
        let body = r#"{"results":[1,2"#;
        let mut parser = RowParser::new(JsonPointer::parse("/results/^").unwrap());
        parser.feed(body.as_bytes());
        parser.finish();
        let mut events = Vec::new();
        let err = parser.advance(&mut events).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LexerGarbageTrailing);
    }

    #[test]
    fn bad_pointer_reports_bad_json_pointer() {
        let body = r#"{"rows":[1,2]}"#;
        let events_err = {
            let mut parser = RowParser::new(JsonPointer::parse("/results/^").unwrap());
            parser.feed(body.as_bytes());
            parser.finish();
            let mut events = Vec::new();
            parser.advance(&mut events)
        };
        assert_eq!(events_err.unwrap_err().kind(), ErrorKind::LexerBadJsonPointer);
    }
}
