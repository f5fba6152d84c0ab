//! Push parser for HTTP/1.1 messages.
//!
//! Fed arbitrary byte chunks, yields a stream of events: one `Head` per
//! message, zero or more `Body` chunks, a `Done` carrying trailers, or a
//! terminal `Error`. The internal buffer holds at most one unparsed
//! message prefix plus whatever body bytes arrived with it; body bytes
//! are split off as they are consumed, so a body is never retained
//! whole.

use std::mem;

use bytes::{Bytes, BytesMut};
use log::trace;

use crate::http::error::ProtocolError;
use crate::http::headers::Headers;
use crate::http::{StartLine, Version};

/// Upper bound on a start-line plus header block (and on a trailer
/// block). Exceeding it is `oversized-headers`.
pub(crate) const MAX_HEADER_BLOCK: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Request,
    Response,
}

/// How the body of the current message is delimited.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Framing {
    /// No body at all: 1xx/204/304 responses and responses to HEAD.
    Empty,
    /// Exactly this many bytes follow the header block.
    Sized(u64),
    /// Chunked transfer coding, possibly with trailers.
    Chunked,
    /// Body runs to EOF; the connection cannot be reused after it.
    Eof,
}

pub(crate) struct Head {
    pub line: StartLine,
    pub headers: Headers,
    pub framing: Framing,
}

pub(crate) enum ParseEvent {
    Head(Head),
    Body(Bytes),
    Done { trailers: Headers },
    Error(ProtocolError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    Body(u64),
    BodyEof,
    ChunkSize,
    ChunkBody(u64),
    ChunkBodyEnd,
    Trailers,
    Errored,
}

pub(crate) struct Parser {
    role: Role,
    state: State,
    buf: BytesMut,
    line: Option<StartLine>,
    headers: Headers,
    trailers: Headers,
    header_bytes: usize,
    head_request: bool,
    error: Option<ProtocolError>,
}

impl Parser {
    pub fn new(role: Role) -> Parser {
        Parser {
            role,
            state: State::StartLine,
            buf: BytesMut::new(),
            line: None,
            headers: Headers::new(),
            trailers: Headers::new(),
            header_bytes: 0,
            head_request: false,
            error: None,
        }
    }

    /// Marks the next response as answering a HEAD request, which makes
    /// its body empty whatever the headers claim.
    pub fn set_head_request(&mut self, yes: bool) {
        self.head_request = yes;
    }

    /// Between messages with nothing buffered — the state a connection
    /// must be in before it may go back to a pool.
    pub fn is_clean(&self) -> bool {
        self.state == State::StartLine && self.buf.is_empty() && self.error.is_none()
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feeds a chunk and returns every event it completes. After an
    /// `Error` event the parser is inert; further feeds return nothing.
    pub fn feed(&mut self, input: &[u8]) -> Vec<ParseEvent> {
        if self.error.is_some() {
            return Vec::new();
        }
        self.buf.extend_from_slice(input);
        self.drive()
    }

    /// Signals end-of-stream: resolves an EOF-delimited body, is silent
    /// at a clean message boundary, and is `unexpected-eof` anywhere
    /// else.
    pub fn eof(&mut self) -> Vec<ParseEvent> {
        if self.error.is_some() {
            return Vec::new();
        }

        match self.state {
            State::BodyEof => {
                let mut events = Vec::new();
                if !self.buf.is_empty() {
                    let len = self.buf.len();
                    events.push(ParseEvent::Body(self.buf.split_to(len).freeze()));
                }
                events.push(ParseEvent::Done {
                    trailers: Headers::new(),
                });
                self.reset_message();
                events
            }
            State::StartLine if self.buf.iter().all(|&b| b == b'\r' || b == b'\n') => Vec::new(),
            _ => {
                let mut events = Vec::new();
                self.fail(&mut events, ProtocolError::UnexpectedEof);
                events
            }
        }
    }

    fn drive(&mut self) -> Vec<ParseEvent> {
        let mut events = Vec::new();

        'drive: loop {
            match self.state {
                State::StartLine => match self.take_line() {
                    None => {
                        if self.buf.len() > MAX_HEADER_BLOCK {
                            self.fail(&mut events, ProtocolError::OversizedHeaders);
                        }
                        break 'drive;
                    }
                    // stray blank lines ahead of a start-line are legal
                    Some((line, _)) if line.is_empty() => continue,
                    Some((line, _)) => {
                        self.header_bytes = line.len() + 2;
                        match self.parse_start_line(&line) {
                            Ok(parsed) => {
                                self.line = Some(parsed);
                                self.state = State::Headers;
                            }
                            Err(e) => {
                                self.fail(&mut events, e);
                                break 'drive;
                            }
                        }
                    }
                },

                State::Headers => match self.take_line() {
                    None => {
                        if self.header_bytes + self.buf.len() > MAX_HEADER_BLOCK {
                            self.fail(&mut events, ProtocolError::OversizedHeaders);
                        }
                        break 'drive;
                    }
                    Some((line, _)) => {
                        self.header_bytes += line.len() + 2;
                        if self.header_bytes > MAX_HEADER_BLOCK {
                            self.fail(&mut events, ProtocolError::OversizedHeaders);
                            break 'drive;
                        }

                        if line.is_empty() {
                            if let Err(e) = self.finish_head(&mut events) {
                                self.fail(&mut events, e);
                                break 'drive;
                            }
                        } else if let Err(e) = push_header_line(&mut self.headers, &line) {
                            self.fail(&mut events, e);
                            break 'drive;
                        }
                    }
                },

                State::Body(remaining) => {
                    if self.buf.is_empty() {
                        break 'drive;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let left = remaining - take as u64;
                    events.push(ParseEvent::Body(self.buf.split_to(take).freeze()));
                    if left == 0 {
                        events.push(ParseEvent::Done {
                            trailers: Headers::new(),
                        });
                        self.reset_message();
                    } else {
                        self.state = State::Body(left);
                        break 'drive;
                    }
                }

                State::BodyEof => {
                    if !self.buf.is_empty() {
                        let len = self.buf.len();
                        events.push(ParseEvent::Body(self.buf.split_to(len).freeze()));
                    }
                    break 'drive;
                }

                State::ChunkSize => match self.take_line() {
                    None => {
                        if self.buf.len() > MAX_CHUNK_LINE {
                            self.fail(&mut events, ProtocolError::ChunkError);
                        }
                        break 'drive;
                    }
                    Some((line, had_cr)) => {
                        if !had_cr || line.len() > MAX_CHUNK_LINE {
                            self.fail(&mut events, ProtocolError::ChunkError);
                            break 'drive;
                        }
                        match parse_chunk_size(&line) {
                            Ok(0) => {
                                self.header_bytes = 0;
                                self.state = State::Trailers;
                            }
                            Ok(n) => self.state = State::ChunkBody(n),
                            Err(e) => {
                                self.fail(&mut events, e);
                                break 'drive;
                            }
                        }
                    }
                },

                State::ChunkBody(remaining) => {
                    if self.buf.is_empty() {
                        break 'drive;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let left = remaining - take as u64;
                    events.push(ParseEvent::Body(self.buf.split_to(take).freeze()));
                    if left == 0 {
                        self.state = State::ChunkBodyEnd;
                    } else {
                        self.state = State::ChunkBody(left);
                        break 'drive;
                    }
                }

                State::ChunkBodyEnd => {
                    if self.buf.len() < 2 {
                        break 'drive;
                    }
                    let delim = self.buf.split_to(2);
                    if &delim[..] != b"\r\n" {
                        self.fail(&mut events, ProtocolError::ChunkError);
                        break 'drive;
                    }
                    self.state = State::ChunkSize;
                }

                State::Trailers => match self.take_line() {
                    None => {
                        if self.header_bytes + self.buf.len() > MAX_HEADER_BLOCK {
                            self.fail(&mut events, ProtocolError::OversizedHeaders);
                        }
                        break 'drive;
                    }
                    Some((line, _)) => {
                        self.header_bytes += line.len() + 2;
                        if self.header_bytes > MAX_HEADER_BLOCK {
                            self.fail(&mut events, ProtocolError::OversizedHeaders);
                            break 'drive;
                        }

                        if line.is_empty() {
                            events.push(ParseEvent::Done {
                                trailers: mem::take(&mut self.trailers),
                            });
                            self.reset_message();
                        } else if let Err(e) = push_header_line(&mut self.trailers, &line) {
                            self.fail(&mut events, e);
                            break 'drive;
                        }
                    }
                },

                State::Errored => break 'drive,
            }
        }

        events
    }

    // Next CRLF- (leniently LF-) terminated line, without its terminator.
    fn take_line(&mut self) -> Option<(Bytes, bool)> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);

        let had_cr = line.last() == Some(&b'\r');
        if had_cr {
            line.truncate(line.len() - 1);
        }

        Some((line.freeze(), had_cr))
    }

    fn finish_head(&mut self, events: &mut Vec<ParseEvent>) -> Result<(), ProtocolError> {
        let line = match self.line.take() {
            Some(line) => line,
            None => return Err(ProtocolError::BadStartLine),
        };
        let headers = mem::take(&mut self.headers);
        let framing = self.body_framing(&line, &headers)?;

        trace!("message head parsed, framing {:?}", framing);

        events.push(ParseEvent::Head(Head {
            line,
            headers,
            framing,
        }));

        match framing {
            Framing::Empty | Framing::Sized(0) => {
                events.push(ParseEvent::Done {
                    trailers: Headers::new(),
                });
                self.reset_message();
            }
            Framing::Sized(n) => self.state = State::Body(n),
            Framing::Chunked => self.state = State::ChunkSize,
            Framing::Eof => self.state = State::BodyEof,
        }

        Ok(())
    }

    // RFC 7230 §3.3.3, in order.
    fn body_framing(&self, line: &StartLine, headers: &Headers) -> Result<Framing, ProtocolError> {
        if let StartLine::Status { status, .. } = line {
            if self.head_request || *status / 100 == 1 || *status == 204 || *status == 304 {
                return Ok(Framing::Empty);
            }
        }

        let codings = headers.token_list("transfer-encoding");
        if !codings.is_empty() {
            if codings.last().map(|c| c == "chunked").unwrap_or(false) {
                // chunked as the final coding wins; Content-Length is ignored
                return Ok(Framing::Chunked);
            }
            // a transfer coding without final chunked leaves the length
            // unknowable: undelimited for responses, invalid in requests
            return match self.role {
                Role::Response => Ok(Framing::Eof),
                Role::Request => Err(ProtocolError::FramingError),
            };
        }

        let lengths = headers.get("content-length");
        if !lengths.is_empty() {
            let mut parsed: Option<u64> = None;
            for value in &lengths {
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ProtocolError::FramingError);
                }
                let n: u64 = value.parse().map_err(|_| ProtocolError::FramingError)?;
                match parsed {
                    Some(prev) if prev != n => return Err(ProtocolError::FramingError),
                    _ => parsed = Some(n),
                }
            }
            return Ok(Framing::Sized(parsed.unwrap_or(0)));
        }

        match self.role {
            Role::Response => Ok(Framing::Eof),
            Role::Request => Ok(Framing::Sized(0)),
        }
    }

    fn parse_start_line(&self, line: &[u8]) -> Result<StartLine, ProtocolError> {
        match self.role {
            Role::Request => {
                let text =
                    std::str::from_utf8(line).map_err(|_| ProtocolError::BadStartLine)?;
                let mut parts = text.split(' ');

                let method = parts.next().unwrap_or("");
                let target = parts.next().ok_or(ProtocolError::BadStartLine)?;
                let version = parts.next().ok_or(ProtocolError::BadStartLine)?;
                if parts.next().is_some() {
                    return Err(ProtocolError::BadStartLine);
                }

                if method.is_empty() || !method.bytes().all(is_token) || target.is_empty() {
                    return Err(ProtocolError::BadStartLine);
                }

                Ok(StartLine::Request {
                    method: method.to_string(),
                    target: target.to_string(),
                    version: parse_version(version.as_bytes())?,
                })
            }
            Role::Response => {
                let sp1 = line
                    .iter()
                    .position(|&b| b == b' ')
                    .ok_or(ProtocolError::BadStartLine)?;
                let version = parse_version(&line[..sp1])?;

                let rest = &line[sp1 + 1..];
                let (code, phrase) = match rest.iter().position(|&b| b == b' ') {
                    Some(sp2) => (&rest[..sp2], &rest[sp2 + 1..]),
                    None => (rest, &rest[rest.len()..]),
                };

                if code.len() != 3 || !code.iter().all(|b| b.is_ascii_digit()) {
                    return Err(ProtocolError::BadStartLine);
                }
                let status: u16 = String::from_utf8_lossy(code)
                    .parse()
                    .map_err(|_| ProtocolError::BadStartLine)?;

                Ok(StartLine::Status {
                    version,
                    status,
                    phrase: String::from_utf8_lossy(phrase).into_owned(),
                })
            }
        }
    }

    fn fail(&mut self, events: &mut Vec<ParseEvent>, error: ProtocolError) {
        trace!("protocol error: {}", error);
        self.state = State::Errored;
        self.error = Some(error);
        events.push(ParseEvent::Error(error));
    }

    fn reset_message(&mut self) {
        self.state = State::StartLine;
        self.line = None;
        self.headers = Headers::new();
        self.trailers = Headers::new();
        self.header_bytes = 0;
    }
}

fn parse_version(bytes: &[u8]) -> Result<Version, ProtocolError> {
    match bytes {
        b"HTTP/1.1" => Ok(Version::Http11),
        b"HTTP/1.0" => Ok(Version::Http10),
        _ => Err(ProtocolError::BadStartLine),
    }
}

fn push_header_line(target: &mut Headers, line: &Bytes) -> Result<(), ProtocolError> {
    if line[0] == b' ' || line[0] == b'\t' {
        // obs-fold: continuation joined to the previous value with a
        // single space, whatever whitespace led the folded line
        let folded = trim_ows(line);
        if folded.is_empty() {
            return Ok(());
        }
        if !target.fold_last(folded) {
            return Err(ProtocolError::BadHeader);
        }
        return Ok(());
    }

    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ProtocolError::BadHeader)?;

    let name = line.slice(0..colon);
    if name.is_empty() || !name.iter().all(|&b| is_token(b)) {
        return Err(ProtocolError::BadHeader);
    }

    // OWS around the value goes; everything inside stays verbatim
    let value = line.slice_ref(trim_ows(&line[colon + 1..]));
    target.push_bytes(name, value);

    Ok(())
}

fn trim_ows(mut s: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = s.split_first() {
        if first == b' ' || first == b'\t' {
            s = rest;
        } else {
            break;
        }
    }
    while let Some((&last, rest)) = s.split_last() {
        if last == b' ' || last == b'\t' {
            s = rest;
        } else {
            break;
        }
    }
    s
}

/// > token = 1*tchar
/// > tchar = "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" / "-" / "." /
/// >         "^" / "_" / "`" / "|" / "~" / DIGIT / ALPHA
#[inline]
fn is_token(b: u8) -> bool {
    matches!(b,
        b'a'..=b'z'
        | b'A'..=b'Z'
        | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*'
        | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

// Chunk sizes start with 1*HEXDIG; LWS may trail the digits and an
// extension may follow a ";", its bytes ignored wholesale.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ProtocolError> {
    let mut size: u64 = 0;
    let mut seen_digit = false;
    let mut in_chunk_size = true;
    let mut in_ext = false;

    for &b in line {
        let digit = match b {
            b'0'..=b'9' if in_chunk_size => Some(b - b'0'),
            b'a'..=b'f' if in_chunk_size => Some(b + 10 - b'a'),
            b'A'..=b'F' if in_chunk_size => Some(b + 10 - b'A'),
            b';' if !in_ext => {
                in_ext = true;
                in_chunk_size = false;
                None
            }
            b'\t' | b' ' if in_chunk_size => {
                in_chunk_size = false;
                None
            }
            b'\t' | b' ' if !in_ext && !in_chunk_size => None,
            _ if in_ext => None,
            _ => return Err(ProtocolError::ChunkError),
        };

        if let Some(digit) = digit {
            seen_digit = true;
            size = size
                .checked_mul(16)
                .and_then(|s| s.checked_add(u64::from(digit)))
                .ok_or(ProtocolError::ChunkError)?;
        }
    }

    if !seen_digit {
        return Err(ProtocolError::ChunkError);
    }

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Parser {
        Parser::new(Role::Request)
    }

    fn resp() -> Parser {
        Parser::new(Role::Response)
    }

    fn expect_head(ev: &ParseEvent) -> &Head {
        match ev {
            ParseEvent::Head(head) => head,
            _ => panic!("expected head event"),
        }
    }

    fn expect_body(ev: &ParseEvent) -> &[u8] {
        match ev {
            ParseEvent::Body(bytes) => bytes,
            _ => panic!("expected body event"),
        }
    }

    fn expect_done(ev: &ParseEvent) -> &Headers {
        match ev {
            ParseEvent::Done { trailers } => trailers,
            _ => panic!("expected done event"),
        }
    }

    fn expect_error(ev: &ParseEvent) -> ProtocolError {
        match ev {
            ParseEvent::Error(e) => *e,
            _ => panic!("expected error event"),
        }
    }

    #[test]
    fn simple_request() {
        let mut p = req();
        let events = p.feed(b"GET /a?b=1 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(events.len(), 2);

        let head = expect_head(&events[0]);
        match &head.line {
            StartLine::Request {
                method,
                target,
                version,
            } => {
                assert_eq!(method, "GET");
                assert_eq!(target, "/a?b=1");
                assert_eq!(*version, Version::Http11);
            }
            _ => panic!("request line expected"),
        }
        assert_eq!(head.framing, Framing::Sized(0));
        assert_eq!(head.headers.get("host"), vec!["x"]);

        assert!(expect_done(&events[1]).is_empty());
        assert!(p.is_clean());
    }

    #[test]
    fn content_length_response_split_across_feeds() {
        let mut p = resp();
        let events = p.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\na");
        assert_eq!(events.len(), 2);
        let head = expect_head(&events[0]);
        assert_eq!(head.framing, Framing::Sized(3));
        assert_eq!(expect_body(&events[1]), b"a");

        let events = p.feed(b"bc");
        assert_eq!(events.len(), 2);
        assert_eq!(expect_body(&events[0]), b"bc");
        expect_done(&events[1]);
        assert!(p.is_clean());
    }

    #[test]
    fn status_line_shapes() {
        let mut p = resp();
        let events = p.feed(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        match &expect_head(&events[0]).line {
            StartLine::Status {
                status, phrase, ..
            } => {
                assert_eq!(*status, 404);
                assert_eq!(phrase, "Not Found");
            }
            _ => panic!("status line expected"),
        }

        // phrase may be absent
        let mut p = resp();
        let events = p.feed(b"HTTP/1.1 200\r\nContent-Length: 0\r\n\r\n");
        match &expect_head(&events[0]).line {
            StartLine::Status { phrase, .. } => assert_eq!(phrase, ""),
            _ => panic!("status line expected"),
        }
    }

    #[test]
    fn chunked_with_extension_and_trailers() {
        let mut p = resp();
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Check: ok\r\n\r\n";
        let events = p.feed(wire);

        assert_eq!(events.len(), 4);
        assert_eq!(expect_head(&events[0]).framing, Framing::Chunked);
        assert_eq!(expect_body(&events[1]), b"hello");
        assert_eq!(expect_body(&events[2]), b" world");
        let trailers = expect_done(&events[3]);
        assert_eq!(trailers.get("x-check"), vec!["ok"]);
        assert!(p.is_clean());
    }

    #[test]
    fn chunked_byte_at_a_time() {
        let mut p = resp();
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";

        let mut bodies = Vec::new();
        let mut done = false;
        for &b in wire.iter() {
            for ev in p.feed(&[b]) {
                match ev {
                    ParseEvent::Body(bytes) => bodies.extend_from_slice(&bytes),
                    ParseEvent::Done { .. } => done = true,
                    ParseEvent::Head(_) => {}
                    ParseEvent::Error(e) => panic!("unexpected error {}", e),
                }
            }
        }

        assert!(done);
        assert_eq!(bodies, b"hello");
    }

    #[test]
    fn lf_only_lines_accepted_for_headers() {
        let mut p = req();
        let events = p.feed(b"GET / HTTP/1.1\nHost: x\nContent-Length: 2\n\nhi");
        let head = expect_head(&events[0]);
        assert_eq!(head.headers.get("host"), vec!["x"]);
        assert_eq!(expect_body(&events[1]), b"hi");
        expect_done(&events[2]);
    }

    #[test]
    fn folded_header_joined_with_single_space() {
        let mut p = req();
        let events = p.feed(b"GET / HTTP/1.1\r\nX-Fold: start\r\n\t  continued\r\n\r\n");
        let head = expect_head(&events[0]);
        assert_eq!(head.headers.raw("x-fold"), vec![&b"start continued"[..]]);
    }

    #[test]
    fn fold_without_preceding_header_is_bad() {
        let mut p = req();
        let events = p.feed(b"GET / HTTP/1.1\r\n  lonely\r\n\r\n");
        assert_eq!(expect_error(&events[0]), ProtocolError::BadHeader);
        // inert afterwards
        assert!(p.feed(b"more").is_empty());
    }

    #[test]
    fn header_value_whitespace_trimmed_at_edges_only() {
        let mut p = req();
        let events = p.feed(b"GET / HTTP/1.1\r\nX-V:   a  b\t c   \r\n\r\n");
        let head = expect_head(&events[0]);
        assert_eq!(head.headers.raw("x-v"), vec![&b"a  b\t c"[..]]);
    }

    #[test]
    fn duplicate_headers_preserved_in_order_with_case() {
        let mut p = req();
        let events = p.feed(b"GET / HTTP/1.1\r\nSet-Thing: a\r\nSET-THING: b\r\n\r\n");
        let head = expect_head(&events[0]);
        let pairs: Vec<(&[u8], &[u8])> = head.headers.iter().collect();
        assert_eq!(
            pairs,
            vec![
                (&b"Set-Thing"[..], &b"a"[..]),
                (&b"SET-THING"[..], &b"b"[..])
            ]
        );
    }

    #[test]
    fn oversized_header_block_rejected() {
        let mut p = req();
        let mut wire = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..2000 {
            wire.extend_from_slice(format!("X-Pad-{}: {}\r\n", i, "y".repeat(40)).as_bytes());
        }
        let events = p.feed(&wire);
        let last = events.last().expect("events");
        assert_eq!(expect_error(last), ProtocolError::OversizedHeaders);
    }

    #[test]
    fn bad_start_lines_rejected() {
        for wire in [
            &b"GET /\r\n\r\n"[..],
            &b"GET / HTTP/2.0\r\n\r\n"[..],
            &b"G<T / HTTP/1.1\r\n\r\n"[..],
            &b" / GET HTTP/1.1\r\n\r\n"[..],
        ] {
            let mut p = req();
            let events = p.feed(wire);
            assert_eq!(
                expect_error(events.first().expect("event")),
                ProtocolError::BadStartLine
            );
        }
    }

    #[test]
    fn chunked_not_last_in_request_is_framing_error() {
        let mut p = req();
        let events = p.feed(
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked, gzip\r\n\r\n",
        );
        assert_eq!(expect_error(&events[0]), ProtocolError::FramingError);
    }

    #[test]
    fn chunked_last_wins_over_content_length() {
        let mut p = resp();
        let events = p.feed(
            b"HTTP/1.1 200 OK\r\nContent-Length: 999\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        );
        assert_eq!(expect_head(&events[0]).framing, Framing::Chunked);
        expect_done(&events[1]);
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        let mut p = resp();
        let events = p.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n");
        assert_eq!(expect_error(&events[0]), ProtocolError::FramingError);

        // agreeing duplicates are fine
        let mut p = resp();
        let events = p.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\nok");
        assert_eq!(expect_head(&events[0]).framing, Framing::Sized(2));
    }

    #[test]
    fn negative_and_garbage_content_length_rejected() {
        for value in ["-1", "4x", "1 2"] {
            let mut p = resp();
            let wire = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", value);
            let events = p.feed(wire.as_bytes());
            assert_eq!(expect_error(&events[0]), ProtocolError::FramingError);
        }
    }

    #[test]
    fn no_body_statuses_and_head_responses() {
        for status in ["204 No Content", "304 Not Modified", "100 Continue"] {
            let mut p = resp();
            let wire = format!("HTTP/1.1 {}\r\nContent-Length: 10\r\n\r\n", status);
            let events = p.feed(wire.as_bytes());
            assert_eq!(expect_head(&events[0]).framing, Framing::Empty);
            expect_done(&events[1]);
            assert!(p.is_clean());
        }

        let mut p = resp();
        p.set_head_request(true);
        let events = p.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(expect_head(&events[0]).framing, Framing::Empty);
        expect_done(&events[1]);
    }

    #[test]
    fn response_without_length_runs_to_eof() {
        let mut p = resp();
        let events = p.feed(b"HTTP/1.1 200 OK\r\n\r\npartial");
        assert_eq!(expect_head(&events[0]).framing, Framing::Eof);
        assert_eq!(expect_body(&events[1]), b"partial");

        let events = p.feed(b" more");
        assert_eq!(expect_body(&events[0]), b" more");

        let events = p.eof();
        expect_done(events.last().expect("done"));
        assert!(p.is_clean());
    }

    #[test]
    fn eof_mid_sized_body_is_unexpected() {
        let mut p = resp();
        p.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nfour");
        let events = p.eof();
        assert_eq!(
            expect_error(events.first().expect("event")),
            ProtocolError::UnexpectedEof
        );
    }

    #[test]
    fn eof_at_message_boundary_is_clean() {
        let mut p = resp();
        let events = p.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        expect_done(events.last().expect("done"));
        assert!(p.eof().is_empty());
    }

    #[test]
    fn chunk_delimiters_are_strict() {
        // missing CRLF after chunk data
        let mut p = resp();
        let events =
            p.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhelloXX");
        assert_eq!(
            expect_error(events.last().expect("event")),
            ProtocolError::ChunkError
        );

        // LF-only chunk size line
        let mut p = resp();
        let events = p.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\nhello\r\n");
        assert_eq!(
            expect_error(events.last().expect("event")),
            ProtocolError::ChunkError
        );
    }

    #[test]
    fn chunk_size_lenient_forms() {
        for (line, expected) in [
            (&b"1"[..], 1),
            (b"01", 1),
            (b"A", 10),
            (b"Ff", 255),
            (b"Ff   ", 255),
            (b"1;extension", 1),
            (b"a;ext name=value", 10),
            (b"1;;;  ;", 1),
            (b"3   ; extension=123", 3),
        ] {
            assert_eq!(parse_chunk_size(line), Ok(expected), "line {:?}", line);
        }

        for line in [
            &b""[..],
            b"X",
            b"1X",
            b"-",
            b"-1",
            b"1 invalid extension",
            b"1 A",
        ] {
            assert!(parse_chunk_size(line).is_err(), "line {:?}", line);
        }
    }

    #[test]
    fn pipelined_requests_parse_back_to_back() {
        let mut p = req();
        let events = p.feed(
            b"GET /one HTTP/1.1\r\nHost: x\r\n\r\nGET /two HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert_eq!(events.len(), 4);

        let targets: Vec<String> = events
            .iter()
            .filter_map(|ev| match ev {
                ParseEvent::Head(head) => match &head.line {
                    StartLine::Request { target, .. } => Some(target.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec!["/one", "/two"]);
    }

    #[test]
    fn leading_blank_lines_before_request_skipped() {
        let mut p = req();
        let events = p.feed(b"\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n");
        expect_head(events.first().expect("head"));
    }

    #[test]
    fn buffer_never_retains_consumed_body() {
        let mut p = resp();
        p.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\n");
        let big = vec![b'x'; 500_000];
        let events = p.feed(&big);
        assert_eq!(expect_body(&events[0]).len(), 500_000);
        assert_eq!(p.buffered(), 0);
    }
}
