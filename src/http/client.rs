//! The pooling HTTP/1.1 client.
//!
//! An exchange is one request/response pair. Request bytes are serialized
//! as soon as the user supplies them and queued until a connection is
//! ready — checked out of the idle pool when the origin has one parked,
//! freshly connected otherwise. Recoverable failures on idempotent
//! requests are retried invisibly while budget remains.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, trace, warn};
use url::Url;

use crate::emitter::{ListenerId, Listeners};
use crate::evloop::{Loop, TimeoutHandle};
use crate::http::error::{ErrorKind, HttpError, ProtocolError};
use crate::http::headers::Headers;
use crate::http::parser::{Framing, Head, ParseEvent, Parser, Role};
use crate::http::pool::{Key, Pool};
use crate::http::writer::{BodyFraming, MessageWriter};
use crate::http::{is_idempotent, StartLine, Version};
use crate::net::{TcpClient, Transport};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_LIMIT: u32 = 2;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

struct ClientInner {
    lp: Loop,
    pool: Pool,
    connect_timeout: Cell<Option<Duration>>,
    read_timeout: Cell<Option<Duration>>,
    retry_limit: Cell<u32>,
    retry_delay: Cell<Duration>,
}

/// Issues exchanges, holding the shared idle pool and the retry/timeout
/// configuration they run under.
#[derive(Clone)]
pub struct HttpClient {
    inner: Rc<ClientInner>,
}

impl HttpClient {
    pub fn new(lp: &Loop) -> HttpClient {
        HttpClient {
            inner: Rc::new(ClientInner {
                lp: lp.clone(),
                pool: Pool::new(lp, Some(DEFAULT_IDLE_TIMEOUT)),
                connect_timeout: Cell::new(None),
                read_timeout: Cell::new(None),
                retry_limit: Cell::new(DEFAULT_RETRY_LIMIT),
                retry_delay: Cell::new(DEFAULT_RETRY_DELAY),
            }),
        }
    }

    pub fn set_connect_timeout(&self, timeout: Option<Duration>) {
        self.inner.connect_timeout.set(timeout);
    }

    /// Re-armed on every received byte; expiry fails the exchange with
    /// `read-timeout`.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.read_timeout.set(timeout);
    }

    /// `None` disables connection pooling altogether.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.pool.set_timeout(timeout);
    }

    pub fn set_retry_limit(&self, limit: u32) {
        self.inner.retry_limit.set(limit);
    }

    pub fn set_retry_delay(&self, delay: Duration) {
        self.inner.retry_delay.set(delay);
    }

    /// Number of connections currently parked in the idle pool.
    pub fn idle_connections(&self) -> usize {
        self.inner.pool.idle_count()
    }

    /// A fresh exchange in the `Quiescent` state.
    pub fn exchange(&self) -> ClientExchange {
        ClientExchange {
            inner: Rc::new(ExchInner {
                client: Rc::clone(&self.inner),
                req: Cell::new(ReqState::Quiescent),
                resp: Cell::new(RespState::Waiting),
                errored: Cell::new(false),
                method: RefCell::new(String::new()),
                key: RefCell::new(None),
                attempts: Cell::new(0),
                writer: RefCell::new(None),
                req_buf: RefCell::new(bytes::BytesMut::new()),
                buffering: Cell::new(true),
                conn: RefCell::new(None),
                conn_ids: Cell::new(None),
                parser: RefCell::new(Parser::new(Role::Response)),
                response_begun: Cell::new(false),
                head_request: Cell::new(false),
                skip_next_done: Cell::new(false),
                req_keep_alive: Cell::new(false),
                resp_keep_alive: Cell::new(false),
                resp_eof_framed: Cell::new(false),
                read_timer: RefCell::new(None),
                retry_timer: RefCell::new(None),
                on_response_start: Listeners::new(),
                on_response_body: Listeners::new(),
                on_response_done: Listeners::new(),
                on_error: Listeners::new(),
            }),
        }
    }
}

/// The linear exchange state, as observed through
/// [`ClientExchange::state`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    Quiescent,
    RequestStarted,
    RequestBody,
    RequestDone,
    ResponseStarted,
    ResponseBody,
    ResponseDone,
    Done,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ReqState {
    Quiescent,
    Started,
    Body,
    Done,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RespState {
    Waiting,
    Started,
    Body,
    Done,
}

#[derive(Copy, Clone, Debug)]
enum UserCall {
    RequestStart,
    RequestBody,
    RequestDone,
}

/// The response line and headers, with hop-by-hop fields already hidden.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub phrase: String,
    pub headers: Headers,
}

struct ExchInner {
    client: Rc<ClientInner>,
    req: Cell<ReqState>,
    resp: Cell<RespState>,
    errored: Cell<bool>,
    method: RefCell<String>,
    key: RefCell<Option<Key>>,
    attempts: Cell<u32>,
    writer: RefCell<Option<MessageWriter>>,
    // Serialized request bytes, retained verbatim for replay while the
    // exchange is still transparently retryable; dropped at the first
    // response byte, which is also the point retries stop being legal.
    req_buf: RefCell<bytes::BytesMut>,
    buffering: Cell<bool>,
    conn: RefCell<Option<Rc<dyn Transport>>>,
    conn_ids: Cell<Option<(ListenerId, ListenerId)>>,
    parser: RefCell<Parser>,
    response_begun: Cell<bool>,
    head_request: Cell<bool>,
    skip_next_done: Cell<bool>,
    req_keep_alive: Cell<bool>,
    resp_keep_alive: Cell<bool>,
    resp_eof_framed: Cell<bool>,
    read_timer: RefCell<Option<TimeoutHandle>>,
    retry_timer: RefCell<Option<TimeoutHandle>>,
    on_response_start: Listeners<ResponseHead>,
    on_response_body: Listeners<[u8]>,
    on_response_done: Listeners<Headers>,
    on_error: Listeners<HttpError>,
}

/// One request/response pair.
///
/// Emits `response_start (response_body)* response_done`, or exactly one
/// `error` after which nothing further is produced.
#[derive(Clone)]
pub struct ClientExchange {
    inner: Rc<ExchInner>,
}

impl ClientExchange {
    /// Parses the URI, acquires a connection (pool checkout or fresh
    /// connect), and queues the request line and headers. The engine
    /// strips hop-by-hop headers from `headers` and inserts its own
    /// `Host` (when absent), `Connection`, and — when no `Content-Length`
    /// was declared — `Transfer-Encoding: chunked`.
    pub fn request_start(&self, method: &str, uri: &str, headers: &Headers) {
        if !self.transition(UserCall::RequestStart) {
            return;
        }

        let url = match Url::parse(uri) {
            Ok(url) => url,
            Err(e) => {
                return self.fail(ErrorKind::Connect(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    e,
                )))
            }
        };
        if url.scheme() != "http" {
            return self.fail(ErrorKind::Connect(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only http URIs are supported",
            )));
        }
        let host = match url.host_str() {
            Some(host) => host.to_string(),
            None => {
                return self.fail(ErrorKind::Connect(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "URI has no host",
                )))
            }
        };
        let port = url.port().unwrap_or(80);

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        *self.inner.method.borrow_mut() = method.to_string();
        self.inner
            .head_request
            .set(method.eq_ignore_ascii_case("HEAD"));

        let mut h = headers.clone();
        let wants_close = h.token_list("connection").iter().any(|t| t == "close");
        h.strip_hop_by_hop();
        let content_length = declared_content_length(&mut h);

        if !h.contains("host") {
            let value = if port == 80 {
                host.clone()
            } else {
                format!("{}:{}", host, port)
            };
            h.push("Host", value);
        }

        let keep_alive = self.inner.client.pool.is_enabled() && !wants_close;
        self.inner.req_keep_alive.set(keep_alive);
        h.push(
            "Connection",
            if keep_alive { "keep-alive" } else { "close" },
        );

        let framing = match content_length {
            Some(n) => BodyFraming::Sized(n),
            None => {
                h.push("Transfer-Encoding", "chunked");
                BodyFraming::Chunked
            }
        };

        let line = StartLine::Request {
            method: method.to_string(),
            target,
            version: Version::Http11,
        };
        let head = MessageWriter::head(&line, &h);
        *self.inner.writer.borrow_mut() = Some(MessageWriter::new(framing));

        *self.inner.key.borrow_mut() = Some(("http".to_string(), host.to_ascii_lowercase(), port));

        trace!("request {} {} queued", method, uri);

        self.send(&head);
        self.acquire();
    }

    /// Appends a body chunk, chunk-encoded unless a `Content-Length` was
    /// declared.
    pub fn request_body(&self, chunk: &[u8]) {
        if !self.transition(UserCall::RequestBody) {
            return;
        }

        let framed = {
            let mut writer = self.inner.writer.borrow_mut();
            match writer.as_mut() {
                Some(writer) => writer.body(chunk),
                None => return,
            }
        };

        match framed {
            Ok(bytes) => self.send(&bytes),
            Err(e) => panic!("request body rejected: {}", e),
        }
    }

    /// Terminates the request body, delivering `trailers` when the body
    /// was chunk-encoded.
    pub fn request_done(&self, trailers: &Headers) {
        if !self.transition(UserCall::RequestDone) {
            return;
        }

        let framed = {
            let mut writer = self.inner.writer.borrow_mut();
            match writer.as_mut() {
                Some(writer) => writer.finish(trailers),
                None => return,
            }
        };

        match framed {
            Ok(bytes) => self.send(&bytes),
            Err(e) => panic!("request body incomplete: {}", e),
        }
    }

    /// Abandons the exchange: cancels its timers, closes the underlying
    /// connection (nothing is returned to the pool), and silences all
    /// further events.
    pub fn close(&self) {
        if self.inner.errored.get() || self.state() == ExchangeState::Done {
            return;
        }

        self.cancel_read_timer();
        if let Some(timer) = self.inner.retry_timer.borrow_mut().take() {
            timer.delete();
        }
        if let Some(conn) = self.detach_conn() {
            conn.close();
        }
        self.inner.errored.set(true);
    }

    /// The linear state the exchange is observed in. (Request and
    /// response progress are tracked separately underneath, so a server
    /// responding before the request body is finished does not wedge the
    /// sending side; the projection reports the furthest response-side
    /// progress.)
    pub fn state(&self) -> ExchangeState {
        if self.inner.errored.get() {
            return ExchangeState::Error;
        }

        match self.inner.resp.get() {
            RespState::Done => {
                if self.inner.req.get() == ReqState::Done {
                    ExchangeState::Done
                } else {
                    ExchangeState::ResponseDone
                }
            }
            RespState::Body => ExchangeState::ResponseBody,
            RespState::Started => ExchangeState::ResponseStarted,
            RespState::Waiting => match self.inner.req.get() {
                ReqState::Quiescent => ExchangeState::Quiescent,
                ReqState::Started => ExchangeState::RequestStarted,
                ReqState::Body => ExchangeState::RequestBody,
                ReqState::Done => ExchangeState::RequestDone,
            },
        }
    }

    /// Attempt count, starting at 0 and incremented per transparent
    /// retry.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.get()
    }

    pub fn on_response_start<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&ResponseHead) + 'static,
    {
        self.inner.on_response_start.on(f)
    }

    pub fn on_response_body<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.inner.on_response_body.on(f)
    }

    pub fn on_response_done<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&Headers) + 'static,
    {
        self.inner.on_response_done.on(f)
    }

    pub fn on_error<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&HttpError) + 'static,
    {
        self.inner.on_error.on(f)
    }

    /// Legal user calls per state:
    ///
    /// | state            | legal calls                  |
    /// |------------------|------------------------------|
    /// | `Quiescent`      | `request_start`              |
    /// | `RequestStarted` | `request_body` `request_done`|
    /// | `RequestBody`    | `request_body` `request_done`|
    /// | all others       | `close` only                 |
    ///
    /// Illegal calls panic; calls on an errored exchange are ignored.
    fn transition(&self, call: UserCall) -> bool {
        if self.inner.errored.get() {
            debug!("{:?} ignored on errored exchange", call);
            return false;
        }

        let req = self.inner.req.get();
        let legal = match call {
            UserCall::RequestStart => req == ReqState::Quiescent,
            UserCall::RequestBody | UserCall::RequestDone => {
                matches!(req, ReqState::Started | ReqState::Body)
            }
        };
        if !legal {
            panic!("{:?} is not legal in exchange state {:?}", call, self.state());
        }

        self.inner.req.set(match call {
            UserCall::RequestStart => ReqState::Started,
            UserCall::RequestBody => ReqState::Body,
            UserCall::RequestDone => ReqState::Done,
        });

        true
    }

    fn send(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.inner.buffering.get() {
            self.inner.req_buf.borrow_mut().extend_from_slice(bytes);
        }
        if let Some(conn) = &*self.inner.conn.borrow() {
            conn.write(bytes);
        }
    }

    fn acquire(&self) {
        let key = match self.inner.key.borrow().clone() {
            Some(key) => key,
            None => return,
        };

        if let Some(conn) = self.inner.client.pool.checkout(&key) {
            self.attach(conn);
            return;
        }

        let tcp = TcpClient::new(&self.inner.client.lp);
        {
            let ex = self.clone();
            tcp.on_connect(move |conn| {
                ex.attach(Rc::new(conn.clone()));
            });
        }
        {
            let ex = self.clone();
            tcp.on_connect_error(move |err| {
                let detail = io::Error::new(err.error.kind(), err.error.to_string());
                let kind = if err.error.raw_os_error() == Some(libc::ETIMEDOUT) {
                    ErrorKind::ConnectTimeout
                } else {
                    ErrorKind::Connect(detail)
                };
                ex.fail(kind);
            });
        }
        tcp.connect(&key.1, key.2, self.inner.client.connect_timeout.get());
    }

    fn attach(&self, conn: Rc<dyn Transport>) {
        if self.inner.errored.get() {
            conn.close();
            return;
        }

        let mut parser = Parser::new(Role::Response);
        parser.set_head_request(self.inner.head_request.get());
        *self.inner.parser.borrow_mut() = parser;

        let data_id = {
            let ex = self.clone();
            conn.on_data(Box::new(move |bytes| ex.on_data(bytes)))
        };
        let close_id = {
            let ex = self.clone();
            conn.on_close(Box::new(move |_| ex.on_conn_close()))
        };
        self.inner.conn_ids.set(Some((data_id, close_id)));
        *self.inner.conn.borrow_mut() = Some(Rc::clone(&conn));

        self.arm_read_timer();

        {
            let buf = self.inner.req_buf.borrow();
            if !buf.is_empty() {
                conn.write(&buf);
            }
        }
        conn.pause(false);
    }

    fn detach_conn(&self) -> Option<Rc<dyn Transport>> {
        let conn = self.inner.conn.borrow_mut().take();
        if let Some(conn) = &conn {
            if let Some((data_id, close_id)) = self.inner.conn_ids.take() {
                conn.off_data(data_id);
                conn.off_close(close_id);
            }
        }
        conn
    }

    fn on_data(&self, bytes: &[u8]) {
        if self.inner.errored.get() {
            return;
        }

        if !self.inner.response_begun.replace(true) {
            // retries stop being legal at the first response byte; the
            // replay copy goes with them
            self.inner.buffering.set(false);
            self.inner.req_buf.borrow_mut().clear();
        }

        self.arm_read_timer();

        let events = self.inner.parser.borrow_mut().feed(bytes);
        self.process_events(events, false);
    }

    fn process_events(&self, events: Vec<ParseEvent>, at_eof: bool) {
        for event in events {
            if self.inner.errored.get() {
                return;
            }
            match event {
                ParseEvent::Head(head) => self.on_head(head),
                ParseEvent::Body(chunk) => self.on_body(&chunk),
                ParseEvent::Done { trailers } => self.on_done(trailers),
                ParseEvent::Error(e) => {
                    if at_eof {
                        self.fail(self.close_kind());
                    } else {
                        self.fail(ErrorKind::Protocol(e));
                    }
                    return;
                }
            }
        }
    }

    fn on_head(&self, head: Head) {
        let (version, status, phrase) = match head.line {
            StartLine::Status {
                version,
                status,
                phrase,
            } => (version, status, phrase),
            StartLine::Request { .. } => {
                return self.fail(ErrorKind::Protocol(ProtocolError::BadStartLine))
            }
        };

        // Interim responses are consumed invisibly; the final response
        // follows on the same connection.
        if (100..=199).contains(&status) && status != 101 {
            trace!("consumed interim {} response", status);
            self.inner.skip_next_done.set(true);
            return;
        }

        let connection = head.headers.token_list("connection");
        let keep_alive = match version {
            Version::Http11 => !connection.iter().any(|t| t == "close"),
            Version::Http10 => connection.iter().any(|t| t == "keep-alive"),
        };
        self.inner.resp_keep_alive.set(keep_alive && status != 101);
        self.inner
            .resp_eof_framed
            .set(head.framing == Framing::Eof);

        self.inner.resp.set(RespState::Started);

        let mut headers = head.headers;
        headers.strip_hop_by_hop();
        self.inner.on_response_start.emit(&ResponseHead {
            status,
            phrase,
            headers,
        });
    }

    fn on_body(&self, chunk: &[u8]) {
        self.inner.resp.set(RespState::Body);
        self.inner.on_response_body.emit(chunk);
    }

    fn on_done(&self, trailers: Headers) {
        if self.inner.skip_next_done.replace(false) {
            return;
        }

        self.inner.resp.set(RespState::Done);
        self.cancel_read_timer();

        if let Some(conn) = self.detach_conn() {
            let reuse = self.inner.req.get() == ReqState::Done
                && self.inner.req_keep_alive.get()
                && self.inner.resp_keep_alive.get()
                && !self.inner.resp_eof_framed.get()
                && !conn.is_closed()
                && self.inner.parser.borrow().is_clean();

            if reuse {
                match self.inner.key.borrow().clone() {
                    Some(key) => self.inner.client.pool.checkin(key, conn),
                    None => conn.close(),
                }
            } else {
                conn.close();
            }
        }

        self.inner.on_response_done.emit(&trailers);
    }

    fn on_conn_close(&self) {
        if self.inner.errored.get() || self.inner.resp.get() == RespState::Done {
            return;
        }

        // An EOF-framed body ends exactly here.
        let events = self.inner.parser.borrow_mut().eof();
        if !events.is_empty() {
            self.process_events(events, true);
            return;
        }

        self.fail(self.close_kind());
    }

    fn close_kind(&self) -> ErrorKind {
        if self.inner.response_begun.get() {
            ErrorKind::UpstreamClose
        } else {
            ErrorKind::Socket(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed before any response data",
            ))
        }
    }

    fn arm_read_timer(&self) {
        self.cancel_read_timer();
        if let Some(timeout) = self.inner.client.read_timeout.get() {
            let ex = self.clone();
            let handle = self
                .inner
                .client
                .lp
                .schedule(timeout, move |_| ex.on_read_timeout());
            *self.inner.read_timer.borrow_mut() = Some(handle);
        }
    }

    fn cancel_read_timer(&self) {
        if let Some(timer) = self.inner.read_timer.borrow_mut().take() {
            timer.delete();
        }
    }

    fn on_read_timeout(&self) {
        if self.inner.errored.get() || self.inner.resp.get() == RespState::Done {
            return;
        }
        self.fail(ErrorKind::ReadTimeout);
    }

    /// A failure is recoverable iff its kind allows it, no response byte
    /// has arrived, the method is idempotent, and retry budget remains.
    /// Recoverable failures discard the connection, wait out the retry
    /// delay, and re-submit invisibly; everything else surfaces exactly
    /// one `error` event.
    fn fail(&self, kind: ErrorKind) {
        if self.inner.errored.get() {
            return;
        }

        self.cancel_read_timer();
        if let Some(conn) = self.detach_conn() {
            conn.close();
        }

        let recoverable_kind = matches!(
            kind,
            ErrorKind::Connect(_)
                | ErrorKind::ConnectTimeout
                | ErrorKind::Socket(_)
                | ErrorKind::ReadTimeout
        );
        // a failure before the URI resolved to an origin has nothing to
        // re-submit to
        let retryable = recoverable_kind
            && self.inner.key.borrow().is_some()
            && !self.inner.response_begun.get()
            && self.inner.buffering.get()
            && is_idempotent(&self.inner.method.borrow())
            && self.inner.attempts.get() < self.inner.client.retry_limit.get();

        if retryable {
            let attempt = self.inner.attempts.get() + 1;
            self.inner.attempts.set(attempt);
            debug!(
                "recoverable failure ({}), retry {} of {} in {:?}",
                kind.as_str(),
                attempt,
                self.inner.client.retry_limit.get(),
                self.inner.client.retry_delay.get()
            );

            let ex = self.clone();
            let handle = self
                .inner
                .client
                .lp
                .schedule(self.inner.client.retry_delay.get(), move |_| ex.retry());
            *self.inner.retry_timer.borrow_mut() = Some(handle);
        } else {
            self.inner.errored.set(true);
            self.inner.on_error.emit(&HttpError {
                kind,
                recoverable: false,
            });
        }
    }

    fn retry(&self) {
        if self.inner.errored.get() {
            return;
        }
        self.acquire();
    }
}

// The value of a user-declared Content-Length, when it is usable. A
// malformed or self-contradictory declaration is dropped (with a warning)
// and the request falls back to chunked framing; agreeing duplicates are
// collapsed to one field.
fn declared_content_length(headers: &mut Headers) -> Option<u64> {
    let values = headers.get("content-length");
    if values.is_empty() {
        return None;
    }

    let mut parsed: Option<u64> = None;
    for value in &values {
        let n = if value.bytes().all(|b| b.is_ascii_digit()) {
            value.parse::<u64>().ok()
        } else {
            None
        };
        match (n, parsed) {
            (Some(n), None) => parsed = Some(n),
            (Some(n), Some(prev)) if n == prev => {}
            _ => {
                warn!("dropping malformed Content-Length, sending chunked");
                headers.remove("content-length");
                return None;
            }
        }
    }

    if values.len() > 1 {
        if let Some(n) = parsed {
            headers.remove("content-length");
            headers.push("Content-Length", n.to_string());
        }
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::declared_content_length;
    use crate::http::headers::Headers;
    use crate::http::is_idempotent;

    #[test]
    fn idempotent_method_set() {
        for m in ["GET", "get", "HEAD", "OPTIONS", "PUT", "DELETE", "TRACE"] {
            assert!(is_idempotent(m), "{}", m);
        }
        for m in ["POST", "PATCH", "CONNECT", "BREW"] {
            assert!(!is_idempotent(m), "{}", m);
        }
    }

    #[test]
    fn content_length_declaration() {
        let mut h: Headers = [("Content-Length", "42")].into_iter().collect();
        assert_eq!(declared_content_length(&mut h), Some(42));

        let mut h: Headers = [("Content-Length", "42"), ("content-length", "42")]
            .into_iter()
            .collect();
        assert_eq!(declared_content_length(&mut h), Some(42));
        assert_eq!(h.raw("content-length").len(), 1);

        let mut h: Headers = [("Content-Length", "42"), ("Content-Length", "7")]
            .into_iter()
            .collect();
        assert_eq!(declared_content_length(&mut h), None);
        assert!(!h.contains("content-length"));

        let mut h: Headers = [("Content-Length", "4x")].into_iter().collect();
        assert_eq!(declared_content_length(&mut h), None);

        let mut h = Headers::new();
        assert_eq!(declared_content_length(&mut h), None);
    }
}
