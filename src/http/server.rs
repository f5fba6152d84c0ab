//! The HTTP/1.1 server: wraps a [`TcpServer`], attaches a request parser
//! to every accepted connection, and surfaces one exchange at a time per
//! connection.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, trace};

use crate::emitter::{ListenerId, Listeners};
use crate::evloop::{Loop, TimeoutHandle};
use crate::http::error::ProtocolError;
use crate::http::headers::Headers;
use crate::http::parser::{Head, ParseEvent, Parser, Role};
use crate::http::writer::{BodyFraming, MessageWriter};
use crate::http::{StartLine, Version};
use crate::net::{TcpConnection, TcpServer};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct ServerInner {
    lp: Loop,
    tcp: TcpServer,
    idle_timeout: Cell<Duration>,
    on_exchange: Listeners<ServerExchange>,
}

/// Accepts connections and emits an `exchange` per parsed request head.
///
/// Persistent connections are the default for HTTP/1.1 requests;
/// `Connection: close` in either direction ends reuse, and connections
/// idle between exchanges age out after the idle timeout.
#[derive(Clone)]
pub struct HttpServer {
    inner: Rc<ServerInner>,
}

impl HttpServer {
    pub fn listen(lp: &Loop, host: &str, port: u16) -> io::Result<HttpServer> {
        let tcp = TcpServer::listen(lp, host, port)?;

        let server = HttpServer {
            inner: Rc::new(ServerInner {
                lp: lp.clone(),
                tcp: tcp.clone(),
                idle_timeout: Cell::new(DEFAULT_IDLE_TIMEOUT),
                on_exchange: Listeners::new(),
            }),
        };

        {
            let srv = server.clone();
            tcp.on_connect(move |conn| {
                ServerConn::accept(&srv, conn.clone());
            });
        }

        Ok(server)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.tcp.local_addr()
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.inner.idle_timeout.set(timeout);
    }

    /// Stops accepting. Connections already accepted are unaffected.
    pub fn close(&self) {
        self.inner.tcp.close();
    }

    pub fn on_exchange<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&ServerExchange) + 'static,
    {
        self.inner.on_exchange.on(f)
    }
}

struct SConnInner {
    server: HttpServer,
    conn: TcpConnection,
    parser: RefCell<Parser>,
    current: RefCell<Option<ServerExchange>>,
    // Events parsed ahead of the exchange gate: pipelined requests stay
    // here until the in-flight exchange reaches Done.
    pending: RefCell<VecDeque<ParseEvent>>,
    idle_timer: RefCell<Option<TimeoutHandle>>,
    closed: Cell<bool>,
}

#[derive(Clone)]
struct ServerConn {
    inner: Rc<SConnInner>,
}

impl ServerConn {
    fn accept(server: &HttpServer, conn: TcpConnection) {
        let sc = ServerConn {
            inner: Rc::new(SConnInner {
                server: server.clone(),
                conn: conn.clone(),
                parser: RefCell::new(Parser::new(Role::Request)),
                current: RefCell::new(None),
                pending: RefCell::new(VecDeque::new()),
                idle_timer: RefCell::new(None),
                closed: Cell::new(false),
            }),
        };

        {
            let sc = sc.clone();
            conn.on_data(move |bytes| sc.on_data(bytes));
        }
        {
            let sc = sc.clone();
            conn.on_close(move |_| sc.on_close());
        }

        sc.arm_idle_timer();
        conn.pause(false);
    }

    fn on_data(&self, bytes: &[u8]) {
        if self.inner.closed.get() {
            return;
        }

        self.disarm_idle_timer();

        let events = self.inner.parser.borrow_mut().feed(bytes);
        self.inner.pending.borrow_mut().extend(events);
        self.drain();
    }

    // Routes parsed events: body events feed the current exchange, a head
    // is surfaced only once no exchange is in flight.
    fn drain(&self) {
        loop {
            if self.inner.closed.get() {
                return;
            }

            let next_is_head = matches!(
                self.inner.pending.borrow().front(),
                Some(ParseEvent::Head(_))
            );
            if next_is_head && self.inner.current.borrow().is_some() {
                break;
            }

            let event = match self.inner.pending.borrow_mut().pop_front() {
                Some(event) => event,
                None => break,
            };

            match event {
                ParseEvent::Head(head) => self.start_exchange(head),
                ParseEvent::Body(chunk) => {
                    let current = self.inner.current.borrow().clone();
                    if let Some(ex) = current {
                        ex.deliver_body(&chunk);
                    }
                }
                ParseEvent::Done { trailers } => {
                    let current = self.inner.current.borrow().clone();
                    if let Some(ex) = current {
                        ex.deliver_done(trailers);
                    }
                }
                ParseEvent::Error(e) => {
                    self.protocol_error(e);
                    return;
                }
            }
        }

        self.settle();
    }

    // Read-side gate and idle timer, recomputed after every drain: a
    // fully-received request awaiting its response pauses the socket
    // (pipelined bytes stay buffered), an idle connection starts aging.
    fn settle(&self) {
        if self.inner.closed.get() {
            return;
        }

        let current = self.inner.current.borrow().clone();
        match current {
            Some(ex) => {
                if ex.request_complete() {
                    self.inner.conn.pause(true);
                } else {
                    self.inner.conn.pause(false);
                }
            }
            None => {
                self.inner.conn.pause(false);
                if self.inner.pending.borrow().is_empty() {
                    self.arm_idle_timer();
                }
            }
        }
    }

    fn start_exchange(&self, head: Head) {
        let (method, target, version) = match head.line {
            StartLine::Request {
                method,
                target,
                version,
            } => (method, target, version),
            StartLine::Status { .. } => {
                self.protocol_error(ProtocolError::BadStartLine);
                return;
            }
        };

        let connection = head.headers.token_list("connection");
        let keep_alive = match version {
            Version::Http11 => !connection.iter().any(|t| t == "close"),
            Version::Http10 => connection.iter().any(|t| t == "keep-alive"),
        };

        trace!("request {} {} ({})", method, target, version);

        let exchange = ServerExchange {
            inner: Rc::new(SExInner {
                sconn: self.clone(),
                method,
                target,
                version,
                req_keep_alive: keep_alive,
                req: Cell::new(ReqState::Started),
                resp: Cell::new(RespState::Waiting),
                errored: Cell::new(false),
                writer: RefCell::new(None),
                close_after: Cell::new(!keep_alive),
                on_request_start: Listeners::new(),
                on_request_body: Listeners::new(),
                on_request_done: Listeners::new(),
            }),
        };

        *self.inner.current.borrow_mut() = Some(exchange.clone());

        // Surface the exchange first so the user can subscribe, then
        // deliver the request head.
        self.inner.server.inner.on_exchange.emit(&exchange);

        let mut headers = head.headers;
        headers.strip_hop_by_hop();
        exchange.deliver_start(headers);
    }

    fn exchange_complete(&self, exchange: &ServerExchange) {
        let reuse = !exchange.inner.close_after.get();

        *self.inner.current.borrow_mut() = None;

        if reuse {
            // next pipelined request, if one is already buffered
            self.drain();
        } else {
            self.inner.closed.set(true);
            self.inner.conn.close();
        }
    }

    fn protocol_error(&self, error: ProtocolError) {
        debug!("request protocol error: {}", error);

        let mid_response = self
            .inner
            .current
            .borrow()
            .as_ref()
            .map(|ex| ex.inner.resp.get() != RespState::Waiting)
            .unwrap_or(false);

        if !mid_response {
            let (status, phrase) = match error {
                ProtocolError::OversizedHeaders => (413, "Payload Too Large"),
                _ => (400, "Bad Request"),
            };
            self.inner.conn.write(
                format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status, phrase
                )
                .as_bytes(),
            );
        }

        if let Some(ex) = self.inner.current.borrow_mut().take() {
            ex.inner.errored.set(true);
        }
        self.inner.pending.borrow_mut().clear();
        self.inner.closed.set(true);
        self.disarm_idle_timer();
        self.inner.conn.close();
    }

    fn on_close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }

        self.disarm_idle_timer();
        if let Some(ex) = self.inner.current.borrow_mut().take() {
            ex.inner.errored.set(true);
        }
        self.inner.pending.borrow_mut().clear();
    }

    fn arm_idle_timer(&self) {
        self.disarm_idle_timer();

        let timeout = self.inner.server.inner.idle_timeout.get();
        let sc = self.clone();
        let handle = self.inner.server.inner.lp.schedule(timeout, move |_| {
            if !sc.inner.closed.get() && sc.inner.current.borrow().is_none() {
                trace!("closing idle connection");
                sc.inner.closed.set(true);
                sc.inner.conn.close();
            }
        });
        *self.inner.idle_timer.borrow_mut() = Some(handle);
    }

    fn disarm_idle_timer(&self) {
        if let Some(timer) = self.inner.idle_timer.borrow_mut().take() {
            timer.delete();
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ReqState {
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

/// The request line and headers, hop-by-hop fields hidden.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Headers,
}

struct SExInner {
    sconn: ServerConn,
    method: String,
    target: String,
    version: Version,
    req_keep_alive: bool,
    req: Cell<ReqState>,
    resp: Cell<RespState>,
    errored: Cell<bool>,
    writer: RefCell<Option<MessageWriter>>,
    close_after: Cell<bool>,
    on_request_start: Listeners<RequestHead>,
    on_request_body: Listeners<[u8]>,
    on_request_done: Listeners<Headers>,
}

/// One server-side request/response pair.
///
/// Emits `request_start (request_body)* request_done`; the user answers
/// with `response_start`, any number of `response_body`, and exactly one
/// `response_done`. The connection is reused only when both sides kept it
/// alive and the request was read to completion.
#[derive(Clone)]
pub struct ServerExchange {
    inner: Rc<SExInner>,
}

impl ServerExchange {
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn on_request_start<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&RequestHead) + 'static,
    {
        self.inner.on_request_start.on(f)
    }

    pub fn on_request_body<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.inner.on_request_body.on(f)
    }

    pub fn on_request_done<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&Headers) + 'static,
    {
        self.inner.on_request_done.on(f)
    }

    /// Sends the status line and headers. The engine strips hop-by-hop
    /// fields, decides framing (`Content-Length` when declared, chunked
    /// otherwise, empty for HEAD and no-body statuses), and inserts its
    /// own `Connection` and `Transfer-Encoding` headers.
    pub fn response_start(&self, status: u16, phrase: &str, headers: &Headers) {
        if self.inner.errored.get() {
            debug!("response_start ignored on dead exchange");
            return;
        }
        if self.inner.resp.get() != RespState::Waiting {
            panic!("response_start after the response already started");
        }

        let mut h = headers.clone();
        let wants_close = h.token_list("connection").iter().any(|t| t == "close");
        h.strip_hop_by_hop();

        let head_request = self.inner.method.eq_ignore_ascii_case("HEAD");
        let no_body = head_request || status / 100 == 1 || status == 204 || status == 304;

        let declared = h
            .get("content-length")
            .first()
            .and_then(|v| v.parse::<u64>().ok());

        let framing = if no_body {
            BodyFraming::Empty
        } else if let Some(n) = declared {
            BodyFraming::Sized(n)
        } else {
            h.push("Transfer-Encoding", "chunked");
            BodyFraming::Chunked
        };

        let keep_alive = self.inner.req_keep_alive && !wants_close && status != 101;
        self.inner.close_after.set(!keep_alive);
        h.push(
            "Connection",
            if keep_alive { "keep-alive" } else { "close" },
        );

        let line = StartLine::Status {
            version: Version::Http11,
            status,
            phrase: phrase.to_string(),
        };

        self.inner.sconn.inner.conn.write(&MessageWriter::head(&line, &h));
        *self.inner.writer.borrow_mut() = Some(MessageWriter::new(framing));
        self.inner.resp.set(RespState::Started);
    }

    pub fn response_body(&self, chunk: &[u8]) {
        if self.inner.errored.get() {
            return;
        }
        if !matches!(self.inner.resp.get(), RespState::Started | RespState::Body) {
            panic!("response_body outside an open response");
        }

        let framed = {
            let mut writer = self.inner.writer.borrow_mut();
            match writer.as_mut() {
                Some(writer) => writer.body(chunk),
                None => return,
            }
        };

        match framed {
            Ok(bytes) => {
                self.inner.resp.set(RespState::Body);
                self.inner.sconn.inner.conn.write(&bytes);
            }
            Err(e) => panic!("response body rejected: {}", e),
        }
    }

    pub fn response_done(&self, trailers: &Headers) {
        if self.inner.errored.get() {
            return;
        }
        if !matches!(self.inner.resp.get(), RespState::Started | RespState::Body) {
            panic!("response_done outside an open response");
        }

        let framed = {
            let mut writer = self.inner.writer.borrow_mut();
            match writer.as_mut() {
                Some(writer) => writer.finish(trailers),
                None => return,
            }
        };

        match framed {
            Ok(bytes) => {
                self.inner.sconn.inner.conn.write(&bytes);
                self.inner.resp.set(RespState::Done);
                self.maybe_complete();
            }
            Err(e) => panic!("response body incomplete: {}", e),
        }
    }

    pub(crate) fn request_complete(&self) -> bool {
        self.inner.req.get() == ReqState::Done
    }

    fn deliver_start(&self, headers: Headers) {
        self.inner.on_request_start.emit(&RequestHead {
            method: self.inner.method.clone(),
            target: self.inner.target.clone(),
            headers,
        });
    }

    fn deliver_body(&self, chunk: &[u8]) {
        if self.inner.errored.get() {
            return;
        }
        self.inner.req.set(ReqState::Body);
        self.inner.on_request_body.emit(chunk);
    }

    fn deliver_done(&self, trailers: Headers) {
        if self.inner.errored.get() {
            return;
        }
        self.inner.req.set(ReqState::Done);
        self.inner.on_request_done.emit(&trailers);
        self.maybe_complete();
    }

    // The exchange is done once both directions are: only then may the
    // connection be reused or the next pipelined request surface. A
    // response finished before the request was fully read either keeps
    // draining the request (keep-alive) or closes outright.
    fn maybe_complete(&self) {
        if self.inner.resp.get() != RespState::Done {
            return;
        }

        if self.inner.req.get() == ReqState::Done {
            self.inner.sconn.exchange_complete(self);
        } else if self.inner.close_after.get() {
            self.inner.errored.set(true);
            let sconn = &self.inner.sconn;
            *sconn.inner.current.borrow_mut() = None;
            sconn.inner.closed.set(true);
            sconn.inner.conn.close();
        }
    }
}
