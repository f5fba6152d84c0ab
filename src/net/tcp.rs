//! Non-blocking TCP: connections, the asynchronous client, and the
//! accepting server, all driven by loop readiness.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, trace, warn};

use crate::emitter::{ListenerId, Listeners};
use crate::evloop::{Loop, Sink, TimeoutHandle};
use crate::net::{ConnectError, ConnectErrorKind, Transport};
use crate::ready::Ready;
use crate::sys;

/// Outgoing queue size beyond which `pause(true)` is emitted.
const HIGH_WATER: usize = 64 * 1024;
/// Draining back under this emits `pause(false)`.
const LOW_WATER: usize = 8 * 1024;
const DEFAULT_READ_BUF: usize = 16 * 1024;

/// A connection event, as handed to the sink fallback when no listener is
/// subscribed for the specific event being emitted.
pub enum ConnEvent<'a> {
    Data(&'a [u8]),
    Pause(bool),
    Close,
}

struct ConnInner {
    lp: Loop,
    fd: RawFd,
    stream: RefCell<Option<net::TcpStream>>,
    host: String,
    port: u16,
    // Read side starts paused so subscribers can attach before any data
    // is delivered; users opt in with `pause(false)`.
    read_paused: Cell<bool>,
    write_paused: Cell<bool>,
    closing: Cell<bool>,
    closed: Cell<bool>,
    out: RefCell<BytesMut>,
    read_buf_size: Cell<usize>,
    data_ev: Listeners<[u8]>,
    pause_ev: Listeners<bool>,
    close_ev: Listeners<()>,
    sink: RefCell<Option<Box<dyn FnMut(ConnEvent<'_>)>>>,
}

/// One established TCP connection, owned by whoever created it and driven
/// by the loop it is registered with.
///
/// Exactly one `close` event is delivered over the connection's lifetime,
/// whichever side or error causes it.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Rc<ConnInner>,
}

impl TcpConnection {
    pub(crate) fn open(
        lp: &Loop,
        stream: net::TcpStream,
        host: String,
        port: u16,
    ) -> io::Result<TcpConnection> {
        let fd = stream.as_raw_fd();

        let conn = TcpConnection {
            inner: Rc::new(ConnInner {
                lp: lp.clone(),
                fd,
                stream: RefCell::new(Some(stream)),
                host,
                port,
                read_paused: Cell::new(true),
                write_paused: Cell::new(false),
                closing: Cell::new(false),
                closed: Cell::new(false),
                out: RefCell::new(BytesMut::new()),
                read_buf_size: Cell::new(DEFAULT_READ_BUF),
                data_ev: Listeners::new(),
                pause_ev: Listeners::new(),
                close_ev: Listeners::new(),
                sink: RefCell::new(None),
            }),
        };

        lp.register(fd, conn.interests(), Rc::new(conn.clone()))?;

        Ok(conn)
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.inner.stream.borrow().as_ref() {
            Some(stream) => stream.local_addr(),
            None => Err(closed_error()),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.inner.stream.borrow().as_ref() {
            Some(stream) => stream.peer_addr(),
            None => Err(closed_error()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub fn set_read_buffer_size(&self, size: usize) {
        self.inner.read_buf_size.set(size.max(1));
    }

    /// Appends `data` to the outgoing queue and makes sure the loop is
    /// watching for writability. Never blocks; the queue is unbounded and
    /// the `pause(true)`/`pause(false)` events are the backpressure
    /// contract.
    pub fn write(&self, data: &[u8]) {
        if self.inner.closed.get() || self.inner.closing.get() {
            trace!("write of {} bytes after close, dropped", data.len());
            return;
        }

        let queued = {
            let mut out = self.inner.out.borrow_mut();
            out.extend_from_slice(data);
            out.len()
        };
        self.update_interests();

        if !self.inner.write_paused.get() && queued > HIGH_WATER {
            self.inner.write_paused.set(true);
            self.emit_pause(true);
        }
    }

    /// Read-side gate. While paused no `data` events are emitted and the
    /// socket's receive buffer is left to fill, extending backpressure to
    /// the peer.
    pub fn pause(&self, paused: bool) {
        if self.inner.closed.get() {
            return;
        }
        self.inner.read_paused.set(paused);
        self.update_interests();
    }

    /// Flushes the pending queue best-effort, then shuts the socket down.
    pub fn close(&self) {
        if self.inner.closed.get() || self.inner.closing.get() {
            return;
        }

        if self.inner.out.borrow().is_empty() {
            self.finish_close();
        } else {
            self.inner.closing.set(true);
            self.update_interests();
        }
    }

    pub fn on_data<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.inner.data_ev.on(f)
    }

    pub fn on_pause<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&bool) + 'static,
    {
        self.inner.pause_ev.on(f)
    }

    pub fn on_close<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&()) + 'static,
    {
        self.inner.close_ev.on(f)
    }

    pub fn off_data(&self, id: ListenerId) {
        self.inner.data_ev.remove(id);
    }

    pub fn off_pause(&self, id: ListenerId) {
        self.inner.pause_ev.remove(id);
    }

    pub fn off_close(&self, id: ListenerId) {
        self.inner.close_ev.remove(id);
    }

    /// Installs the fallback handler, invoked only for events that have no
    /// listener subscribed. Lets an intermediary splice a connection
    /// through without enumerating every event.
    pub fn set_sink<F>(&self, f: F)
    where
        F: FnMut(ConnEvent<'_>) + 'static,
    {
        *self.inner.sink.borrow_mut() = Some(Box::new(f));
    }

    fn interests(&self) -> Ready {
        let mut interests = Ready::empty();

        if self.inner.closed.get() {
            return interests;
        }

        if !self.inner.read_paused.get() && !self.inner.closing.get() {
            interests.insert(Ready::readable());
        }

        if !self.inner.out.borrow().is_empty() {
            interests.insert(Ready::writable());
        }

        interests
    }

    fn update_interests(&self) {
        if self.inner.closed.get() {
            return;
        }
        if let Err(e) = self.inner.lp.update(self.inner.fd, self.interests()) {
            trace!("interest update for fd {} failed: {}", self.inner.fd, e);
        }
    }

    fn readable(&self) {
        let size = self.inner.read_buf_size.get();

        loop {
            if self.inner.read_paused.get()
                || self.inner.closing.get()
                || self.inner.closed.get()
            {
                return;
            }

            let mut buf = vec![0u8; size];
            let res = {
                let stream = self.inner.stream.borrow();
                match stream.as_ref() {
                    Some(stream) => {
                        let mut reader: &net::TcpStream = stream;
                        reader.read(&mut buf)
                    }
                    None => return,
                }
            };

            match res {
                // EOF from the peer
                Ok(0) => {
                    trace!("eof on fd {}", self.inner.fd);
                    self.finish_close();
                    return;
                }
                Ok(n) => {
                    self.emit_data(&buf[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read error on fd {}: {}", self.inner.fd, e);
                    self.finish_close();
                    return;
                }
            }
        }
    }

    fn writable(&self) {
        loop {
            let res = {
                let mut out = self.inner.out.borrow_mut();
                if out.is_empty() {
                    break;
                }

                let stream = self.inner.stream.borrow();
                let res = match stream.as_ref() {
                    Some(stream) => {
                        let mut writer: &net::TcpStream = stream;
                        writer.write(&out)
                    }
                    None => return,
                };

                if let Ok(n) = &res {
                    let _ = out.split_to(*n);
                }
                res
            };

            match res {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("write error on fd {}: {}", self.inner.fd, e);
                    self.inner.out.borrow_mut().clear();
                    self.finish_close();
                    return;
                }
            }
        }

        let queued = self.inner.out.borrow().len();

        if queued == 0 && self.inner.closing.get() {
            self.finish_close();
            return;
        }

        if queued == 0 {
            self.update_interests();
        }

        if self.inner.write_paused.get() && queued <= LOW_WATER {
            self.inner.write_paused.set(false);
            self.emit_pause(false);
        }
    }

    fn finish_close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        self.inner.closing.set(false);

        let _ = self.inner.lp.unregister(self.inner.fd);
        self.inner.out.borrow_mut().clear();

        // Dropping the stream closes the fd before anyone hears about it.
        let stream = self.inner.stream.borrow_mut().take();
        drop(stream);

        trace!("closed connection to {}:{}", self.inner.host, self.inner.port);

        if !self.inner.close_ev.emit(&()) {
            self.sink_emit(ConnEvent::Close);
        }
    }

    fn emit_data(&self, bytes: &[u8]) {
        if !self.inner.data_ev.emit(bytes) {
            self.sink_emit(ConnEvent::Data(bytes));
        }
    }

    fn emit_pause(&self, paused: bool) {
        if !self.inner.pause_ev.emit(&paused) {
            self.sink_emit(ConnEvent::Pause(paused));
        }
    }

    fn sink_emit(&self, event: ConnEvent<'_>) {
        // Taken out for the call so the fallback may reach back into the
        // connection; one installed during the call wins over the old one.
        let sink = self.inner.sink.borrow_mut().take();
        if let Some(mut sink) = sink {
            sink(event);
            let mut slot = self.inner.sink.borrow_mut();
            if slot.is_none() {
                *slot = Some(sink);
            }
        }
    }
}

impl Sink for TcpConnection {
    fn ready(&self, _lp: &Loop, readiness: Ready) {
        if self.inner.closed.get() {
            return;
        }

        // Read side first: within one readiness cycle the readable
        // handler runs to completion before the writable one.
        if readiness.is_readable() {
            self.readable();
        }

        if self.inner.closed.get() {
            return;
        }

        if readiness.is_writable() {
            self.writable();
        }

        if self.inner.closed.get() {
            return;
        }

        // Hangup or error with nothing readable or writable to surface
        // it: the socket is dead.
        if (readiness.is_error() || readiness.is_hup())
            && !readiness.is_readable()
            && !readiness.is_writable()
        {
            debug!("hangup on fd {}", self.inner.fd);
            self.finish_close();
        }
    }
}

impl Transport for TcpConnection {
    fn write(&self, data: &[u8]) {
        TcpConnection::write(self, data)
    }

    fn pause(&self, paused: bool) {
        TcpConnection::pause(self, paused)
    }

    fn close(&self) {
        TcpConnection::close(self)
    }

    fn is_closed(&self) -> bool {
        TcpConnection::is_closed(self)
    }

    fn peer_label(&self) -> String {
        format!("{}:{}", self.inner.host, self.inner.port)
    }

    fn on_data(&self, f: Box<dyn FnMut(&[u8])>) -> ListenerId {
        self.inner.data_ev.on(f)
    }

    fn on_pause(&self, f: Box<dyn FnMut(&bool)>) -> ListenerId {
        self.inner.pause_ev.on(f)
    }

    fn on_close(&self, f: Box<dyn FnMut(&())>) -> ListenerId {
        self.inner.close_ev.on(f)
    }

    fn off_data(&self, id: ListenerId) {
        TcpConnection::off_data(self, id)
    }

    fn off_pause(&self, id: ListenerId) {
        TcpConnection::off_pause(self, id)
    }

    fn off_close(&self, id: ListenerId) {
        TcpConnection::off_close(self, id)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

// An in-flight connect: the socket is registered for writability and the
// outcome is read from SO_ERROR once it turns writable. Only on success
// does a TcpConnection come into existence.
struct Pending {
    lp: Loop,
    client: TcpClient,
    fd: RawFd,
    stream: RefCell<Option<net::TcpStream>>,
    host: String,
    port: u16,
    timer: RefCell<Option<TimeoutHandle>>,
    done: Cell<bool>,
}

impl Pending {
    fn resolve(&self) {
        if self.done.replace(true) {
            return;
        }

        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.delete();
        }
        let _ = self.lp.unregister(self.fd);

        let stream = match self.stream.borrow_mut().take() {
            Some(stream) => stream,
            None => return,
        };

        let err = match stream.take_error() {
            Ok(None) => None,
            Ok(Some(e)) => Some(e),
            Err(e) => Some(e),
        };

        match err {
            None => {
                debug!("connected to {}:{}", self.host, self.port);
                match TcpConnection::open(&self.lp, stream, self.host.clone(), self.port) {
                    Ok(conn) => {
                        self.client.inner.connect_ev.emit(&conn);
                    }
                    Err(e) => self.client.emit_error(ConnectErrorKind::Socket, e),
                }
            }
            Some(e) => {
                debug!("connect to {}:{} failed: {}", self.host, self.port, e);
                self.client.emit_error(ConnectErrorKind::Socket, e);
            }
        }
    }

    fn timed_out(&self) {
        if self.done.replace(true) {
            return;
        }

        let _ = self.lp.unregister(self.fd);
        // Dropping the pending socket closes it.
        self.stream.borrow_mut().take();

        debug!("connect to {}:{} timed out", self.host, self.port);
        self.client
            .emit_error(ConnectErrorKind::Socket, io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }
}

impl Sink for Pending {
    fn ready(&self, _lp: &Loop, _readiness: Ready) {
        self.resolve();
    }
}

struct TcpClientInner {
    lp: Loop,
    connect_ev: Listeners<TcpConnection>,
    connect_error_ev: Listeners<ConnectError>,
}

/// Produces outbound connections. The client itself is stateless; each
/// `connect` runs to either a `connect` or a `connect_error` event.
#[derive(Clone)]
pub struct TcpClient {
    inner: Rc<TcpClientInner>,
}

impl TcpClient {
    pub fn new(lp: &Loop) -> TcpClient {
        TcpClient {
            inner: Rc::new(TcpClientInner {
                lp: lp.clone(),
                connect_ev: Listeners::new(),
                connect_error_ev: Listeners::new(),
            }),
        }
    }

    pub fn on_connect<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&TcpConnection) + 'static,
    {
        self.inner.connect_ev.on(f)
    }

    pub fn on_connect_error<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&ConnectError) + 'static,
    {
        self.inner.connect_error_ev.on(f)
    }

    /// Begins an asynchronous connect. Name resolution is synchronous;
    /// everything after it is driven by loop readiness. Failures surface
    /// as `connect_error(kind, detail)`, a lapsed `timeout` as
    /// `connect_error(socket-error, ETIMEDOUT)`.
    pub fn connect(&self, host: &str, port: u16, timeout: Option<Duration>) {
        let addr = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    return self.emit_error(
                        ConnectErrorKind::Resolve,
                        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"),
                    )
                }
            },
            Err(e) => return self.emit_error(ConnectErrorKind::Resolve, e),
        };

        let stream = match sys::start_connect(&addr) {
            Ok(stream) => stream,
            Err(e) => return self.emit_error(ConnectErrorKind::Socket, e),
        };

        trace!("connecting to {}:{} ({})", host, port, addr);

        let pending = Rc::new(Pending {
            lp: self.inner.lp.clone(),
            client: self.clone(),
            fd: stream.as_raw_fd(),
            stream: RefCell::new(Some(stream)),
            host: host.to_string(),
            port,
            timer: RefCell::new(None),
            done: Cell::new(false),
        });

        if let Err(e) = self
            .inner
            .lp
            .register(pending.fd, Ready::writable(), pending.clone())
        {
            return self.emit_error(ConnectErrorKind::Socket, e);
        }

        if let Some(timeout) = timeout {
            let p = Rc::clone(&pending);
            let handle = self.inner.lp.schedule(timeout, move |_| p.timed_out());
            *pending.timer.borrow_mut() = Some(handle);
        }
    }

    fn emit_error(&self, kind: ConnectErrorKind, error: io::Error) {
        self.inner
            .connect_error_ev
            .emit(&ConnectError { kind, error });
    }
}

struct TcpServerInner {
    lp: Loop,
    fd: RawFd,
    listener: RefCell<Option<net::TcpListener>>,
    closed: Cell<bool>,
    start_ev: Listeners<()>,
    stop_ev: Listeners<()>,
    connect_ev: Listeners<TcpConnection>,
}

/// A listening socket that emits a `connect(connection)` per accepted
/// peer. `start` fires once after a successful bind (deferred one tick so
/// subscribers can attach), `stop` after `close()`.
#[derive(Clone)]
pub struct TcpServer {
    inner: Rc<TcpServerInner>,
}

impl TcpServer {
    pub fn listen(lp: &Loop, host: &str, port: u16) -> io::Result<TcpServer> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"))?;

        let listener = sys::bind_listener(&addr)?;
        let fd = listener.as_raw_fd();

        let server = TcpServer {
            inner: Rc::new(TcpServerInner {
                lp: lp.clone(),
                fd,
                listener: RefCell::new(Some(listener)),
                closed: Cell::new(false),
                start_ev: Listeners::new(),
                stop_ev: Listeners::new(),
                connect_ev: Listeners::new(),
            }),
        };

        lp.register(fd, Ready::readable(), Rc::new(server.clone()))?;

        debug!("listening on {}", addr);

        let s = server.clone();
        lp.schedule(Duration::ZERO, move |_| {
            if !s.inner.closed.get() {
                s.inner.start_ev.emit(&());
            }
        });

        Ok(server)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.inner.listener.borrow().as_ref() {
            Some(listener) => listener.local_addr(),
            None => Err(closed_error()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Stops listening. Connections already accepted are unaffected.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }

        let _ = self.inner.lp.unregister(self.inner.fd);
        let listener = self.inner.listener.borrow_mut().take();
        drop(listener);

        self.inner.stop_ev.emit(&());
    }

    pub fn on_connect<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&TcpConnection) + 'static,
    {
        self.inner.connect_ev.on(f)
    }

    pub fn on_start<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&()) + 'static,
    {
        self.inner.start_ev.on(f)
    }

    pub fn on_stop<F>(&self, f: F) -> ListenerId
    where
        F: FnMut(&()) + 'static,
    {
        self.inner.stop_ev.on(f)
    }
}

impl Sink for TcpServer {
    fn ready(&self, lp: &Loop, _readiness: Ready) {
        // Accept everything queued; the listener may have more than one
        // connection pending per readiness report.
        loop {
            if self.inner.closed.get() {
                return;
            }

            let accepted = {
                let listener = self.inner.listener.borrow();
                match listener.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("accepted socket from {} unusable: {}", peer, e);
                        continue;
                    }

                    match TcpConnection::open(lp, stream, peer.ip().to_string(), peer.port()) {
                        Ok(conn) => {
                            trace!("accepted connection from {}", peer);
                            self.inner.connect_ev.emit(&conn);
                        }
                        Err(e) => warn!("failed to register accepted socket: {}", e),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept error: {}", e);
                    return;
                }
            }
        }
    }
}
