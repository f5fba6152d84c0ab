use std::fmt;
use std::io;

use crate::emitter::ListenerId;

pub mod tcp;

pub use self::tcp::{TcpClient, TcpConnection, TcpServer};

/// The capability set the HTTP engine is written against.
///
/// Plain TCP satisfies it; a TLS stream wrapping the same loop machinery
/// satisfies it identically, which is the whole seam — nothing above this
/// trait knows which one it is talking to.
pub trait Transport {
    /// Appends to the outgoing queue; never blocks.
    fn write(&self, data: &[u8]);

    /// Read-side gate: while paused, no `data` events are delivered.
    fn pause(&self, paused: bool);

    /// Best-effort flush, then shutdown. `close` is delivered exactly
    /// once per connection.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// `host:port` of the peer, for pool keys and diagnostics.
    fn peer_label(&self) -> String;

    fn on_data(&self, f: Box<dyn FnMut(&[u8])>) -> ListenerId;
    fn on_pause(&self, f: Box<dyn FnMut(&bool)>) -> ListenerId;
    fn on_close(&self, f: Box<dyn FnMut(&())>) -> ListenerId;

    fn off_data(&self, id: ListenerId);
    fn off_pause(&self, id: ListenerId);
    fn off_close(&self, id: ListenerId);
}

/// Why an asynchronous connect failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Socket-level failure (refused, unreachable, timed out, ...).
    Socket,
    /// Name resolution failed.
    Resolve,
}

impl ConnectErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectErrorKind::Socket => "socket-error",
            ConnectErrorKind::Resolve => "getaddrinfo-error",
        }
    }
}

/// Delivered through `connect_error`: the failure kind plus the specific
/// OS-level detail.
#[derive(Debug)]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub error: io::Error,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.error)
    }
}

impl std::error::Error for ConnectError {}
