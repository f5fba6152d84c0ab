use std::error::Error as StdError;
use std::fmt;
use std::io;

/// A violation of the wire protocol, detected by the parser. After one of
/// these is reported no further events are produced for the message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    BadStartLine,
    BadHeader,
    OversizedHeaders,
    FramingError,
    ChunkError,
    UnexpectedEof,
}

impl ProtocolError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolError::BadStartLine => "bad-start-line",
            ProtocolError::BadHeader => "bad-header",
            ProtocolError::OversizedHeaders => "oversized-headers",
            ProtocolError::FramingError => "framing-error",
            ProtocolError::ChunkError => "chunk-error",
            ProtocolError::UnexpectedEof => "unexpected-eof",
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StdError for ProtocolError {}

/// What went wrong with an exchange.
#[derive(Debug)]
pub enum ErrorKind {
    /// The connection could not be established; carries the OS detail.
    Connect(io::Error),
    /// The connect did not resolve within the configured timeout.
    ConnectTimeout,
    /// A socket-level failure mid-stream, or the peer closing before any
    /// response byte arrived.
    Socket(io::Error),
    /// No byte arrived within the configured read timeout.
    ReadTimeout,
    /// The peer sent bytes that are not valid HTTP.
    Protocol(ProtocolError),
    /// The peer closed the connection mid-response.
    UpstreamClose,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connect(_) => "connect-failure",
            ErrorKind::ConnectTimeout => "connect-timeout",
            ErrorKind::Socket(_) => "socket-error",
            ErrorKind::ReadTimeout => "read-timeout",
            ErrorKind::Protocol(ProtocolError::OversizedHeaders) => "oversized-headers",
            ErrorKind::Protocol(_) => "protocol-error",
            ErrorKind::UpstreamClose => "upstream-close",
        }
    }
}

/// Delivered through an exchange's `error` event, exactly once, after
/// which the exchange produces nothing further.
///
/// `recoverable` reports whether the client will retry on its own; by the
/// time the user sees the error it is always `false` — recoverable
/// failures are retried invisibly while retry budget remains.
#[derive(Debug)]
pub struct HttpError {
    pub kind: ErrorKind,
    pub recoverable: bool,
}

impl HttpError {
    pub fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Connect(e) => write!(f, "{}: {}", self.kind.as_str(), e),
            ErrorKind::Socket(e) => write!(f, "{}: {}", self.kind.as_str(), e),
            ErrorKind::Protocol(p) => write!(f, "protocol-error: {}", p),
            _ => f.write_str(self.kind.as_str()),
        }
    }
}

impl StdError for HttpError {}
