//! The HTTP/1.1 message engine: a push parser and frame serializer over
//! byte buffers, a pooling client, and a server, all living on top of the
//! [`Transport`](crate::net::Transport) capability set.

use std::fmt;

mod client;
mod error;
mod headers;
mod parser;
mod pool;
mod server;
mod writer;

pub use self::client::{ClientExchange, ExchangeState, HttpClient, ResponseHead};
pub use self::error::{ErrorKind, HttpError, ProtocolError};
pub use self::headers::Headers;
pub use self::server::{HttpServer, RequestHead, ServerExchange};

/// HTTP versions the engine speaks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first line of a message, request or response flavored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StartLine {
    Request {
        method: String,
        target: String,
        version: Version,
    },
    Status {
        version: Version,
        status: u16,
        phrase: String,
    },
}

/// The RFC 7231 idempotent method set, which bounds what the client may
/// transparently retry.
pub(crate) fn is_idempotent(method: &str) -> bool {
    ["GET", "HEAD", "OPTIONS", "PUT", "DELETE", "TRACE"]
        .iter()
        .any(|m| method.eq_ignore_ascii_case(m))
}
