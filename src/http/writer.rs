//! Frame serializer: start-line + headers, then a body in whichever
//! framing the message declared.

use std::io;

use bytes::BytesMut;

use crate::http::headers::Headers;
use crate::http::StartLine;

/// Body framing on the sending side.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// The caller declared a `Content-Length`; writes beyond it error.
    Sized(u64),
    /// Default when the length is unknown.
    Chunked,
    /// HEAD responses and no-body statuses; any body write errors.
    Empty,
}

pub(crate) struct MessageWriter {
    framing: BodyFraming,
}

impl MessageWriter {
    pub fn new(framing: BodyFraming) -> MessageWriter {
        MessageWriter { framing }
    }

    /// Serializes `line` + `headers` + the blank line.
    pub fn head(line: &StartLine, headers: &Headers) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);

        match line {
            StartLine::Request {
                method,
                target,
                version,
            } => {
                buf.extend_from_slice(method.as_bytes());
                buf.extend_from_slice(b" ");
                buf.extend_from_slice(target.as_bytes());
                buf.extend_from_slice(b" ");
                buf.extend_from_slice(version.as_str().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            StartLine::Status {
                version,
                status,
                phrase,
            } => {
                buf.extend_from_slice(version.as_str().as_bytes());
                buf.extend_from_slice(format!(" {} ", status).as_bytes());
                buf.extend_from_slice(phrase.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
        }

        write_header_lines(&mut buf, headers);
        buf.extend_from_slice(b"\r\n");

        buf
    }

    /// Frames one body chunk. Empty chunks serialize to nothing — in
    /// chunked coding a zero-length chunk would terminate the body.
    pub fn body(&mut self, chunk: &[u8]) -> io::Result<BytesMut> {
        if chunk.is_empty() {
            return Ok(BytesMut::new());
        }

        match self.framing {
            BodyFraming::Chunked => {
                let mut buf = BytesMut::with_capacity(chunk.len() + 16);
                buf.extend_from_slice(format!("{:X}\r\n", chunk.len()).as_bytes());
                buf.extend_from_slice(chunk);
                buf.extend_from_slice(b"\r\n");
                Ok(buf)
            }
            BodyFraming::Sized(ref mut remaining) => {
                let len = chunk.len() as u64;
                if len > *remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "body exceeds the declared Content-Length",
                    ));
                }
                *remaining -= len;
                Ok(BytesMut::from(chunk))
            }
            BodyFraming::Empty => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "this message cannot carry a body",
            )),
        }
    }

    /// Terminates the body. Chunked framing emits the last-chunk plus
    /// trailers; sized framing checks the declared length was met.
    pub fn finish(&mut self, trailers: &Headers) -> io::Result<BytesMut> {
        match self.framing {
            BodyFraming::Chunked => {
                let mut buf = BytesMut::with_capacity(32);
                buf.extend_from_slice(b"0\r\n");
                write_header_lines(&mut buf, trailers);
                buf.extend_from_slice(b"\r\n");
                Ok(buf)
            }
            BodyFraming::Sized(remaining) => {
                if remaining != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "body ended short of the declared Content-Length",
                    ));
                }
                Ok(BytesMut::new())
            }
            BodyFraming::Empty => Ok(BytesMut::new()),
        }
    }
}

fn write_header_lines(buf: &mut BytesMut, headers: &Headers) {
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name);
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value);
        buf.extend_from_slice(b"\r\n");
    }
}
