//! An evented I/O core for building HTTP/1.1 intermediaries — proxies,
//! gateways, content-transformation engines.
//!
//! Three layers, each consuming only the one below:
//!
//! * [`Loop`] — a single-threaded reactor multiplexing readiness
//!   (epoll/kqueue/poll) and timed callbacks.
//! * [`net::tcp`] — non-blocking TCP with explicit read pause/resume and
//!   write-side backpressure events.
//! * [`http`] — a streaming HTTP/1.1 message engine: push parser, frame
//!   serializer, pooling client, and server.
//!
//! Everything runs cooperatively on one thread; no operation blocks the
//! loop, and no callback runs concurrently with another.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use relay_io::Loop;
//!
//! let lp = Loop::new().unwrap();
//! lp.set_precision(Duration::from_millis(10));
//!
//! lp.schedule(Duration::from_millis(1), |lp| {
//!     println!("tick at {:?}", lp.time());
//!     lp.stop();
//! });
//!
//! lp.run().unwrap();
//! ```

mod emitter;
mod event;
mod evloop;
mod ready;
mod sys;

pub mod http;
pub mod net;

pub use emitter::{ListenerId, Listeners};
pub use event::{Event, Events, Token};
pub use evloop::{Loop, Sink, TimeoutHandle};
pub use ready::Ready;

pub use net::{tcp, ConnectError, ConnectErrorKind, Transport};
