use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::cmp;

use indexmap::IndexMap;
use libc::{self, c_int, POLLERR, POLLHUP, POLLIN, POLLOUT, POLLPRI};

use crate::event::{Event, Token};
use crate::ready::Ready;

/// `poll(2)` fallback for POSIX targets without epoll or kqueue. The
/// interest table lives in userspace and the pollfd array is rebuilt per
/// call; fine for the fd counts a single loop drives.
pub struct Selector {
    entries: RefCell<IndexMap<RawFd, (Token, Ready)>>,
}

impl Selector {
    pub const NAME: &'static str = "poll";

    pub fn new() -> io::Result<Selector> {
        Ok(Selector {
            entries: RefCell::new(IndexMap::new()),
        })
    }

    pub fn select(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        evts.events.clear();

        let entries = self.entries.borrow();
        let mut pollfds: Vec<libc::pollfd> = entries
            .iter()
            .map(|(&fd, &(_, interest))| libc::pollfd {
                fd,
                events: interest_to_poll(interest),
                revents: 0,
            })
            .collect();

        let timeout = timeout.map(millis).unwrap_or(-1);

        match syscall!(poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout)) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for pollfd in &pollfds {
            if pollfd.revents == 0 {
                continue;
            }

            let token = match entries.get(&pollfd.fd) {
                Some(&(token, _)) => token,
                None => continue,
            };

            let revents = pollfd.revents;
            let mut kind = Ready::empty();

            if (revents & POLLIN) != 0 || (revents & POLLPRI) != 0 {
                kind = kind | Ready::readable();
            }

            if (revents & POLLOUT) != 0 {
                kind = kind | Ready::writable();
            }

            if (revents & POLLERR) != 0 {
                kind = kind | Ready::error();
            }

            if (revents & POLLHUP) != 0 {
                kind = kind | Ready::hup();
            }

            evts.events.push(Event::new(kind, token));
        }

        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.entries.borrow_mut().insert(fd, (token, interest));
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.register(fd, token, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.entries.borrow_mut().shift_remove(&fd);
        Ok(())
    }
}

fn interest_to_poll(interest: Ready) -> libc::c_short {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= POLLIN;
    }

    if interest.is_writable() {
        kind |= POLLOUT;
    }

    kind
}

fn millis(timeout: Duration) -> c_int {
    let millis = timeout
        .as_millis()
        .checked_add(u128::from(timeout.subsec_nanos() % 1_000_000 != 0))
        .unwrap_or(u128::MAX);
    cmp::min(millis, c_int::MAX as u128) as c_int
}

pub struct Events {
    events: Vec<Event>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).copied()
    }
}
