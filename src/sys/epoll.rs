use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::cmp;

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::event::{Event, Token};
use crate::ready::Ready;

pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub const NAME: &'static str = "epoll";

    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Selector { epfd })
    }

    pub fn select(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.map(millis).unwrap_or(-1);

        let cnt = loop {
            match syscall!(epoll_wait(
                self.epfd,
                evts.events.as_mut_ptr(),
                evts.events.capacity() as i32,
                timeout
            )) {
                Ok(cnt) => break cnt,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => break 0,
                Err(e) => return Err(e),
            }
        };

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

// epoll_wait takes milliseconds; round a fractional remainder up so a
// short timeout cannot degrade into a busy loop.
fn millis(timeout: Duration) -> c_int {
    let millis = timeout
        .as_millis()
        .checked_add(u128::from(timeout.subsec_nanos() % 1_000_000 != 0))
        .unwrap_or(u128::MAX);
    cmp::min(millis, c_int::MAX as u128) as c_int
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
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
        self.events.get(idx).map(|event| {
            let epoll = event.events as c_int;
            let mut kind = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                kind = kind | Ready::readable();
            }

            if (epoll & EPOLLOUT) != 0 {
                kind = kind | Ready::writable();
            }

            // EPOLLHUP - usually means a socket error happened
            if (epoll & EPOLLERR) != 0 {
                kind = kind | Ready::error();
            }

            if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
                kind = kind | Ready::hup();
            }

            let token = self.events[idx].u64;

            Event::new(kind, Token(token as usize))
        })
    }
}

fn interest_to_epoll(interest: Ready) -> u32 {
    // Level-triggered on purpose: the loop re-polls every tick and the
    // transport reads until WouldBlock, so edge semantics buy nothing.
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}
