use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;
use std::cmp;

use libc::{self, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_EOF, EV_ERROR};

use crate::event::{Event, Token};
use crate::ready::Ready;

pub struct Selector {
    kq: RawFd,
}

impl Selector {
    pub const NAME: &'static str = "kqueue";

    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;

        Ok(Selector { kq })
    }

    pub fn select(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32) as libc::c_long,
        });
        let timespec = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        let cnt = loop {
            match syscall!(kevent(
                self.kq,
                ptr::null(),
                0,
                evts.events.as_mut_ptr(),
                evts.events.capacity() as libc::c_int,
                timespec
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
        self.filter(fd, token, EVFILT_READ, interest.is_readable())?;
        self.filter(fd, token, EVFILT_WRITE, interest.is_writable())?;

        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.register(fd, token, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.filter(fd, Token(0), EVFILT_READ, false)?;
        self.filter(fd, Token(0), EVFILT_WRITE, false)?;

        Ok(())
    }

    // One kevent filter is one (fd, read|write) pair; enabling is EV_ADD
    // (which also updates an existing filter) and disabling is EV_DELETE
    // with absent filters ignored.
    fn filter(&self, fd: RawFd, token: Token, filter: i16, enable: bool) -> io::Result<()> {
        let mut kev: libc::kevent = unsafe { mem::zeroed() };
        kev.ident = fd as libc::uintptr_t;
        kev.filter = filter;
        kev.flags = if enable { EV_ADD } else { EV_DELETE };
        kev.udata = usize::from(token) as *mut libc::c_void;

        match syscall!(kevent(self.kq, &kev, 1, ptr::null_mut(), 0, ptr::null())) {
            Ok(_) => Ok(()),
            Err(ref e) if !enable && e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

pub struct Events {
    events: Vec<libc::kevent>,
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
            let mut kind = Ready::empty();

            if event.filter == EVFILT_READ {
                kind = kind | Ready::readable();
            }

            if event.filter == EVFILT_WRITE {
                kind = kind | Ready::writable();
            }

            if (event.flags & EV_ERROR) != 0 {
                kind = kind | Ready::error();
            }

            if (event.flags & EV_EOF) != 0 {
                kind = kind | Ready::hup();
            }

            Event::new(kind, Token(event.udata as usize))
        })
    }
}
