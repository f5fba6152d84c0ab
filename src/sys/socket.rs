use std::io;
use std::mem;
use std::net::{self, SocketAddr};
use std::os::unix::io::{FromRawFd, RawFd};

use libc::{self, c_int};

// Owns a raw fd until it is handed off to a std wrapper, closing it on
// every early-error path.
struct FileDesc(RawFd);

impl FileDesc {
    fn raw(&self) -> RawFd {
        self.0
    }

    fn into_raw(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.0);
        }
    }
}

fn new_stream_socket(addr: &SocketAddr) -> io::Result<FileDesc> {
    let family = match *addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };

    let fd = FileDesc(syscall!(socket(family, libc::SOCK_STREAM, 0))?);
    syscall!(fcntl(fd.raw(), libc::F_SETFD, libc::FD_CLOEXEC))?;
    syscall!(fcntl(fd.raw(), libc::F_SETFL, libc::O_NONBLOCK))?;

    Ok(fd)
}

fn sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match *addr {
        SocketAddr::V4(ref a) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(ref a) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_flowinfo = a.flowinfo();
                (*sin6).sin6_addr.s6_addr = a.ip().octets();
                (*sin6).sin6_scope_id = a.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as libc::socklen_t)
}

/// Creates a non-blocking socket and starts a connect to `addr`.
///
/// Returns as soon as the connect is in flight; `EINPROGRESS` is the
/// expected outcome. The caller learns the result by watching the socket
/// for writability and reading `SO_ERROR` (via `take_error`).
pub fn start_connect(addr: &SocketAddr) -> io::Result<net::TcpStream> {
    let fd = new_stream_socket(addr)?;
    let (storage, len) = sockaddr(addr);

    match syscall!(connect(
        fd.raw(),
        &storage as *const _ as *const libc::sockaddr,
        len
    )) {
        Ok(_) => {}
        Err(ref e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => return Err(e),
    }

    Ok(unsafe { net::TcpStream::from_raw_fd(fd.into_raw()) })
}

/// Binds a non-blocking listener with `SO_REUSEADDR` set, so a restarted
/// intermediary can reclaim its port without waiting out TIME_WAIT.
pub fn bind_listener(addr: &SocketAddr) -> io::Result<net::TcpListener> {
    let fd = new_stream_socket(addr)?;

    let on: c_int = 1;
    syscall!(setsockopt(
        fd.raw(),
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &on as *const _ as *const libc::c_void,
        mem::size_of::<c_int>() as libc::socklen_t
    ))?;

    let (storage, len) = sockaddr(addr);
    syscall!(bind(
        fd.raw(),
        &storage as *const _ as *const libc::sockaddr,
        len
    ))?;
    syscall!(listen(fd.raw(), 1024))?;

    Ok(unsafe { net::TcpListener::from_raw_fd(fd.into_raw()) })
}
