//! Indirection table for the real blocking calls.
//!
//! Hooked operations never shadow symbols; they go through [`REAL`],
//! resolved once at first use, so the underlying calls stay reachable
//! for passthrough no matter what the enable flags say.

use libc::{c_int, c_void, size_t, sockaddr, socklen_t, ssize_t};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::LazyLock;

pub(crate) struct RealCalls {
    pub(crate) socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    pub(crate) accept: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
    pub(crate) connect: unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int,
    pub(crate) read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t,
    pub(crate) recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t,
    pub(crate) write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t,
    pub(crate) send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
    pub(crate) close: unsafe extern "C" fn(c_int) -> c_int,
    pub(crate) fcntl: unsafe extern "C" fn(c_int, c_int, ...) -> c_int,
}

pub(crate) static REAL: LazyLock<RealCalls> = LazyLock::new(|| RealCalls {
    socket: libc::socket,
    accept: libc::accept,
    connect: libc::connect,
    read: libc::read,
    recv: libc::recv,
    write: libc::write,
    send: libc::send,
    close: libc::close,
    fcntl: libc::fcntl,
});

pub(crate) fn cvt(result: c_int) -> io::Result<c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// Converts a Rust socket address into its C layout plus length.
pub(crate) fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, raw);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, raw);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

/// Pending error of a socket, via `SO_ERROR`. Consumes the error state.
pub(crate) fn socket_error(fd: c_int) -> io::Result<Option<io::Error>> {
    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut _ as *mut c_void,
            &mut len,
        )
    })?;

    if error == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(error)))
    }
}
