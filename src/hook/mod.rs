//! Cooperative replacements for blocking calls.
//!
//! Each covered call first checks whether the cooperative path applies:
//! hooking enabled process-wide and on this thread, a spawned fiber
//! running, and an [`IoManager`] driving the thread. Outside that path
//! it delegates straight to the real call.
//!
//! Inside it, the call is attempted non-blocking; on would-block the
//! fiber registers for the relevant direction (optionally arming a
//! timeout timer), suspends, and retries on wakeup. Observed return
//! values and error signaling match a real blocking call; only the
//! fiber suspends, never the OS thread.

mod fd;
mod sys;

use sys::{REAL, cvt, socket_error, to_sockaddr};

use crate::fiber::Fiber;
use crate::io::{EventKind, IoManager};

use libc::{c_int, c_void, ssize_t};
use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Process-wide master switch. On by default; the per-thread flag is
/// what actually opts worker threads in.
static ENABLED: AtomicBool = AtomicBool::new(true);

thread_local! {
    /// Set on manager worker threads, off everywhere else.
    static THREAD_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Enables or disables hooking process-wide.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Release);
}

pub fn enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

/// Enables or disables hooking for the calling thread.
pub fn set_thread_enabled(enabled: bool) {
    THREAD_ENABLED.with(|flag| flag.set(enabled));
}

pub fn thread_enabled() -> bool {
    THREAD_ENABLED.with(Cell::get)
}

/// Whether a hooked call on this thread would take the cooperative path.
pub fn is_active() -> bool {
    active_manager().is_some()
}

fn active_manager() -> Option<Arc<IoManager>> {
    if !enabled() || !thread_enabled() || !Fiber::in_fiber() {
        return None;
    }
    IoManager::current()
}

/// Real call with only `EINTR` recovery, for the non-cooperative path.
fn passthrough<F>(mut attempt: F) -> io::Result<usize>
where
    F: FnMut() -> ssize_t,
{
    loop {
        let n = attempt();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// The cooperative retry loop shared by every hooked I/O call.
///
/// Attempts non-blocking; immediate completion or a real error returns
/// unchanged and `EINTR` retries, so transient conditions stay invisible
/// to the caller. Would-block registers the fiber for `kind`, arms the
/// optional timeout, and suspends; on wakeup the attempt is retried
/// until completion, a hard error, or the timeout.
fn do_io<F>(fd: RawFd, kind: EventKind, timeout: Option<Duration>, mut attempt: F) -> io::Result<usize>
where
    F: FnMut() -> ssize_t,
{
    let manager = match active_manager() {
        Some(manager) if fd::ensure(fd) => manager,
        _ => return passthrough(attempt),
    };

    loop {
        let n = attempt();
        if n >= 0 {
            return Ok(n as usize);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                // The user asked for non-blocking semantics themselves.
                if fd::user_nonblock(fd) {
                    return Err(err);
                }
                wait_ready(&manager, fd, kind, timeout)?;
            }
            _ => return Err(err),
        }
    }
}

/// Registers the current fiber for `kind` on `fd` and suspends until
/// readiness, cancellation, or the timeout.
///
/// The timeout action claims the registration under the event lock and
/// marks the shared flag only if the claim succeeded, so a readiness
/// event observed in the same wait epoch wins over the timeout. The
/// flag is published before the fiber is re-enqueued; scheduling first
/// would let the resumed fiber miss it and silently re-arm a fresh
/// timeout.
fn wait_ready(
    manager: &Arc<IoManager>,
    fd: RawFd,
    kind: EventKind,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let timed_out = Arc::new(AtomicBool::new(false));

    let timer = timeout.map(|delay| {
        let weak = Arc::downgrade(manager);
        let flag = timed_out.clone();
        manager.add_timer(
            delay,
            move || {
                if let Some(manager) = weak.upgrade() {
                    if let Some(waiter) = manager.take_event(fd, kind) {
                        flag.store(true, Ordering::Release);
                        manager.schedule_waiter(waiter);
                    }
                }
            },
            false,
        )
    });

    if let Err(err) = manager.add_event_for_current(fd, kind) {
        if let Some(timer) = &timer {
            timer.cancel();
        }
        return Err(io::Error::other(err));
    }

    Fiber::yield_suspended();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    if timed_out.load(Ordering::Acquire) {
        return Err(io::Error::from(io::ErrorKind::TimedOut));
    }
    Ok(())
}

/// Suspends the current fiber for `duration` via a one-shot timer, or
/// sleeps the thread outside the cooperative path.
pub fn sleep(duration: Duration) {
    let Some(manager) = active_manager() else {
        thread::sleep(duration);
        return;
    };

    let fiber = Fiber::current();
    let weak = Arc::downgrade(&manager);
    manager.add_timer(
        duration,
        move || {
            if let Some(manager) = weak.upgrade() {
                manager.schedule_fiber(fiber.clone());
            }
        },
        false,
    );
    Fiber::yield_suspended();
}

/// Creates a socket. Inside the cooperative path the descriptor is put
/// under management: non-blocking at the system level, blocking as far
/// as the user can observe.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd> {
    let fd = cvt(unsafe { (REAL.socket)(domain, ty, protocol) })?;
    if is_active() {
        if let Err(err) = fd::track(fd) {
            unsafe { (REAL.close)(fd) };
            return Err(err);
        }
    }
    Ok(fd)
}

/// Accepts a connection, suspending instead of blocking. The accepted
/// socket is put under management like [`socket`]. Honors the listening
/// socket's receive timeout.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let timeout = fd::recv_timeout(fd);
    let conn = do_io(fd, EventKind::Read, timeout, || unsafe {
        (REAL.accept)(fd, ptr::null_mut(), ptr::null_mut()) as ssize_t
    })? as RawFd;

    if is_active() {
        if let Err(err) = fd::track(conn) {
            unsafe { (REAL.close)(conn) };
            return Err(err);
        }
    }
    Ok(conn)
}

/// Connects `fd` to `addr`, suspending instead of blocking.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_timeout(fd, addr, None)
}

/// [`connect`] with an optional timeout.
///
/// Write readiness after `EINPROGRESS` only means the attempt finished;
/// the verdict is read from the socket's pending error state.
pub fn connect_timeout(fd: RawFd, addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    let raw = &storage as *const _ as *const libc::sockaddr;

    let manager = match active_manager() {
        Some(manager) if fd::ensure(fd) => manager,
        _ => loop {
            match cvt(unsafe { (REAL.connect)(fd, raw, len) }) {
                Ok(_) => return Ok(()),
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            }
        },
    };

    match cvt(unsafe { (REAL.connect)(fd, raw, len) }) {
        Ok(_) => return Ok(()),
        Err(err) => match err.raw_os_error() {
            // Interrupted non-blocking connects also complete
            // asynchronously; both wait for writability.
            Some(libc::EINPROGRESS) | Some(libc::EINTR) => {
                if fd::user_nonblock(fd) {
                    return Err(err);
                }
            }
            _ => return Err(err),
        },
    }

    wait_ready(&manager, fd, EventKind::Write, timeout)?;

    match socket_error(fd)? {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Reads into `buf`, suspending instead of blocking. Honors the fd's
/// receive timeout.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let timeout = fd::recv_timeout(fd);
    do_io(fd, EventKind::Read, timeout, || unsafe {
        (REAL.read)(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

/// `recv` with flags, suspending instead of blocking.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    let timeout = fd::recv_timeout(fd);
    do_io(fd, EventKind::Read, timeout, || unsafe {
        (REAL.recv)(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

/// Writes `buf`, suspending instead of blocking. Honors the fd's send
/// timeout.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let timeout = fd::send_timeout(fd);
    do_io(fd, EventKind::Write, timeout, || unsafe {
        (REAL.write)(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

/// `send` with flags, suspending instead of blocking.
pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> io::Result<usize> {
    let timeout = fd::send_timeout(fd);
    do_io(fd, EventKind::Write, timeout, || unsafe {
        (REAL.send)(fd, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

/// Closes `fd`, first cancelling any pending registrations so no fiber
/// keeps waiting on a descriptor that no longer exists.
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(manager) = IoManager::current() {
        manager.cancel_all(fd);
    }
    fd::untrack(fd);
    cvt(unsafe { (REAL.close)(fd) }).map(drop)
}

/// `fcntl(F_GETFL)` that reports the flags the user set, not the forced
/// system-level non-blocking flag of managed sockets.
pub fn fcntl_getfl(fd: RawFd) -> io::Result<c_int> {
    let flags = cvt(unsafe { (REAL.fcntl)(fd, libc::F_GETFL) })?;
    if !fd::is_tracked(fd) {
        return Ok(flags);
    }
    if fd::user_nonblock(fd) {
        Ok(flags | libc::O_NONBLOCK)
    } else {
        Ok(flags & !libc::O_NONBLOCK)
    }
}

/// `fcntl(F_SETFL)` that records the user's non-blocking request while
/// keeping managed sockets non-blocking at the system level.
pub fn fcntl_setfl(fd: RawFd, flags: c_int) -> io::Result<()> {
    let flags = if fd::is_tracked(fd) {
        fd::set_user_nonblock(fd, flags & libc::O_NONBLOCK != 0);
        flags | libc::O_NONBLOCK
    } else {
        flags
    };
    cvt(unsafe { (REAL.fcntl)(fd, libc::F_SETFL, flags) }).map(drop)
}

/// Sets the receive timeout applied by hooked reads and accepts. Puts
/// the socket under management if it is not yet.
pub fn set_recv_timeout(fd: RawFd, timeout: Option<Duration>) {
    fd::ensure(fd);
    fd::set_recv_timeout(fd, timeout);
}

/// Sets the send timeout applied by hooked writes. Puts the socket
/// under management if it is not yet.
pub fn set_send_timeout(fd: RawFd, timeout: Option<Duration>) {
    fd::ensure(fd);
    fd::set_send_timeout(fd, timeout);
}
