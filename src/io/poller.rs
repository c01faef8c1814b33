//! Thin wrapper over the Linux `epoll` multiplexer.
//!
//! The poller owns an epoll instance plus an `eventfd`-backed [`Waker`]
//! that lets any thread interrupt a blocking wait. Descriptors are
//! registered edge-triggered with the descriptor itself as the token.

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLET, EPOLLHUP,
    EPOLLIN, EPOLLOUT, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Reserved token for the wake-up event. Descriptor tokens are real fds,
/// so `u64::MAX` can never collide.
const WAKE_TOKEN: u64 = u64::MAX;

/// Capacity of the per-call event buffer. Several workers may poll
/// concurrently, so the buffer lives on the caller's stack.
const EVENT_BATCH: usize = 64;

fn cvt(result: i32) -> io::Result<i32> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// Directional interest set for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// Readiness reported for one descriptor by a single poll pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// Handle that interrupts a blocking [`Poller::poll`].
///
/// Writes to the internal `eventfd`; the value is sticky until some poll
/// pass drains it, so a wake issued while no thread is waiting is not
/// lost.
pub(crate) struct Waker(RawFd);

impl Waker {
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.0, &buf as *const _ as *const _, 8);
        }
    }

    fn drain(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(self.0, &mut buf as *mut _ as *mut _, 8);
        }
    }
}

/// Linux `epoll` poller.
///
/// Safe for concurrent use: registration and waiting take `&self`, and
/// several worker threads may block in [`Poller::poll`] at once.
pub(crate) struct Poller {
    epoll: RawFd,
    waker: Arc<Waker>,
}

unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

impl Poller {
    /// Creates the epoll instance and its wake `eventfd`, registering the
    /// eventfd as a persistent level-triggered wake source.
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = cvt(unsafe { epoll_create1(EPOLL_CLOEXEC) })?;

        let eventfd = match cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })
        {
            Ok(fd) => fd,
            Err(err) => {
                unsafe { libc::close(epoll) };
                return Err(err);
            }
        };

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        if let Err(err) = cvt(unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, eventfd, &mut event) }) {
            unsafe {
                libc::close(eventfd);
                libc::close(epoll);
            }
            return Err(err);
        }

        Ok(Self {
            epoll,
            waker: Arc::new(Waker(eventfd)),
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    fn flags(interest: Interest) -> u32 {
        let mut flags = EPOLLET as u32;
        if interest.read {
            flags |= EPOLLIN as u32;
        }
        if interest.write {
            flags |= EPOLLOUT as u32;
        }
        flags
    }

    /// Adds a descriptor with the given interests, edge-triggered.
    pub(crate) fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: Self::flags(interest),
            u64: fd as u64,
        };
        cvt(unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) }).map(drop)
    }

    /// Updates the interests of an already registered descriptor.
    pub(crate) fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: Self::flags(interest),
            u64: fd as u64,
        };
        cvt(unsafe { epoll_ctl(self.epoll, EPOLL_CTL_MOD, fd, &mut event) }).map(drop)
    }

    /// Removes a descriptor entirely.
    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) }).map(drop)
    }

    /// Blocks until readiness, a wake, or the timeout, and appends the
    /// reported descriptors to `out`.
    ///
    /// `None` waits indefinitely. An interrupted wait returns successfully
    /// with no events; the caller loops.
    pub(crate) fn poll(&self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout.map(duration_to_ms).unwrap_or(-1);

        let mut buffer: [epoll_event; EVENT_BATCH] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            epoll_wait(
                self.epoll,
                buffer.as_mut_ptr(),
                EVENT_BATCH as i32,
                timeout_ms,
            )
        };

        let n = match cvt(n) {
            Ok(n) => n as usize,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };

        for ev in &buffer[..n] {
            if ev.u64 == WAKE_TOKEN {
                self.waker.drain();
                continue;
            }

            // EPOLLERR / EPOLLHUP ready both directions so every waiter
            // retries and observes the real error from its own call.
            let failed = ev.events & (EPOLLERR as u32 | EPOLLHUP as u32) != 0;
            out.push(Readiness {
                fd: ev.u64 as RawFd,
                readable: failed || ev.events & EPOLLIN as u32 != 0,
                writable: failed || ev.events & EPOLLOUT as u32 != 0,
            });
        }

        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.waker.0);
            libc::close(self.epoll);
        }
    }
}

/// Rounds a timeout up to whole milliseconds so timers never fire early.
fn duration_to_ms(timeout: Duration) -> i32 {
    let millis = timeout.as_millis();
    let rounded = if timeout.subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    };
    rounded.min(i32::MAX as u128) as i32
}
