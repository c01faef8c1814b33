//! Per-descriptor bookkeeping for hooked sockets.
//!
//! Managed sockets are kept `O_NONBLOCK` at the system level so the
//! retry loop works; the registry remembers what the *user* asked for
//! (blocking or not, per-direction timeouts) so hooked `fcntl` and the
//! timeout machinery preserve observable semantics.

use super::sys::{REAL, cvt};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

#[derive(Default, Clone)]
struct FdEntry {
    /// Non-blocking as requested by the user, not the system flag.
    user_nonblock: bool,
    recv_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
}

static ENTRIES: LazyLock<Mutex<HashMap<RawFd, FdEntry>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Puts a known socket under management: records it and forces the
/// system `O_NONBLOCK` flag on.
pub(crate) fn track(fd: RawFd) -> io::Result<()> {
    set_system_nonblock(fd)?;
    ENTRIES.lock().unwrap().insert(fd, FdEntry::default());
    Ok(())
}

/// Lazily manages a descriptor on first hooked use.
///
/// Returns `true` for managed sockets. Sockets not yet seen are probed:
/// a pre-existing `O_NONBLOCK` flag is recorded as the user's request
/// before the system flag is forced on. Non-sockets are left alone and
/// take the passthrough path.
pub(crate) fn ensure(fd: RawFd) -> bool {
    if is_tracked(fd) {
        return true;
    }

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return false;
    }

    let flags = match cvt(unsafe { (REAL.fcntl)(fd, libc::F_GETFL) }) {
        Ok(flags) => flags,
        Err(_) => return false,
    };
    let user_nonblock = flags & libc::O_NONBLOCK != 0;
    if !user_nonblock
        && cvt(unsafe { (REAL.fcntl)(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).is_err()
    {
        return false;
    }

    ENTRIES.lock().unwrap().insert(
        fd,
        FdEntry {
            user_nonblock,
            ..FdEntry::default()
        },
    );
    true
}

/// Drops the registry entry, if any. Called by hooked `close`.
pub(crate) fn untrack(fd: RawFd) {
    ENTRIES.lock().unwrap().remove(&fd);
}

pub(crate) fn is_tracked(fd: RawFd) -> bool {
    ENTRIES.lock().unwrap().contains_key(&fd)
}

/// Whether the user asked for non-blocking semantics on this fd.
/// Untracked descriptors report their actual system flag semantics
/// through passthrough, so this only answers for tracked ones.
pub(crate) fn user_nonblock(fd: RawFd) -> bool {
    ENTRIES
        .lock()
        .unwrap()
        .get(&fd)
        .is_some_and(|entry| entry.user_nonblock)
}

pub(crate) fn set_user_nonblock(fd: RawFd, nonblock: bool) {
    if let Some(entry) = ENTRIES.lock().unwrap().get_mut(&fd) {
        entry.user_nonblock = nonblock;
    }
}

pub(crate) fn recv_timeout(fd: RawFd) -> Option<Duration> {
    ENTRIES
        .lock()
        .unwrap()
        .get(&fd)
        .and_then(|entry| entry.recv_timeout)
}

pub(crate) fn send_timeout(fd: RawFd) -> Option<Duration> {
    ENTRIES
        .lock()
        .unwrap()
        .get(&fd)
        .and_then(|entry| entry.send_timeout)
}

pub(crate) fn set_recv_timeout(fd: RawFd, timeout: Option<Duration>) {
    if let Some(entry) = ENTRIES.lock().unwrap().get_mut(&fd) {
        entry.recv_timeout = timeout;
    }
}

pub(crate) fn set_send_timeout(fd: RawFd, timeout: Option<Duration>) {
    if let Some(entry) = ENTRIES.lock().unwrap().get_mut(&fd) {
        entry.send_timeout = timeout;
    }
}

fn set_system_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { (REAL.fcntl)(fd, libc::F_GETFL) })?;
    cvt(unsafe { (REAL.fcntl)(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}
