use super::poller::{Interest, Poller, Readiness};
use super::timer::{TimerEntry, TimerHandle};
use crate::fiber::Fiber;
use crate::scheduler::{Core, Idle, Task};

use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Direction of interest for an event registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
}

/// How a registered waiter was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The descriptor became ready for the registered direction.
    Ready,

    /// The registration was cancelled before readiness arrived.
    Cancelled,
}

/// Errors from event registration.
#[derive(Debug, Error)]
pub enum EventError {
    /// The direction already has a waiter. One waiter per descriptor and
    /// direction; a second registration is a usage bug.
    #[error("fd {fd} already has a {kind:?} registration")]
    AlreadyRegistered { fd: RawFd, kind: EventKind },

    /// The manager is shutting down and accepts no new registrations.
    #[error("event manager is shutting down")]
    ShuttingDown,

    /// The multiplexer rejected the descriptor. The registration table
    /// was rolled back; the error is reported, never retried.
    #[error("multiplexer registration failed: {0}")]
    Multiplexer(#[source] io::Error),
}

/// The party woken when a registration triggers.
pub enum Waiter {
    /// A suspended fiber, re-enqueued as-is; its retry loop observes the
    /// actual condition.
    Fiber(Arc<Fiber>),

    /// A callback told whether it fired on readiness or cancellation.
    Callback(Box<dyn FnOnce(Trigger) + Send>),
}

impl Waiter {
    fn into_task(self, trigger: Trigger) -> Task {
        match self {
            Waiter::Fiber(fiber) => Task::Fiber(fiber),
            Waiter::Callback(callback) => Task::call(move || callback(trigger)),
        }
    }
}

/// Per-descriptor registration: at most one waiter per direction.
#[derive(Default)]
struct FdWaiters {
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl FdWaiters {
    fn slot(&mut self, kind: EventKind) -> &mut Option<Waiter> {
        match kind {
            EventKind::Read => &mut self.read,
            EventKind::Write => &mut self.write,
        }
    }

    fn interest(&self) -> Interest {
        Interest {
            read: self.read.is_some(),
            write: self.write.is_some(),
        }
    }
}

/// Registration table and timer heap, mutated together under one lock.
///
/// This lock is distinct from the scheduler's queue lock: workers
/// register and cancel concurrently while another worker blocks in the
/// multiplexer.
struct DriverState {
    table: HashMap<RawFd, FdWaiters>,
    timers: BinaryHeap<TimerEntry>,
}

/// Readiness multiplexer plus timer heap, shared by all workers.
///
/// Installed as the scheduler's idle policy: a worker with an empty
/// queue blocks in `epoll_wait` with the nearest timer deadline as its
/// timeout, merging time- and readiness-driven wakeups into one wait
/// point.
pub(crate) struct IoDriver {
    poller: Poller,
    state: Mutex<DriverState>,
    shutdown: AtomicBool,
}

impl IoDriver {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            state: Mutex::new(DriverState {
                table: HashMap::new(),
                timers: BinaryHeap::new(),
            }),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Registers a waiter for one direction of a descriptor.
    ///
    /// The first directional registration adds the descriptor to the
    /// multiplexer; a second direction updates it. A multiplexer failure
    /// rolls the table back.
    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        kind: EventKind,
        waiter: Waiter,
    ) -> Result<(), EventError> {
        let mut state = self.state.lock().unwrap();

        if self.shutdown.load(Ordering::Acquire) {
            return Err(EventError::ShuttingDown);
        }

        let known = state.table.contains_key(&fd);
        let waiters = state.table.entry(fd).or_default();

        if waiters.slot(kind).is_some() {
            return Err(EventError::AlreadyRegistered { fd, kind });
        }
        *waiters.slot(kind) = Some(waiter);

        let interest = waiters.interest();
        let registered = if known {
            self.poller.reregister(fd, interest)
        } else {
            self.poller.register(fd, interest)
        };

        if let Err(err) = registered {
            let waiters = state.table.get_mut(&fd).unwrap();
            *waiters.slot(kind) = None;
            if waiters.interest().is_empty() {
                state.table.remove(&fd);
            }
            return Err(EventError::Multiplexer(err));
        }

        Ok(())
    }

    /// Removes one interest without firing its waiter. Returns `false`
    /// when nothing was registered for that direction.
    pub(crate) fn del_event(&self, fd: RawFd, kind: EventKind) -> bool {
        let mut state = self.state.lock().unwrap();
        self.take_waiter(&mut state, fd, kind).is_some()
    }

    /// Removes one interest and returns its waiter for the caller to
    /// schedule.
    pub(crate) fn cancel_event(&self, fd: RawFd, kind: EventKind) -> Option<Waiter> {
        let mut state = self.state.lock().unwrap();
        self.take_waiter(&mut state, fd, kind)
    }

    /// Removes both interests of a descriptor, returning any waiters.
    pub(crate) fn cancel_all(&self, fd: RawFd) -> Vec<Waiter> {
        let mut state = self.state.lock().unwrap();
        let mut claimed = Vec::new();
        for kind in [EventKind::Read, EventKind::Write] {
            if let Some(waiter) = self.take_waiter(&mut state, fd, kind) {
                claimed.push(waiter);
            }
        }
        claimed
    }

    /// Claims the waiter for one direction and updates the multiplexer
    /// registration accordingly. Must run under the event lock.
    fn take_waiter(&self, state: &mut DriverState, fd: RawFd, kind: EventKind) -> Option<Waiter> {
        let waiters = state.table.get_mut(&fd)?;
        let waiter = waiters.slot(kind).take()?;

        let interest = waiters.interest();
        if interest.is_empty() {
            state.table.remove(&fd);
            if let Err(err) = self.poller.deregister(fd) {
                // The fd may already be closed; the kernel removed it.
                log::trace!("deregister fd {fd} failed: {err}");
            }
        } else if let Err(err) = self.poller.reregister(fd, interest) {
            log::trace!("reregister fd {fd} failed: {err}");
        }

        Some(waiter)
    }

    /// Claims every outstanding waiter; later registrations are
    /// rejected. Pending timers are left to run out, so suspended
    /// sleeps and timeouts still complete during shutdown.
    pub(crate) fn drain_all(&self) -> Vec<Waiter> {
        self.shutdown.store(true, Ordering::Release);

        let mut state = self.state.lock().unwrap();
        let fds: Vec<RawFd> = state.table.keys().copied().collect();
        let mut claimed = Vec::new();
        for fd in fds {
            for kind in [EventKind::Read, EventKind::Write] {
                if let Some(waiter) = self.take_waiter(&mut state, fd, kind) {
                    claimed.push(waiter);
                }
            }
        }
        claimed
    }

    /// Whether the descriptor has any active registration.
    pub(crate) fn has_registration(&self, fd: RawFd) -> bool {
        self.state.lock().unwrap().table.contains_key(&fd)
    }

    /// Number of outstanding directional registrations.
    pub(crate) fn pending_events(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .table
            .values()
            .map(|w| w.read.is_some() as usize + w.write.is_some() as usize)
            .sum()
    }

    /// Schedules a timer. A nearer-than-current deadline wakes the
    /// blocked wait so the new timeout takes effect immediately.
    pub(crate) fn add_timer(
        self: &Arc<Self>,
        delay: Duration,
        period: Option<Duration>,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + delay;

        let mut state = self.state.lock().unwrap();
        let nearest = state.timers.peek().map(|entry| entry.deadline);
        state.timers.push(TimerEntry {
            deadline,
            period,
            callback,
            cancelled: cancelled.clone(),
        });
        drop(state);

        if nearest.is_none_or(|previous| deadline < previous) {
            self.poller.waker().wake();
        }

        TimerHandle::new(cancelled, Arc::downgrade(self))
    }

    /// Marks a timer cancelled. Taking the event lock orders the store
    /// against the expiry pass, so a cancel that wins the lock first
    /// guarantees the callback never runs.
    pub(crate) fn cancel_timer(&self, cancelled: &Arc<AtomicBool>) {
        let _state = self.state.lock().unwrap();
        cancelled.store(true, Ordering::Release);
    }

    /// Time until the nearest live timer, pruning cancelled heap heads.
    fn next_deadline(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        while let Some(entry) = state.timers.peek() {
            if entry.cancelled.load(Ordering::Acquire) {
                state.timers.pop();
                continue;
            }
            return Some(entry.deadline.saturating_duration_since(Instant::now()));
        }
        None
    }

    /// One idle pass: claim waiters for every reported descriptor, then
    /// pop due timers. Readiness is handled first, so a readiness event
    /// and a timeout observed in the same pass resolve in favor of
    /// readiness.
    fn collect(&self, ready: Vec<Readiness>) -> Vec<Task> {
        let mut tasks = Vec::new();
        let mut state = self.state.lock().unwrap();

        for event in ready {
            if event.readable {
                if let Some(waiter) = self.take_waiter(&mut state, event.fd, EventKind::Read) {
                    tasks.push(waiter.into_task(Trigger::Ready));
                }
            }
            if event.writable {
                if let Some(waiter) = self.take_waiter(&mut state, event.fd, EventKind::Write) {
                    tasks.push(waiter.into_task(Trigger::Ready));
                }
            }
        }

        let now = Instant::now();
        while let Some(entry) = state.timers.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = state.timers.pop().unwrap();
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }

            let callback = entry.callback.clone();
            tasks.push(Task::call(move || callback()));

            // Recurring timers stop reinserting during shutdown, otherwise
            // the drain would never finish.
            if self.shutdown.load(Ordering::Acquire) {
                continue;
            }
            if let Some(period) = entry.period {
                state.timers.push(TimerEntry {
                    deadline: now + period,
                    period: entry.period,
                    callback: entry.callback,
                    cancelled: entry.cancelled,
                });
            }
        }

        tasks
    }
}

impl Idle for IoDriver {
    fn wait(&self, _core: &Core) -> Vec<Task> {
        let timeout = self.next_deadline();
        let mut ready = Vec::new();
        if let Err(err) = self.poller.poll(&mut ready, timeout) {
            log::error!("multiplexer wait failed: {err}");
            return Vec::new();
        }

        self.collect(ready)
    }

    fn notify(&self, _core: &Core) {
        self.poller.waker().wake();
    }

    fn drained(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while let Some(entry) = state.timers.peek() {
            if entry.cancelled.load(Ordering::Acquire) {
                state.timers.pop();
                continue;
            }
            return false;
        }
        state.table.is_empty()
    }
}
