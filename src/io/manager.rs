use super::driver::{EventError, EventKind, IoDriver, Trigger, Waiter};
use super::timer::TimerHandle;
use crate::fiber::Fiber;
use crate::hook;
use crate::scheduler::{Scheduler, Task};

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

thread_local! {
    /// Manager driving the calling thread, installed on every worker.
    /// Weak so idle workers cannot keep a dropped manager alive.
    static CURRENT: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

/// Scheduler specialized with an I/O-aware idle path.
///
/// Owns a [`Scheduler`] whose idle policy blocks in the readiness
/// multiplexer instead of parking, waking on descriptor readiness, timer
/// expiry, or new work. Fibers suspended on a hooked blocking call are
/// registered here and re-enqueued when their descriptor turns ready.
pub struct IoManager {
    scheduler: Scheduler,
    driver: Arc<IoDriver>,
    stopped: AtomicBool,
}

impl IoManager {
    /// Builds the multiplexer, wires it into a new scheduler as the idle
    /// policy, and starts `threads` workers. Every worker gets this
    /// manager as its thread-local current manager and hooking enabled.
    pub fn new(name: &str, threads: usize) -> io::Result<Arc<Self>> {
        let driver = Arc::new(IoDriver::new()?);
        let scheduler = Scheduler::with_idle(name, threads, false, driver.clone());

        let manager = Arc::new(Self {
            scheduler,
            driver,
            stopped: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&manager);
        manager.scheduler.set_thread_init(Box::new(move || {
            let weak = weak.clone();
            CURRENT.with(|current| *current.borrow_mut() = Some(weak));
            hook::set_thread_enabled(true);
        }));

        manager.scheduler.start()?;
        Ok(manager)
    }

    /// The manager driving the calling thread, if any.
    ///
    /// `None` outside manager worker threads; the hook layer uses this to
    /// decide between the cooperative path and plain passthrough.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Enqueues a callable; it runs inside a fresh fiber on some worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(f);
    }

    /// Enqueues an existing fiber for resumption.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    /// Registers a waiter for one direction of a descriptor.
    ///
    /// At most one waiter per descriptor and direction; a duplicate is a
    /// usage error. The waiter is consumed exactly once: scheduled on
    /// readiness, on cancellation, or dropped by [`IoManager::del_event`].
    pub fn add_event(&self, fd: RawFd, kind: EventKind, waiter: Waiter) -> Result<(), EventError> {
        self.driver.add_event(fd, kind, waiter)
    }

    /// Registers the current fiber for one direction, to be re-enqueued
    /// on readiness. The caller yields suspended afterwards.
    pub fn add_event_for_current(&self, fd: RawFd, kind: EventKind) -> Result<(), EventError> {
        self.add_event(fd, kind, Waiter::Fiber(Fiber::current()))
    }

    /// Removes one interest without firing its waiter. Returns `false`
    /// when nothing was registered for that direction.
    pub fn del_event(&self, fd: RawFd, kind: EventKind) -> bool {
        self.driver.del_event(fd, kind)
    }

    /// Removes one interest and immediately schedules its waiter:
    /// callbacks run with [`Trigger::Cancelled`], fibers are re-enqueued
    /// so their retry loop observes the condition. Returns `false` when
    /// nothing was registered.
    pub fn cancel_event(&self, fd: RawFd, kind: EventKind) -> bool {
        match self.take_event(fd, kind) {
            Some(waiter) => {
                self.schedule_waiter(waiter);
                true
            }
            None => false,
        }
    }

    /// Removes one interest and returns its claimed waiter without
    /// scheduling it.
    ///
    /// Lets the caller publish state the waiter must observe (the hook
    /// layer's timed-out flag) before handing it to
    /// [`IoManager::schedule_waiter`]; scheduling first would let a
    /// worker resume the waiter ahead of the store.
    pub fn take_event(&self, fd: RawFd, kind: EventKind) -> Option<Waiter> {
        self.driver.cancel_event(fd, kind)
    }

    /// Cancels both directions of a descriptor. Returns `true` if any
    /// waiter was released. Used by hooked `close` and by shutdown.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let claimed = self.driver.cancel_all(fd);
        let any = !claimed.is_empty();
        for waiter in claimed {
            self.schedule_waiter(waiter);
        }
        any
    }

    /// Enqueues a previously claimed waiter: callbacks run with
    /// [`Trigger::Cancelled`], fibers are re-enqueued as-is.
    pub fn schedule_waiter(&self, waiter: Waiter) {
        let task = match waiter {
            Waiter::Fiber(fiber) => Task::Fiber(fiber),
            Waiter::Callback(callback) => Task::call(move || callback(Trigger::Cancelled)),
        };
        self.scheduler.schedule_task(task);
    }

    /// Schedules a one-shot or recurring timer. The callback runs on a
    /// worker at or after the deadline, never before. Cancel through the
    /// returned handle; cancel-before-expiry guarantees it never runs.
    pub fn add_timer<F>(&self, delay: Duration, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let period = recurring.then_some(delay);
        self.driver.add_timer(delay, period, Arc::new(callback))
    }

    /// Whether the descriptor has any active registration.
    pub fn has_registration(&self, fd: RawFd) -> bool {
        self.driver.has_registration(fd)
    }

    /// Number of outstanding directional registrations.
    pub fn pending_events(&self) -> usize {
        self.driver.pending_events()
    }

    /// Stops the manager: rejects further registrations and cancels every
    /// outstanding one (waiters scheduled with [`Trigger::Cancelled`]),
    /// then drains the queue and pending timers and joins the workers.
    /// Suspended sleeps and timeouts complete before `stop` returns;
    /// recurring timers stop repeating. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        for waiter in self.driver.drain_all() {
            self.schedule_waiter(waiter);
        }
        self.scheduler.stop();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.stop();
    }
}
