use super::driver::IoDriver;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// An entry in the timer min-heap.
///
/// Timers fire at or after their deadline, never before. A repeating
/// timer carries its period and is reinserted when it fires, unless it
/// was cancelled in the meantime.
pub(crate) struct TimerEntry {
    /// The time at which the timer should fire.
    pub(crate) deadline: Instant,

    /// Repeat period for recurring timers.
    pub(crate) period: Option<Duration>,

    /// Action run when the deadline is reached. Shared so a recurring
    /// timer can be reinserted without cloning the closure itself.
    pub(crate) callback: Arc<dyn Fn() + Send + Sync>,

    /// Cancellation flag shared with the [`TimerHandle`]. Read and
    /// written only under the driver's event lock.
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    /// Orders by deadline, **reversed**, so a `BinaryHeap<TimerEntry>`
    /// behaves as a min-heap and pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Cancellation handle for a scheduled timer.
///
/// Cancelling before the deadline guarantees the callback never fires;
/// the flag is set under the same lock the expiry path checks it under,
/// so the race resolves first-locker-wins. Dropping the handle does not
/// cancel the timer.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    driver: Weak<IoDriver>,
}

impl TimerHandle {
    pub(crate) fn new(cancelled: Arc<AtomicBool>, driver: Weak<IoDriver>) -> Self {
        Self { cancelled, driver }
    }

    /// Cancels the timer. Idempotent; safe after the timer has fired.
    pub fn cancel(&self) {
        match self.driver.upgrade() {
            Some(driver) => driver.cancel_timer(&self.cancelled),
            // The driver is gone, so no expiry path can race this store.
            None => self.cancelled.store(true, AtomicOrdering::Release),
        }
    }

    /// Whether the timer has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}
