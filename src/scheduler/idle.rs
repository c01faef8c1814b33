use super::core::Core;
use super::task::Task;

use std::time::Duration;

/// Policy invoked by a worker whose ready queue is empty.
///
/// The default implementation parks on the queue's condition variable.
/// The I/O event manager installs its own policy that blocks in the
/// multiplexer instead, merging readiness and timer wakeups into a single
/// wait point.
pub(crate) trait Idle: Send + Sync {
    /// Blocks until work is likely available.
    ///
    /// Returns tasks the wait itself produced (ready I/O waiters, due
    /// timers); the worker enqueues them before looking at the queue
    /// again. The default policy always returns an empty list.
    fn wait(&self, core: &Core) -> Vec<Task>;

    /// Wakes any worker currently blocked in [`Idle::wait`].
    fn notify(&self, core: &Core);

    /// Whether the policy still holds pending work a stopping worker
    /// must wait out. Workers exit only once the queue is empty and
    /// this reports `true`.
    fn drained(&self) -> bool {
        true
    }
}

/// Condvar-based default idle policy.
pub(crate) struct ParkIdle;

impl Idle for ParkIdle {
    fn wait(&self, core: &Core) -> Vec<Task> {
        let queue = core.queue.lock().unwrap();
        if queue.is_empty() && !core.is_stopping() {
            // Bounded wait so a missed notification cannot park a worker
            // forever.
            let _unused = core
                .queue_ready
                .wait_timeout(queue, Duration::from_millis(50))
                .unwrap();
        }
        Vec::new()
    }

    fn notify(&self, core: &Core) {
        core.queue_ready.notify_all();
    }
}
