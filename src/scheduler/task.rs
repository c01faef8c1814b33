use crate::fiber::Fiber;

use std::sync::Arc;

/// A unit of work accepted by the scheduler.
///
/// Either an already-built fiber, or a bare callable that is wrapped into
/// a fresh fiber when a worker dequeues it.
pub enum Task {
    /// Resume an existing fiber.
    Fiber(Arc<Fiber>),

    /// Run a callable inside a new fiber.
    Call(Box<dyn FnOnce() + Send>),
}

impl Task {
    /// Wraps a callable.
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

/// A queued task plus an optional worker pin.
///
/// A pinned entry is consumed only by the worker it names; unpinned
/// entries go to whichever worker pops first, in submission order.
pub(crate) struct Entry {
    pub(crate) task: Task,
    pub(crate) pinned: Option<usize>,
}
