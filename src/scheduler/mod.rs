//! M:N fiber scheduler.
//!
//! A fixed pool of worker threads shares one FIFO ready queue. Each entry
//! is either an existing fiber to resume or a bare callable, wrapped into
//! a fresh fiber on first dispatch. Entries may be pinned to a specific
//! worker; unpinned entries go to whichever worker pops first.
//!
//! Workers with nothing to run hand control to an [`idle`] policy. The
//! default policy parks on a condition variable; the I/O event manager
//! swaps in a policy that blocks in the readiness multiplexer instead.

mod core;
mod idle;
mod task;

pub use self::core::Scheduler;
pub use self::task::Task;

pub(crate) use self::core::Core;
pub(crate) use self::idle::Idle;
