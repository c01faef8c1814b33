//! I/O event manager: epoll readiness and timers merged into the
//! scheduler's idle path.
//!
//! Workers with an empty ready queue block in `epoll_wait` with the
//! nearest timer deadline as the timeout. A single wait point serves
//! both readiness- and time-driven wakeups; an eventfd waker interrupts
//! it when new work or a nearer deadline arrives.

mod driver;
mod manager;
mod poller;
mod timer;

pub use driver::{EventError, EventKind, Trigger, Waiter};
pub use manager::IoManager;
pub use timer::TimerHandle;
