//! # Weft
//!
//! **Weft** is a user-space M:N fiber runtime for Linux: many lightweight
//! stackful fibers multiplexed over a small pool of OS threads, with
//! ordinary blocking network calls behaving as implicitly asynchronous
//! operations.
//!
//! The runtime is built from four pieces:
//!
//! - A **fiber**: an independent stack plus saved register state,
//!   resumable and suspendable without blocking the host thread
//! - A **scheduler** dispatching fibers and callables from a shared FIFO
//!   queue onto worker threads
//! - An **I/O event manager** that specializes the scheduler's idle path:
//!   workers block in `epoll` with the nearest timer deadline as the
//!   timeout, merging readiness- and time-driven wakeups
//! - A **hook layer** of cooperative replacements for blocking calls
//!   (`accept`, `connect`, `read`, `write`, `sleep`, ...) that suspend
//!   the fiber instead of the thread and retry on readiness
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use weft::IoManager;
//! use std::time::Duration;
//!
//! let manager = IoManager::new("weft", 4).expect("failed to start runtime");
//!
//! manager.schedule(|| {
//!     // Runs inside a fiber; hooked calls suspend instead of blocking.
//!     weft::hook::sleep(Duration::from_millis(100));
//!     println!("slept cooperatively");
//! });
//!
//! manager.stop();
//! ```
//!
//! ## Modules
//!
//! - [`fiber`]: stackful execution contexts with an atomic lifecycle
//! - [`scheduler`]: the worker pool and ready queue
//! - [`io`]: event registrations, timers, and the idle-path multiplexer
//! - [`hook`]: cooperative replacements for blocking calls
//! - [`thread`]: named OS threads with synchronized startup

pub mod fiber;
pub mod hook;
pub mod io;
pub mod scheduler;
pub mod thread;

pub use fiber::{DEFAULT_STACK_SIZE, Fiber, FiberError, FiberState, Resumption};
pub use io::{EventError, EventKind, IoManager, TimerHandle, Trigger, Waiter};
pub use scheduler::{Scheduler, Task};
