//! OS-thread wrapper with synchronized startup.
//!
//! Worker threads are created through [`OsThread`], which blocks the
//! creator until the new thread has recorded its kernel id and bound its
//! thread-local name. This guarantees the creator never observes a
//! half-initialized thread object.
//!
//! The startup handshake uses a small counting [`Semaphore`] built from a
//! mutex and a condition variable.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::io;

thread_local! {
    /// Name bound to this thread. Threads not created through [`OsThread`]
    /// report "main".
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("main"));

    /// Cached kernel thread id, fetched on first use.
    static THREAD_ID: Cell<libc::pid_t> = const { Cell::new(0) };
}

/// Counting semaphore used to synchronize thread startup.
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then consumes it.
    pub(crate) fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        // Re-check after every wakeup; condvars may wake spuriously.
        while *count == 0 {
            count = self.available.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Releases one permit, waking a waiter if any.
    pub(crate) fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.available.notify_one();
    }
}

/// A named OS thread.
///
/// [`OsThread::create`] returns only after the thread is fully
/// initialized: its kernel id is recorded and its thread-local context is
/// bound, so the handle's accessors are valid immediately.
pub struct OsThread {
    id: libc::pid_t,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl OsThread {
    /// Spawns `f` on a new thread named `name`.
    ///
    /// Blocks the caller until the thread has published its kernel id and
    /// bound its name. Thread-creation failure is a hard error.
    pub fn create<F>(f: F, name: String) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let ready = Arc::new(Semaphore::new(0));
        let id_slot = Arc::new(Mutex::new(0 as libc::pid_t));

        let ready_child = ready.clone();
        let id_child = id_slot.clone();
        let bound_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            *id_child.lock().unwrap() = current_thread_id();
            THREAD_NAME.with(|n| *n.borrow_mut() = bound_name);
            ready_child.signal();
            f();
        })?;

        ready.wait();
        let id = *id_slot.lock().unwrap();

        Ok(Self {
            id,
            name,
            handle: Some(handle),
        })
    }

    /// Kernel thread id of the wrapped thread.
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    /// Name the thread was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the thread finishes.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Kernel thread id of the calling thread.
pub fn current_thread_id() -> libc::pid_t {
    THREAD_ID.with(|id| {
        let cached = id.get();
        if cached != 0 {
            return cached;
        }
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
        id.set(tid);
        tid
    })
}

/// Name bound to the calling thread.
pub fn current_thread_name() -> String {
    THREAD_NAME.with(|name| name.borrow().clone())
}
