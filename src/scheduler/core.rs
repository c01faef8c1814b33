use super::idle::{Idle, ParkIdle};
use super::task::{Entry, Task};
use crate::fiber::{DEFAULT_STACK_SIZE, Fiber, FiberError, FiberState, Resumption};
use crate::thread::OsThread;

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// Shared scheduler state: the task queue and everything workers need to
/// coordinate around it.
pub(crate) struct Core {
    /// Scheduler name, used for worker thread names and log lines.
    pub(crate) name: String,

    /// The ready queue. One lock; each entry is consumed by exactly one
    /// worker.
    pub(crate) queue: Mutex<VecDeque<Entry>>,

    /// Signaled on every push; the default idle policy parks on it.
    pub(crate) queue_ready: Condvar,

    /// Idle policy invoked by workers with nothing to run.
    pub(crate) idle: Arc<dyn Idle>,

    /// Set once by [`Scheduler::stop`]; workers drain and exit.
    stopping: AtomicBool,

    /// Per-worker setup, run once when a worker thread starts.
    thread_init: OnceLock<Box<dyn Fn() + Send + Sync>>,

    /// Stack size for fibers wrapped around bare callables.
    default_stack: usize,
}

impl Core {
    fn new(name: String, idle: Arc<dyn Idle>) -> Self {
        Self {
            name,
            queue: Mutex::new(VecDeque::new()),
            queue_ready: Condvar::new(),
            idle,
            stopping: AtomicBool::new(false),
            thread_init: OnceLock::new(),
            default_stack: DEFAULT_STACK_SIZE,
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Enqueues one entry and wakes an idle worker.
    pub(crate) fn push(&self, entry: Entry) {
        self.queue.lock().unwrap().push_back(entry);
        self.idle.notify(self);
    }

    /// Enqueues a batch of unpinned tasks with a single lock acquisition.
    pub(crate) fn push_many(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().unwrap();
        queue.extend(tasks.into_iter().map(|task| Entry { task, pinned: None }));
        drop(queue);
        self.idle.notify(self);
    }

    /// Pops the first entry admissible for `worker`, honoring pins.
    fn pop(&self, worker: usize) -> Option<Entry> {
        let mut queue = self.queue.lock().unwrap();
        let position = queue
            .iter()
            .position(|entry| entry.pinned.is_none_or(|pin| pin == worker))?;
        queue.remove(position)
    }
}

/// Dispatch loop run by every worker thread.
///
/// Pops ready entries in FIFO order, wraps bare callables into fresh
/// fibers, and resumes them. An empty queue hands control to the idle
/// policy. Exits once the scheduler is stopping and no admissible work
/// remains, propagating one more wakeup so sibling workers observe the
/// stop as well.
pub(crate) fn dispatch(core: &Arc<Core>, worker: usize) {
    if let Some(init) = core.thread_init.get() {
        init();
    }

    log::debug!("scheduler {}: worker {} started", core.name, worker);

    loop {
        let Some(entry) = core.pop(worker) else {
            // Stopping is cooperative: exit only once the idle policy has
            // no pending timers or registrations left to wait out.
            if core.is_stopping() && core.idle.drained() {
                break;
            }
            let woken = core.idle.wait(core);
            core.push_many(woken);
            continue;
        };

        run_entry(core, entry);
    }

    // Chain the wakeup so every remaining idle worker sees the stop flag.
    core.idle.notify(core);
    log::debug!("scheduler {}: worker {} exiting", core.name, worker);
}

fn run_entry(core: &Arc<Core>, entry: Entry) {
    let fiber = match entry.task {
        Task::Fiber(fiber) => fiber,
        Task::Call(body) => match Fiber::spawn(body, core.default_stack) {
            Ok(fiber) => fiber,
            Err(err) => {
                log::error!("scheduler {}: failed to spawn fiber: {err}", core.name);
                return;
            }
        },
    };

    match fiber.resume() {
        Ok(Resumption::Yielded { reschedule: true }) => {
            core.push(Entry {
                pinned: entry.pinned,
                task: Task::Fiber(fiber),
            });
        }
        // The fiber suspended pending an external event; the event or
        // timer machinery owns its wakeup.
        Ok(Resumption::Yielded { reschedule: false }) => {}
        Ok(Resumption::Terminated) => {}
        Ok(Resumption::Faulted) => {
            let message = fiber
                .take_fault()
                .map(fault_message)
                .unwrap_or_default();
            log::error!(
                "scheduler {}: fiber {} faulted: {message}",
                core.name,
                fiber.id()
            );
        }
        Err(FiberError::NotResumable {
            state: FiberState::Running,
            ..
        }) => {
            // The fiber is still mid-switch on another worker; requeue the
            // entry and pick it up once its context is fully saved.
            core.push(Entry {
                pinned: entry.pinned,
                task: Task::Fiber(fiber),
            });
        }
        Err(err) => {
            log::error!("scheduler {}: resume failed: {err}", core.name);
        }
    }
}

fn fault_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// M:N scheduler: a fixed pool of worker threads running fibers from a
/// shared FIFO queue.
///
/// Tasks can be scheduled from any context, including from inside a
/// running fiber. Stopping drains the queue cooperatively; no fiber is
/// ever killed mid-run. Dropping the scheduler stops it.
pub struct Scheduler {
    core: Arc<Core>,
    workers: Mutex<Vec<OsThread>>,
    threads: usize,
    use_caller: bool,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers.
    ///
    /// With `use_caller`, the constructing thread counts as the last
    /// worker: one fewer thread is spawned and the caller runs the
    /// dispatch loop inside [`Scheduler::stop`].
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0`.
    pub fn new(name: &str, threads: usize, use_caller: bool) -> Self {
        Self::with_idle(name, threads, use_caller, Arc::new(ParkIdle))
    }

    /// Creates a scheduler with a custom idle policy.
    pub(crate) fn with_idle(
        name: &str,
        threads: usize,
        use_caller: bool,
        idle: Arc<dyn Idle>,
    ) -> Self {
        assert!(threads > 0, "threads must be > 0");

        Self {
            core: Arc::new(Core::new(name.to_owned(), idle)),
            workers: Mutex::new(Vec::new()),
            threads,
            use_caller,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Installs per-worker setup, run once on each worker thread before it
    /// enters the dispatch loop. Must be called before [`Scheduler::start`];
    /// later calls are ignored.
    pub(crate) fn set_thread_init(&self, init: Box<dyn Fn() + Send + Sync>) {
        let _ = self.core.thread_init.set(init);
    }

    /// Spawns the worker threads.
    ///
    /// Idempotent. Thread-creation failure is a hard error; workers spawned
    /// before the failure keep running and are joined by [`Scheduler::stop`].
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let spawn_count = if self.use_caller {
            self.threads - 1
        } else {
            self.threads
        };

        let mut workers = self.workers.lock().unwrap();
        for worker in 0..spawn_count {
            let core = self.core.clone();
            let name = format!("{}-{}", self.core.name, worker);
            workers.push(OsThread::create(move || dispatch(&core, worker), name)?);
        }

        Ok(())
    }

    /// Enqueues a callable; it runs inside a fresh fiber.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::call(f));
    }

    /// Enqueues an existing fiber for resumption.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(Task::Fiber(fiber));
    }

    /// Enqueues a task. Thread-safe; callable from inside a running fiber.
    pub fn schedule_task(&self, task: Task) {
        self.core.push(Entry { task, pinned: None });
    }

    /// Enqueues a task that only the named worker may consume.
    pub fn schedule_pinned(&self, task: Task, worker: usize) {
        self.core.push(Entry {
            task,
            pinned: Some(worker),
        });
    }

    /// Stops the scheduler: drains the queue cooperatively and joins all
    /// workers. Idempotent. Must not be called from one of the scheduler's
    /// own workers.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.core.stopping.store(true, Ordering::Release);
        self.core.idle.notify(&self.core);
        self.core.queue_ready.notify_all();

        if self.use_caller && self.started.load(Ordering::Acquire) {
            // The constructing thread contributes as the last worker.
            dispatch(&self.core, self.threads - 1);
        }

        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            worker.join();
        }

        log::debug!("scheduler {} stopped", self.core.name);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
