//! Stackful cooperative fibers.
//!
//! A [`Fiber`] owns a private stack and a saved execution context. It runs
//! until it explicitly yields or finishes; it is never preempted. Resuming
//! a fiber switches the calling thread onto the fiber's stack, and yielding
//! switches back to whoever resumed it.
//!
//! Fibers may migrate between threads while suspended, but at most one
//! thread runs a given fiber at any instant: every resume goes through an
//! atomic state transition, so a second simultaneous resume is rejected
//! instead of corrupting the saved context.

mod context;

use context::{ExecutionContext, Stack, leave, switch};

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Default fiber stack size: 128 KiB of usable stack.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created, never resumed.
    Init = 0,

    /// Suspended and resumable.
    Ready = 1,

    /// Currently executing on some thread.
    Running = 2,

    /// The body returned; the fiber will never run again.
    Terminated = 3,

    /// The body panicked; the payload is held for later inspection.
    Faulted = 4,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Terminated,
            4 => FiberState::Faulted,
            _ => unreachable!("invalid fiber state"),
        }
    }
}

/// Errors produced by fiber construction and resumption.
#[derive(Debug, Error)]
pub enum FiberError {
    /// The fiber is not in a resumable state. Resuming a terminated or
    /// faulted fiber is a usage bug; observing `Running` here means another
    /// thread holds the fiber mid-switch.
    #[error("fiber {id} is not resumable (state {state:?})")]
    NotResumable { id: u64, state: FiberState },

    /// Stack allocation failed.
    #[error("failed to allocate fiber stack: {0}")]
    Stack(#[source] io::Error),

    /// The initial execution context could not be prepared.
    #[error("failed to prepare execution context: {0}")]
    Context(#[source] io::Error),

    /// The context switch itself failed; the fiber was left untouched.
    #[error("context switch failed: {0}")]
    Switch(#[source] io::Error),
}

/// Outcome of a [`Fiber::resume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// The fiber yielded. `reschedule` is the request left by the yield:
    /// `true` asks the scheduler to re-enqueue, `false` means an external
    /// event owns the wakeup. The flag is consumed before the fiber is
    /// published as resumable again, so it cannot be stolen by a
    /// concurrent resume.
    Yielded { reschedule: bool },

    /// The body returned.
    Terminated,

    /// The body panicked; the payload is available via
    /// [`Fiber::take_fault`].
    Faulted,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Fibers resumed on this thread, innermost last. The top entry is the
    /// running fiber.
    static ACTIVE: RefCell<Vec<Arc<Fiber>>> = const { RefCell::new(Vec::new()) };

    /// Lazily-installed main fiber representing the thread itself, so that
    /// every thread always has a current fiber.
    static MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A cooperative, stack-switching unit of execution.
pub struct Fiber {
    /// Process-unique identifier.
    id: u64,

    /// Atomic [`FiberState`]; every lifecycle transition goes through it.
    state: AtomicU8,

    /// Set by [`Fiber::yield_ready`], cleared by [`Fiber::yield_suspended`].
    /// Consumed by the scheduler to decide whether to re-enqueue.
    reschedule: AtomicBool,

    /// Saved context of the fiber itself.
    ctx: ExecutionContext,

    /// Saved context of the most recent resumer; yield switches back here.
    return_to: ExecutionContext,

    /// Owned stack. `None` for main fibers, which run on the thread stack.
    #[allow(dead_code)]
    stack: Option<Stack>,

    /// The body, taken exactly once when the fiber first runs.
    body: Mutex<Option<Box<dyn FnOnce() + Send>>>,

    /// Panic payload captured from a faulted body.
    fault: Mutex<Option<Box<dyn Any + Send>>>,
}

// Safety: the saved contexts and the stack are only ever touched by the
// thread that won the Running transition, and the remaining fields are
// individually thread-safe.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a suspended fiber that will run `f` on its own stack of
    /// `stack_size` usable bytes.
    ///
    /// The fiber does not run until it is resumed.
    pub fn spawn<F>(f: F, stack_size: usize) -> Result<Arc<Self>, FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = Stack::allocate(stack_size).map_err(FiberError::Stack)?;
        let ctx = ExecutionContext::with_entry(&stack, fiber_entry).map_err(FiberError::Context)?;

        Ok(Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Init as u8),
            reschedule: AtomicBool::new(false),
            ctx,
            return_to: ExecutionContext::empty(),
            stack: Some(stack),
            body: Mutex::new(Some(Box::new(f))),
            fault: Mutex::new(None),
        }))
    }

    /// Stackless fiber standing in for the thread itself.
    fn main_fiber() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Running as u8),
            reschedule: AtomicBool::new(false),
            ctx: ExecutionContext::empty(),
            return_to: ExecutionContext::empty(),
            stack: None,
            body: Mutex::new(None),
            fault: Mutex::new(None),
        })
    }

    /// Process-unique fiber id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The fiber currently executing on the calling thread.
    ///
    /// Every thread always has a current fiber: when no spawned fiber is
    /// running, this is the thread's main fiber, installed on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = ACTIVE.with(|stack| stack.borrow().last().cloned()) {
            return fiber;
        }
        MAIN.with(|main| main.borrow_mut().get_or_insert_with(Self::main_fiber).clone())
    }

    /// Whether a spawned fiber is running on the calling thread.
    pub fn in_fiber() -> bool {
        ACTIVE.with(|stack| !stack.borrow().is_empty())
    }

    /// Resumes the fiber on the calling thread.
    ///
    /// Switches onto the fiber's saved context and returns once the fiber
    /// yields, terminates, or faults. Resuming a fiber that is not `Init`
    /// or `Ready` is rejected with [`FiberError::NotResumable`] -- including
    /// the brief window in which a yielding fiber is still mid-switch on
    /// another thread.
    pub fn resume(self: &Arc<Self>) -> Result<Resumption, FiberError> {
        let previous = self.claim()?;

        ACTIVE.with(|stack| stack.borrow_mut().push(self.clone()));
        let switched = unsafe { switch(&self.return_to, &self.ctx) };
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });

        if let Err(err) = switched {
            // The switch never happened; undo the claim.
            self.state.store(previous, Ordering::Release);
            return Err(FiberError::Switch(err));
        }

        match self.state() {
            FiberState::Running => {
                // The fiber yielded. Consume the reschedule request first;
                // the Ready store below is what makes it legal for another
                // thread to resume the fiber, and with it a later write to
                // the flag.
                let reschedule = self.reschedule.swap(false, Ordering::AcqRel);
                self.state.store(FiberState::Ready as u8, Ordering::Release);
                Ok(Resumption::Yielded { reschedule })
            }
            FiberState::Terminated => Ok(Resumption::Terminated),
            FiberState::Faulted => Ok(Resumption::Faulted),
            state => Err(FiberError::NotResumable { id: self.id, state }),
        }
    }

    /// Atomically claims the fiber for execution.
    fn claim(&self) -> Result<u8, FiberError> {
        for previous in [FiberState::Init, FiberState::Ready] {
            let claimed = self.state.compare_exchange(
                previous as u8,
                FiberState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if claimed.is_ok() {
                return Ok(previous as u8);
            }
        }

        Err(FiberError::NotResumable {
            id: self.id,
            state: self.state(),
        })
    }

    /// Suspends the running fiber and asks the scheduler to re-enqueue it.
    ///
    /// # Panics
    ///
    /// Panics when called outside a spawned fiber; that is a usage bug.
    pub fn yield_ready() {
        Self::yield_with(true);
    }

    /// Suspends the running fiber without re-enqueueing it.
    ///
    /// The wakeup is owned by whoever holds a reference to the fiber,
    /// typically an I/O event or timer registration.
    ///
    /// # Panics
    ///
    /// Panics when called outside a spawned fiber; that is a usage bug.
    pub fn yield_suspended() {
        Self::yield_with(false);
    }

    fn yield_with(reschedule: bool) {
        let fiber = ACTIVE
            .with(|stack| stack.borrow().last().cloned())
            .expect("yield called outside of a spawned fiber");

        fiber.reschedule.store(reschedule, Ordering::Release);

        if let Err(err) = unsafe { switch(&fiber.ctx, &fiber.return_to) } {
            // There is no resumer to report to; losing the switch back
            // would strand the worker thread on this stack.
            panic!("fiber {}: context switch back failed: {err}", fiber.id);
        }
    }

    /// Takes the panic payload captured from a faulted body, if any.
    pub fn take_fault(&self) -> Option<Box<dyn Any + Send>> {
        self.fault.lock().unwrap().take()
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Entry point shared by all spawned fibers.
///
/// Runs the body under `catch_unwind` so a panicking fiber is captured
/// instead of tearing down the worker thread, then leaves the stack for
/// good by switching back to the resumer.
extern "C" fn fiber_entry() {
    let return_to;
    {
        let fiber = Fiber::current();
        let body = fiber.body.lock().unwrap().take();

        match body {
            Some(body) => match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(()) => {
                    fiber
                        .state
                        .store(FiberState::Terminated as u8, Ordering::Release);
                }
                Err(payload) => {
                    *fiber.fault.lock().unwrap() = Some(payload);
                    fiber
                        .state
                        .store(FiberState::Faulted as u8, Ordering::Release);
                }
            },
            None => {
                fiber
                    .state
                    .store(FiberState::Terminated as u8, Ordering::Release);
            }
        }

        return_to = fiber.return_to.as_raw();
        // The resumer is blocked inside its switch holding a strong
        // reference, so `return_to` stays valid after this Arc drops.
    }

    unsafe { leave(return_to) }
}
