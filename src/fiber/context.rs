//! Machine-level execution-context and stack primitives.
//!
//! This module hides the platform-specific save/restore machinery behind
//! two opaque values:
//! - [`Stack`], an `mmap`ed memory region with a guard page, owned by a
//!   single fiber for its whole lifetime,
//! - [`ExecutionContext`], a heap-pinned saved register state that can be
//!   switched into and out of.
//!
//! The rest of the crate only ever calls [`switch`] and [`leave`]; no other
//! code touches `ucontext_t` directly.

use libc::{c_void, getcontext, makecontext, swapcontext, ucontext_t};

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::ptr;

/// Memory region used as a fiber stack.
///
/// The region is mapped with one extra page at the low end, protected
/// `PROT_NONE`, so a stack overflow faults immediately instead of
/// corrupting adjacent memory. Stacks grow downwards on every supported
/// target.
pub(crate) struct Stack {
    /// Base of the whole mapping, including the guard page.
    base: *mut c_void,

    /// Total mapping length in bytes.
    total: usize,

    /// Usable stack length, excluding the guard page.
    usable: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Maps a new stack of at least `size` usable bytes.
    ///
    /// Allocation failure is a hard error surfaced to the caller; it is
    /// never retried.
    pub(crate) fn allocate(size: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = size.max(page).div_ceil(page) * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Guard page at the low end of the mapping.
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        Ok(Self {
            base,
            total,
            usable,
        })
    }

    /// Lowest usable address, just above the guard page.
    fn bottom(&self) -> *mut c_void {
        unsafe { (self.base as *mut u8).add(self.total - self.usable) as *mut c_void }
    }

    /// Usable length in bytes.
    fn len(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.total);
        }
    }
}

/// Opaque saved register state.
///
/// On glibc the FPU-state pointer inside `ucontext_t` refers back into the
/// structure itself, so the value is heap-pinned at construction and never
/// moved afterwards.
pub(crate) struct ExecutionContext {
    inner: Box<UnsafeCell<ucontext_t>>,
}

unsafe impl Send for ExecutionContext {}

impl ExecutionContext {
    /// An empty context slot, filled in by the first [`switch`] that saves
    /// into it.
    pub(crate) fn empty() -> Self {
        Self {
            inner: Box::new(UnsafeCell::new(unsafe { mem::zeroed() })),
        }
    }

    /// A context that enters `entry` on `stack` the first time it is
    /// switched to.
    ///
    /// `entry` takes no arguments; it is expected to locate its fiber
    /// through the thread's current-fiber state.
    pub(crate) fn with_entry(stack: &Stack, entry: extern "C" fn()) -> io::Result<Self> {
        let ctx = Self::empty();

        let rc = unsafe { getcontext(ctx.as_raw()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            let raw = ctx.as_raw();
            (*raw).uc_stack.ss_sp = stack.bottom();
            (*raw).uc_stack.ss_size = stack.len();
            (*raw).uc_stack.ss_flags = 0;
            (*raw).uc_link = ptr::null_mut();
            makecontext(raw, entry, 0);
        }

        Ok(ctx)
    }

    /// Raw pointer for the switch primitives.
    pub(crate) fn as_raw(&self) -> *mut ucontext_t {
        self.inner.get()
    }
}

/// Switches the calling thread onto `to`, saving its state into `from`.
///
/// Returns once something switches back into `from`.
///
/// # Safety
///
/// `to` must hold a valid saved context (or a prepared entry context), and
/// no other thread may be switching into either context concurrently. The
/// fiber state machine enforces this.
pub(crate) unsafe fn switch(from: &ExecutionContext, to: &ExecutionContext) -> io::Result<()> {
    let rc = unsafe { swapcontext(from.as_raw(), to.as_raw()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Switches onto `to` without saving the current state. Never returns.
///
/// Used exactly once per fiber, when its body has finished and its stack
/// is abandoned for good.
///
/// # Safety
///
/// Same requirements as [`switch`]; additionally the current stack must
/// not be needed again.
pub(crate) unsafe fn leave(to: *mut ucontext_t) -> ! {
    unsafe {
        libc::setcontext(to);
    }
    // setcontext only returns on failure, which leaves the fiber with no
    // stack to unwind onto.
    std::process::abort();
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}
