//! Cooperative (deferred) thread cancellation.
//!
//! A thread is only ever torn down at a *cancellation point* — a call to
//! [`test_cancel`], or the cancellable sleep inside `clock::wait_until` —
//! and only while cancellation is enabled. Arbitrary code is never
//! preempted.
//!
//! Ownership is split so the hot path needs no lock: the `killable` flag
//! and the cleanup-handler stack belong to the thread itself and live in
//! thread-local storage; only the `killed` flag (and the wake that
//! accompanies it) crosses threads, through an atomic in the shared
//! [`ThreadState`].
//!
//! The main thread, and any thread not spawned through this runtime, has
//! no installed context and is permanently non-cancellable: every
//! operation here is a no-op on it.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicU32, Ordering};
use std::rc::Rc;
use std::sync::Arc;

use crate::clock::Tick;
use crate::waitaddr::{self, WaitStatus};

// ---------------------------------------------------------------------------
// Shared and thread-owned state
// ---------------------------------------------------------------------------

/// Cross-thread cancellation state, shared between a `ThreadHandle` and
/// the thread it refers to.
pub(crate) struct ThreadState {
    /// Set by any thread via `ThreadHandle::cancel`; read by the owner
    /// at cancellation points. Doubles as the wait address that a
    /// cancellable sleep parks on.
    pub(crate) killed: AtomicU32,
}

impl ThreadState {
    pub(crate) fn new() -> ThreadState {
        ThreadState {
            killed: AtomicU32::new(0),
        }
    }
}

/// Thread-owned cancellation context. Never touched by another thread.
struct CurrentThread {
    shared: Arc<ThreadState>,
    killable: Cell<bool>,
    cleaners: RefCell<Vec<Box<dyn FnOnce()>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<CurrentThread>>> = const { RefCell::new(None) };
}

fn current() -> Option<Rc<CurrentThread>> {
    CURRENT.with(|ctx| ctx.borrow().clone())
}

/// Install the context for a freshly spawned thread. Cancellation starts
/// disabled; the entry trampoline enables it just before user code runs.
pub(crate) fn install_current(shared: Arc<ThreadState>) {
    CURRENT.with(|ctx| {
        *ctx.borrow_mut() = Some(Rc::new(CurrentThread {
            shared,
            killable: Cell::new(false),
            cleaners: RefCell::new(Vec::new()),
        }));
    });
}

/// Remove the context when the entry trampoline returns.
pub(crate) fn clear_current() {
    CURRENT.with(|ctx| {
        ctx.borrow_mut().take();
    });
}

/// Unwind payload distinguishing cancellation from an ordinary panic.
/// Recognized (and swallowed) by the entry trampoline.
pub(crate) struct CancelUnwind;

// ---------------------------------------------------------------------------
// Cancellation points and scoped disable
// ---------------------------------------------------------------------------

/// Disable cancellation for the calling thread, returning the previous
/// enablement for a later [`restore_cancel`]. Always paired.
pub fn save_cancel() -> bool {
    let Some(th) = current() else {
        return false; // main thread: cannot be cancelled anyway
    };
    let state = th.killable.get();
    th.killable.set(false);
    state
}

/// Restore the enablement saved by [`save_cancel`].
pub fn restore_cancel(state: bool) {
    let Some(th) = current() else {
        return; // main thread: cannot be cancelled anyway
    };
    assert!(
        !th.killable.get(),
        "restore_cancel without a matching save_cancel"
    );
    th.killable.set(state);
}

/// Cancellation point: if this thread is cancellable and a cancellation
/// is pending, run the cleanup stack and terminate the thread. Does not
/// return in that case.
pub fn test_cancel() {
    let Some(th) = current() else {
        return;
    };
    if !th.killable.get() {
        return;
    }
    if th.shared.killed.load(Ordering::Acquire) == 0 {
        return;
    }
    do_cancel(&th);
}

/// Run cancellation teardown: cleanup handlers in reverse registration
/// order, then unwind out of user code. The trampoline records the
/// cancelled outcome.
fn do_cancel(th: &CurrentThread) -> ! {
    th.killable.set(false); // no re-entry into cancellation teardown

    loop {
        let handler = th.cleaners.borrow_mut().pop();
        match handler {
            Some(handler) => handler(),
            None => break,
        }
    }

    std::panic::panic_any(CancelUnwind);
}

// ---------------------------------------------------------------------------
// Cleanup handlers
// ---------------------------------------------------------------------------

/// Push a cleanup handler onto the calling thread's stack. It runs if
/// the thread is cancelled before the matching [`cleanup_pop`].
///
/// Push and pop must be strictly nested, mirroring scope entry and exit.
/// On a thread with no cancellation context the handler is dropped
/// unrun, since such a thread can never be cancelled.
pub fn cleanup_push<F: FnOnce() + 'static>(handler: F) {
    let Some(th) = current() else {
        return;
    };
    th.cleaners.borrow_mut().push(Box::new(handler));
}

/// Pop the most recent cleanup handler, running it if `run` is true.
///
/// Popping with nothing pushed is a programming error and panics.
pub fn cleanup_pop(run: bool) {
    let Some(th) = current() else {
        return;
    };
    let handler = th
        .cleaners
        .borrow_mut()
        .pop()
        .expect("cleanup_pop without a matching cleanup_push");
    if run {
        handler();
    }
}

// ---------------------------------------------------------------------------
// Cancellable sleep (used by clock::wait_until)
// ---------------------------------------------------------------------------

/// Park on the kill flag until `deadline`, tearing the thread down if a
/// cancellation arrives. Returns false when the calling thread is not
/// cancellable, in which case the caller falls back to a plain sleep.
pub(crate) fn cancellable_wait_until(deadline: Tick) -> bool {
    let Some(th) = current() else {
        return false;
    };
    if !th.killable.get() {
        return false;
    }

    loop {
        if th.shared.killed.load(Ordering::Acquire) != 0 {
            do_cancel(&th);
        }
        if waitaddr::timed_wait(&th.shared.killed, 0u32, deadline) == WaitStatus::TimedOut {
            return true;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
