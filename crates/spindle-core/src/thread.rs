//! Thread lifecycle: spawn, join, detach, priority.
//!
//! Every spawned thread runs an entry trampoline that installs the
//! thread's cancellation context, enables cancellation, invokes the user
//! entry, and on every exit path tears down thread-local variables. The
//! trampoline's return value is what [`ThreadHandle::join`] observes: a
//! completed entry yields [`JoinOutcome::Completed`], a cancelled thread
//! yields [`JoinOutcome::Canceled`], and any other panic propagates to
//! the joiner.

use core::sync::atomic::Ordering;
use std::panic::{self, AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::{Arc, Once};
use std::thread::{Builder, JoinHandle};

use log::warn;

use crate::cancel::{self, CancelUnwind, ThreadState};
use crate::error::RuntimeError;
use crate::tls;
use crate::waitaddr;

// ---------------------------------------------------------------------------
// Outcomes and priorities
// ---------------------------------------------------------------------------

/// What a joined thread produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome<T> {
    /// The entry function returned this value.
    Completed(T),
    /// The thread was torn down at a cancellation point.
    Canceled,
}

impl<T> JoinOutcome<T> {
    /// The completed value, or `None` if the thread was cancelled.
    pub fn completed(self) -> Option<T> {
        match self {
            JoinOutcome::Completed(value) => Some(value),
            JoinOutcome::Canceled => None,
        }
    }

    /// True if the thread was torn down by cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, JoinOutcome::Canceled)
    }
}

/// Requested scheduling priority. Best-effort: a refusal by the OS is
/// logged, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Inherit the default scheduling.
    #[default]
    Normal,
    /// Background work.
    Low,
    /// Latency-sensitive work.
    High,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owning handle to a spawned thread. Exactly one exists per thread;
/// dropping it (or calling [`ThreadHandle::detach`]) detaches.
pub struct ThreadHandle<T> {
    inner: JoinHandle<JoinOutcome<T>>,
    state: Arc<ThreadState>,
}

impl<T> ThreadHandle<T> {
    /// Block until the thread's entry trampoline has returned and
    /// collect its outcome. A panic in the thread resurfaces here.
    pub fn join(self) -> JoinOutcome<T> {
        match self.inner.join() {
            Ok(outcome) => outcome,
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Give up the right to join; the OS reclaims the thread's resources
    /// when it completes.
    pub fn detach(self) {
        drop(self.inner);
    }

    /// Request cooperative cancellation. Sets the kill flag and wakes
    /// the thread if it is blocked in a cancellable wait. Idempotent,
    /// and never blocks the caller; the target only acts on it at its
    /// next cancellation point.
    pub fn cancel(&self) {
        self.state.killed.store(1, Ordering::Release);
        waitaddr::notify_one(&self.state.killed);
    }

    /// Re-apply a scheduling priority. Best-effort, logged on refusal.
    pub fn set_priority(&self, priority: Priority) {
        if priority == Priority::Normal {
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::thread::JoinHandleExt;
            if let Err(code) = apply_priority(self.inner.as_pthread_t(), priority) {
                warn!("could not set thread priority: error {code}");
            }
        }
        #[cfg(not(unix))]
        {
            log::debug!("thread priority is not supported on this platform");
        }
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

static PANIC_HOOK: Once = Once::new();

/// A cancelled thread unwinds with a private payload; it is an expected
/// control transfer, not a fault, so keep it out of the panic output.
fn install_cancel_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().is::<CancelUnwind>() {
                return;
            }
            previous(info);
        }));
    });
}

/// Spawn a thread running `entry`.
///
/// On OS refusal returns [`RuntimeError::ResourceExhausted`] with no
/// partial thread left observable. `priority` is applied after creation;
/// failure to apply it is logged and otherwise ignored.
pub fn spawn<T, F>(entry: F, priority: Priority) -> Result<ThreadHandle<T>, RuntimeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    install_cancel_hook();

    let state = Arc::new(ThreadState::new());
    let trampoline_state = Arc::clone(&state);
    let inner = Builder::new()
        .spawn(move || run_entry(trampoline_state, entry))
        .map_err(|source| RuntimeError::ResourceExhausted {
            what: "OS thread",
            source: Some(source),
        })?;

    let handle = ThreadHandle { inner, state };
    handle.set_priority(priority);
    Ok(handle)
}

/// Entry trampoline. One instance per spawn.
fn run_entry<T, F>(state: Arc<ThreadState>, entry: F) -> JoinOutcome<T>
where
    F: FnOnce() -> T,
{
    cancel::install_current(state);
    // Cancellation was disabled from creation until here, so a cancel
    // racing the spawn cannot tear down a thread that never entered
    // user code.
    cancel::restore_cancel(true);

    let result = catch_unwind(AssertUnwindSafe(entry));

    cancel::clear_current();
    tls::teardown_current_thread();

    match result {
        Ok(value) => JoinOutcome::Completed(value),
        Err(payload) if payload.is::<CancelUnwind>() => JoinOutcome::Canceled,
        Err(payload) => resume_unwind(payload),
    }
}

// ---------------------------------------------------------------------------
// OS glue
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[allow(unsafe_code)]
fn apply_priority(native: libc::pthread_t, priority: Priority) -> Result<(), i32> {
    let (policy, prio) = match priority {
        Priority::Normal => return Ok(()),
        Priority::High => {
            let policy = libc::SCHED_RR;
            // SAFETY: queries a scheduler constant; no memory involved.
            let prio = unsafe { libc::sched_get_priority_min(policy) };
            (policy, prio)
        }
        Priority::Low => {
            #[cfg(target_os = "linux")]
            {
                (libc::SCHED_IDLE, 0)
            }
            #[cfg(not(target_os = "linux"))]
            {
                (libc::SCHED_OTHER, 0)
            }
        }
    };

    // SAFETY: sched_param is plain-old-data; zeroing is its valid
    // "no attributes" state on every supported libc.
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = prio;
    // SAFETY: `native` comes from a live JoinHandle, so the thread has
    // not been joined and the pthread_t is valid.
    let rc = unsafe { libc::pthread_setschedparam(native, policy, &param) };
    if rc == 0 { Ok(()) } else { Err(rc) }
}

/// Raise the whole process's scheduling priority. Called from clock
/// setup when the `"high-priority"` option is set; best-effort.
#[allow(unsafe_code)]
pub(crate) fn raise_process_priority() {
    #[cfg(unix)]
    {
        // SAFETY: plain syscall on the calling process; no pointers.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, -5) };
        if rc == 0 {
            log::debug!("raised process priority");
        } else {
            log::debug!("could not raise process priority");
        }
    }
    #[cfg(not(unix))]
    {
        log::debug!("process priority adjustment is not supported on this platform");
    }
}

/// Numeric id of the calling OS thread.
#[must_use]
#[allow(unsafe_code)]
pub fn current_thread_id() -> u64 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::gettid() as u64 }
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        // SAFETY: pthread_self has no preconditions.
        unsafe { libc::pthread_self() as u64 }
    }
    #[cfg(not(unix))]
    {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::hash::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    }
}

/// Number of logical CPUs, with a floor of one.
#[must_use]
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
