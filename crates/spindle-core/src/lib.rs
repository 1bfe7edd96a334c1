//! Thread execution and synchronization runtime.
//!
//! Gives every thread a uniform lifecycle, a cooperative cancellation
//! protocol, a futex-style wait/notify primitive emulated over plain
//! locks, a thread-local-variable registry with guaranteed teardown, and
//! a pluggable monotonic clock.
//!
//! ## Structure
//!
//! - [`thread`] — spawn, join, detach, priority; the entry trampoline.
//! - [`cancel`] — killable flag, cleanup-handler stack, cancellation
//!   points.
//! - [`waitaddr`] — wait-on-address keyed by address hashing into a
//!   fixed bucket table.
//! - [`tls`] — registered thread-local variables with per-thread exit
//!   destructors.
//! - [`clock`] — selectable monotonic time sources behind one tick unit,
//!   plus cancellation-aware bounded sleeps.
//! - [`config`] — the opaque option-lookup capability clock setup
//!   consumes.
//! - [`error`] — the error taxonomy.
//!
//! ## Locking discipline
//!
//! The TLS registry and clock selection each take one dedicated global
//! lock; wait addresses hash over 32 independent bucket locks. No thread
//! ever holds more than one of these at a time, so no lock-ordering
//! protocol is needed.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
#[allow(unsafe_code)]
pub mod thread;
pub mod tls;
pub mod waitaddr;

pub use cancel::{cleanup_pop, cleanup_push, restore_cancel, save_cancel, test_cancel};
pub use clock::{ClockSourceKind, TICK_FREQ, Tick};
pub use config::{Config, MapConfig};
pub use error::RuntimeError;
pub use thread::{JoinOutcome, Priority, ThreadHandle, cpu_count, current_thread_id, spawn};
pub use tls::TlsSlot;
pub use waitaddr::WaitStatus;
