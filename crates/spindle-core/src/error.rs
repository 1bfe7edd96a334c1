//! Error taxonomy for the runtime.
//!
//! Only genuinely recoverable failures are represented as errors here.
//! Timeouts are a status, not an error (`waitaddr::WaitStatus`), and a
//! successfully cancelled thread is a distinguished join outcome
//! (`thread::JoinOutcome::Canceled`). Invariant violations — mismatched
//! cleanup pops, an unknown clock source name — indicate programming or
//! configuration errors that cannot be safely continued past, and panic
//! or abort instead of returning.

use thiserror::Error;

/// Recoverable runtime failures.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The OS (or an internal limit) refused to allocate a resource.
    ///
    /// Returned by `thread::spawn` and `tls::create`; never retried
    /// internally. The caller decides whether to back off or give up.
    #[error("cannot allocate {what}: system resources exhausted")]
    ResourceExhausted {
        /// Short description of what could not be allocated.
        what: &'static str,
        /// Underlying OS error, when one exists.
        #[source]
        source: Option<std::io::Error>,
    },
}
