//! Wait-on-address: futex-style wait/notify emulated over plain locks.
//!
//! A fixed table of 32 buckets, each one mutex plus one condition
//! variable, is shared by every wait address in the process; an address
//! is routed to a bucket by hashing its numeric value. No per-address
//! state exists, so unrelated waiters may share a bucket and a notify
//! can over-wake — a performance cost, never a correctness one, because
//! every waiter re-validates its own predicate.
//!
//! The missed-wakeup race is closed by re-reading the value *under the
//! bucket lock* before sleeping: a writer that changed the value and
//! notified before the waiter locked the bucket leaves the comparison
//! unequal, and the waiter returns instead of sleeping forever.

use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::{self, Tick};

// ---------------------------------------------------------------------------
// Waitable values
// ---------------------------------------------------------------------------

mod sealed {
    pub trait Sealed {}
}

/// Atomic word types a thread can wait on (1, 2, 4 and 8 byte widths).
pub trait Waitable: sealed::Sealed {
    /// The plain value compared against the word.
    type Value: Copy + Into<u64>;

    /// Relaxed load widened to `u64` for comparison.
    fn load_relaxed(&self) -> u64;
}

macro_rules! impl_waitable {
    ($atomic:ty, $value:ty) => {
        impl sealed::Sealed for $atomic {}

        impl Waitable for $atomic {
            type Value = $value;

            fn load_relaxed(&self) -> u64 {
                self.load(Ordering::Relaxed) as u64
            }
        }
    };
}

impl_waitable!(AtomicU8, u8);
impl_waitable!(AtomicU16, u16);
impl_waitable!(AtomicU32, u32);
impl_waitable!(AtomicU64, u64);

// ---------------------------------------------------------------------------
// Bucket table
// ---------------------------------------------------------------------------

const BUCKET_COUNT: usize = 32;

struct WaitBucket {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitBucket {
    const fn new() -> WaitBucket {
        WaitBucket {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }
}

static BUCKETS: [WaitBucket; BUCKET_COUNT] = [const { WaitBucket::new() }; BUCKET_COUNT];

fn bucket_index(addr: usize) -> usize {
    // Drop the alignment bits so neighbouring words spread over buckets.
    (addr >> 3) % BUCKET_COUNT
}

fn bucket_for<A: Waitable>(addr: &A) -> &'static WaitBucket {
    &BUCKETS[bucket_index(addr as *const A as usize)]
}

// ---------------------------------------------------------------------------
// Wait / notify
// ---------------------------------------------------------------------------

/// Outcome of a bounded wait. A timeout is a status the caller acts on,
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The waiter was notified, the value had already changed, or the
    /// wake was spurious. Callers re-check their predicate.
    Woken,
    /// The timeout elapsed first.
    TimedOut,
}

/// Wait until the value at `addr` may have changed from `expected`.
///
/// Returns [`WaitStatus::Woken`] immediately, without sleeping, if the
/// value no longer equals `expected` once the bucket is locked. A wake
/// does not guarantee the value actually changed; the contract is only
/// that a missed notify implies the value had already changed by the
/// time this call locked the bucket.
pub fn wait_timeout<A: Waitable>(
    addr: &A,
    expected: A::Value,
    timeout: Option<Duration>,
) -> WaitStatus {
    let bucket = bucket_for(addr);
    let mut guard = bucket.lock.lock();

    if addr.load_relaxed() != expected.into() {
        return WaitStatus::Woken;
    }

    match timeout {
        None => {
            bucket.cond.wait(&mut guard);
            WaitStatus::Woken
        }
        Some(timeout) => {
            if bucket.cond.wait_for(&mut guard, timeout).timed_out() {
                WaitStatus::TimedOut
            } else {
                WaitStatus::Woken
            }
        }
    }
}

/// Unbounded [`wait_timeout`].
pub fn wait<A: Waitable>(addr: &A, expected: A::Value) {
    let _ = wait_timeout(addr, expected, None);
}

/// Wait with an absolute deadline on the monotonic clock.
///
/// Re-computes the remaining delay each iteration and sleeps in bounded
/// chunks, so deadlines beyond the OS timer range still work. Returns
/// [`WaitStatus::TimedOut`] once the deadline has passed.
pub fn timed_wait<A: Waitable>(addr: &A, expected: A::Value, deadline: Tick) -> WaitStatus {
    loop {
        let delay = deadline - clock::now();
        if delay <= Tick::ZERO {
            return WaitStatus::TimedOut;
        }
        let chunk = clock::delay_to_duration(delay);
        if wait_timeout(addr, expected, Some(chunk)) == WaitStatus::Woken {
            return WaitStatus::Woken;
        }
    }
}

/// Wake one waiter on `addr`.
///
/// Because a bucket multiplexes unrelated addresses, a single wake could
/// pick a waiter on a different address and strand the intended one, so
/// this broadcasts like [`notify_all`]. Waiters re-validate and re-sleep.
pub fn notify_one<A: Waitable>(addr: &A) {
    notify_all(addr);
}

/// Wake all waiters on `addr` (and, inevitably, every other waiter
/// sharing its bucket).
pub fn notify_all<A: Waitable>(addr: &A) {
    let bucket = bucket_for(addr);

    // Acquire and release the bucket lock purely for sequencing; it
    // protects no data here. Any concurrent waiter either already sleeps
    // on the condition variable (and the broadcast below wakes it), or
    // has yet to lock the bucket and re-read the value (and will observe
    // the caller's store instead of sleeping).
    drop(bucket.lock.lock());

    bucket.cond.notify_all();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[test]
    fn changed_value_returns_without_sleeping() {
        let word = AtomicU32::new(1);
        // Value differs from expected before the call: must not block.
        let start = Instant::now();
        let status = wait_timeout(&word, 0u32, Some(Duration::from_secs(5)));
        assert_eq!(status, WaitStatus::Woken);
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "wait slept despite a pre-changed value"
        );
    }

    #[test]
    fn unchanged_value_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let deadline = clock::now() + Tick::from_millis(50);
        // Unrelated notifies from tests sharing the bucket may over-wake
        // us; re-arm until the deadline actually expires.
        while timed_wait(&word, 0u32, deadline) == WaitStatus::Woken {}
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn timed_wait_respects_deadline() {
        let word = AtomicU64::new(7);
        let start = clock::now();
        let deadline = clock::now() + Tick::from_millis(40);
        while timed_wait(&word, 7u64, deadline) == WaitStatus::Woken {}
        assert!(clock::now() - start >= Tick::from_millis(40));
    }

    #[test]
    fn timed_wait_past_deadline_returns_immediately() {
        let word = AtomicU32::new(0);
        let status = timed_wait(&word, 0u32, clock::now() - Tick::from_millis(1));
        assert_eq!(status, WaitStatus::TimedOut);
    }

    #[test]
    fn notify_wakes_a_blocked_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let woken = Arc::new(AtomicBool::new(false));

        let waiter = {
            let word = Arc::clone(&word);
            let woken = Arc::clone(&woken);
            std::thread::spawn(move || {
                // Loop: waits may wake spuriously, re-validate.
                while word.load(Ordering::Acquire) == 0 {
                    wait(&*word, 0u32);
                }
                woken.store(true, Ordering::Release);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        notify_all(&*word);

        waiter.join().expect("waiter thread panicked");
        assert!(woken.load(Ordering::Acquire));
    }

    #[test]
    fn store_before_wait_is_never_missed() {
        // The writer changes the value and notifies *before* the reader
        // ever waits; the reader must observe the change and not sleep.
        let word = AtomicU32::new(0);
        word.store(1, Ordering::Release);
        notify_all(&word);

        let start = Instant::now();
        let status = wait_timeout(&word, 0u32, Some(Duration::from_secs(5)));
        assert_eq!(status, WaitStatus::Woken);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    /// Two atomics exactly 256 bytes apart share a bucket:
    /// (addr >> 3) differs by 32, which is 0 modulo the bucket count.
    #[repr(C, align(8))]
    struct SharedBucketPair {
        a: AtomicU32,
        _pad: [u8; 252],
        b: AtomicU32,
    }

    #[test]
    fn bucket_hash_collides_at_256_byte_stride() {
        let pair = SharedBucketPair {
            a: AtomicU32::new(0),
            _pad: [0; 252],
            b: AtomicU32::new(0),
        };
        let ia = bucket_index(&pair.a as *const _ as usize);
        let ib = bucket_index(&pair.b as *const _ as usize);
        assert_eq!(ia, ib);
    }

    #[test]
    fn notify_on_one_address_wakes_unrelated_waiter_in_same_bucket() {
        let pair = Arc::new(SharedBucketPair {
            a: AtomicU32::new(0),
            _pad: [0; 252],
            b: AtomicU32::new(0),
        });

        // Waiter parks on `b`, which never changes.
        let waiter = {
            let pair = Arc::clone(&pair);
            std::thread::spawn(move || {
                wait_timeout(&pair.b, 0u32, Some(Duration::from_secs(10)))
            })
        };

        // Notify on `a` broadcasts the shared bucket and over-wakes the
        // waiter on `b`. Repeat until the waiter has observed a wake, in
        // case a notify lands before the waiter parks.
        pair.a.store(1, Ordering::Release);
        while !waiter.is_finished() {
            notify_all(&pair.a);
            std::thread::sleep(Duration::from_millis(5));
        }

        let status = waiter.join().expect("waiter thread panicked");
        assert_eq!(
            status,
            WaitStatus::Woken,
            "bucket broadcast must wake waiters on unrelated addresses"
        );
    }

    #[test]
    fn all_word_widths_are_waitable() {
        let b1 = AtomicU8::new(1);
        let b2 = AtomicU16::new(1);
        let b4 = AtomicU32::new(1);
        let b8 = AtomicU64::new(1);
        assert_eq!(
            wait_timeout(&b1, 0u8, Some(Duration::ZERO)),
            WaitStatus::Woken
        );
        assert_eq!(
            wait_timeout(&b2, 0u16, Some(Duration::ZERO)),
            WaitStatus::Woken
        );
        assert_eq!(
            wait_timeout(&b4, 0u32, Some(Duration::ZERO)),
            WaitStatus::Woken
        );
        assert_eq!(
            wait_timeout(&b8, 0u64, Some(Duration::ZERO)),
            WaitStatus::Woken
        );
    }
}
