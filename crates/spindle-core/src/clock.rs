//! Monotonic clock with selectable time sources.
//!
//! All sources convert into one fixed internal unit ([`Tick`], microsecond
//! resolution) so callers never see which source is active. The source is
//! selected exactly once per process: either explicitly via [`setup`] at
//! startup, or lazily by the first [`now`] call. Selection is first-write-
//! wins under a dedicated lock; an unknown source name is a fatal
//! configuration error and aborts the process.
//!
//! The five selectable sources mirror a platform with several timers of
//! differing granularity: `interrupt` and `perf` read at full resolution,
//! `tick` and `multimedia` are truncated to whole milliseconds, and `wall`
//! follows the (non-monotonic) system clock.

use core::ops::{Add, Neg, Sub};
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error};
use parking_lot::Mutex;

use crate::cancel;
use crate::config::Config;

// ---------------------------------------------------------------------------
// Ticks
// ---------------------------------------------------------------------------

/// Internal tick frequency: one tick per microsecond.
pub const TICK_FREQ: i64 = 1_000_000;

/// A point in (or span of) monotonic time, in microsecond ticks.
///
/// Signed so that `deadline - now()` yields a negative span once the
/// deadline has passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(i64);

impl Tick {
    /// Zero ticks.
    pub const ZERO: Tick = Tick(0);

    /// Construct from raw microseconds.
    #[must_use]
    pub const fn from_micros(us: i64) -> Tick {
        Tick(us)
    }

    /// Construct from milliseconds.
    #[must_use]
    pub const fn from_millis(ms: i64) -> Tick {
        Tick(ms * (TICK_FREQ / 1_000))
    }

    /// Construct from seconds.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Tick {
        Tick(secs * TICK_FREQ)
    }

    /// Raw microseconds.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }
}

impl Add for Tick {
    type Output = Tick;

    fn add(self, rhs: Tick) -> Tick {
        Tick(self.0 + rhs.0)
    }
}

impl Sub for Tick {
    type Output = Tick;

    fn sub(self, rhs: Tick) -> Tick {
        Tick(self.0 - rhs.0)
    }
}

impl Neg for Tick {
    type Output = Tick;

    fn neg(self) -> Tick {
        Tick(-self.0)
    }
}

/// Longest single sleep the OS is asked for in one call. Longer delays
/// are broken into chunks and the remaining delay re-computed, so a
/// timer with limited range never truncates a deadline.
pub(crate) const MAX_SLEEP_CHUNK: Tick = Tick::from_millis(i32::MAX as i64);

/// Convert a positive delay into a bounded `Duration` chunk.
pub(crate) fn delay_to_duration(delay: Tick) -> Duration {
    let clamped = if delay > MAX_SLEEP_CHUNK {
        MAX_SLEEP_CHUNK
    } else {
        delay
    };
    Duration::from_micros(clamped.0.max(0) as u64)
}

// ---------------------------------------------------------------------------
// Source selection
// ---------------------------------------------------------------------------

/// The selectable time sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClockSourceKind {
    /// Interrupt time: monotonic, full resolution.
    Interrupt = 1,
    /// Scheduler tick counter: monotonic, millisecond granularity.
    TickCount = 2,
    /// Multimedia timer: monotonic, millisecond granularity.
    Multimedia = 3,
    /// Performance counter: monotonic, full resolution.
    Performance = 4,
    /// Wall clock: system time, may jump.
    Wall = 5,
}

impl ClockSourceKind {
    /// Parse a configured source name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<ClockSourceKind> {
        match name {
            "interrupt" => Some(ClockSourceKind::Interrupt),
            "tick" => Some(ClockSourceKind::TickCount),
            "multimedia" => Some(ClockSourceKind::Multimedia),
            "perf" => Some(ClockSourceKind::Performance),
            "wall" => Some(ClockSourceKind::Wall),
            _ => None,
        }
    }

    /// The configuration name of this source.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ClockSourceKind::Interrupt => "interrupt",
            ClockSourceKind::TickCount => "tick",
            ClockSourceKind::Multimedia => "multimedia",
            ClockSourceKind::Performance => "perf",
            ClockSourceKind::Wall => "wall",
        }
    }

    fn from_u8(raw: u8) -> Option<ClockSourceKind> {
        match raw {
            1 => Some(ClockSourceKind::Interrupt),
            2 => Some(ClockSourceKind::TickCount),
            3 => Some(ClockSourceKind::Multimedia),
            4 => Some(ClockSourceKind::Performance),
            5 => Some(ClockSourceKind::Wall),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ClockSourceKind::Interrupt => "interrupt time",
            ClockSourceKind::TickCount => "tick counter",
            ClockSourceKind::Multimedia => "multimedia timers",
            ClockSourceKind::Performance => "performance counters",
            ClockSourceKind::Wall => "system time",
        }
    }
}

/// Source used when the configuration names none.
pub const DEFAULT_SOURCE: &str = "multimedia";

const SOURCE_UNSET: u8 = 0;

/// Active source. `SOURCE_UNSET` until the one-time selection completes.
static ACTIVE: AtomicU8 = AtomicU8::new(SOURCE_UNSET);

/// Serializes selection. Never held while any other runtime lock is held.
static SETUP_LOCK: Mutex<()> = Mutex::new(());

/// Zero point for the monotonic sources.
static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Select the clock source. First successful call wins; later calls
/// return immediately, whatever configuration they carry.
///
/// Reads `"clock-source"` (falling back to [`DEFAULT_SOURCE`]) and, once
/// a source is active, `"high-priority"` to optionally raise the process
/// scheduling priority. Aborts the process on an unknown source name:
/// clock selection happens once at startup and has no recovery path.
pub fn setup(config: Option<&dyn Config>) {
    let _guard = SETUP_LOCK.lock();
    if ACTIVE.load(Ordering::Relaxed) != SOURCE_UNSET {
        return;
    }

    let name = config
        .and_then(|c| c.get_string("clock-source"))
        .unwrap_or_else(|| DEFAULT_SOURCE.to_owned());
    let Some(kind) = ClockSourceKind::from_name(&name) else {
        error!("invalid clock source \"{name}\"");
        std::process::abort();
    };

    // Pin the epoch before publishing so the first read never races
    // lazy Instant initialization.
    let _ = epoch();
    debug!("using {} as clock source", kind.describe());
    ACTIVE.store(kind as u8, Ordering::Release);

    if config.is_some_and(|c| c.get_int("high-priority").unwrap_or(0) != 0) {
        crate::thread::raise_process_priority();
    }
}

/// The currently active source, or `None` before selection.
#[must_use]
pub fn active_source() -> Option<ClockSourceKind> {
    ClockSourceKind::from_u8(ACTIVE.load(Ordering::Acquire))
}

/// Current monotonic time.
///
/// The first call (before explicit [`setup`]) triggers selection with no
/// configuration, then delegates permanently to the chosen source.
#[must_use]
pub fn now() -> Tick {
    let kind = match active_source() {
        Some(kind) => kind,
        None => {
            setup(None);
            // setup() either selected a source or aborted.
            active_source().unwrap_or(ClockSourceKind::Performance)
        }
    };
    read(kind)
}

fn read(kind: ClockSourceKind) -> Tick {
    match kind {
        ClockSourceKind::Interrupt | ClockSourceKind::Performance => {
            Tick::from_micros(epoch().elapsed().as_micros() as i64)
        }
        ClockSourceKind::TickCount | ClockSourceKind::Multimedia => {
            Tick::from_millis(epoch().elapsed().as_millis() as i64)
        }
        ClockSourceKind::Wall => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Tick::from_micros(d.as_micros() as i64))
            .unwrap_or(Tick::ZERO),
    }
}

// ---------------------------------------------------------------------------
// Bounded sleeps
// ---------------------------------------------------------------------------

/// Sleep until `deadline`, cancellation-aware.
///
/// On a cancellable thread this parks on the thread's kill flag, so a
/// concurrent `cancel` wakes the sleeper immediately and tears it down at
/// this call. On the main thread (or with cancellation disabled) it is a
/// plain bounded sleep. Never returns before the deadline; timer
/// granularity rounds the wait up, not down.
pub fn wait_until(deadline: Tick) {
    if cancel::cancellable_wait_until(deadline) {
        return;
    }

    loop {
        let delay = deadline - now();
        if delay <= Tick::ZERO {
            break;
        }
        std::thread::sleep(delay_to_duration(delay));
    }
}

/// Sleep for `delay` from now, cancellation-aware.
pub fn sleep_for(delay: Tick) {
    wait_until(now() + delay);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_unit_conversions() {
        assert_eq!(Tick::from_millis(1), Tick::from_micros(1_000));
        assert_eq!(Tick::from_secs(1), Tick::from_micros(TICK_FREQ));
        assert_eq!(Tick::from_secs(2).as_micros(), 2 * TICK_FREQ);
    }

    #[test]
    fn tick_arithmetic() {
        let a = Tick::from_millis(5);
        let b = Tick::from_millis(3);
        assert_eq!(a + b, Tick::from_millis(8));
        assert_eq!(a - b, Tick::from_millis(2));
        assert_eq!(b - a, -Tick::from_millis(2));
        assert!(b - a < Tick::ZERO);
    }

    #[test]
    fn from_name_parses_exactly_the_documented_sources() {
        assert_eq!(
            ClockSourceKind::from_name("interrupt"),
            Some(ClockSourceKind::Interrupt)
        );
        assert_eq!(
            ClockSourceKind::from_name("tick"),
            Some(ClockSourceKind::TickCount)
        );
        assert_eq!(
            ClockSourceKind::from_name("multimedia"),
            Some(ClockSourceKind::Multimedia)
        );
        assert_eq!(
            ClockSourceKind::from_name("perf"),
            Some(ClockSourceKind::Performance)
        );
        assert_eq!(
            ClockSourceKind::from_name("wall"),
            Some(ClockSourceKind::Wall)
        );
        assert_eq!(ClockSourceKind::from_name("sundial"), None);
        assert_eq!(ClockSourceKind::from_name(""), None);
    }

    #[test]
    fn name_round_trips() {
        for kind in [
            ClockSourceKind::Interrupt,
            ClockSourceKind::TickCount,
            ClockSourceKind::Multimedia,
            ClockSourceKind::Performance,
            ClockSourceKind::Wall,
        ] {
            assert_eq!(ClockSourceKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn delay_to_duration_clamps() {
        assert_eq!(delay_to_duration(Tick::from_micros(-5)), Duration::ZERO);
        assert_eq!(
            delay_to_duration(Tick::from_millis(10)),
            Duration::from_millis(10)
        );
        assert_eq!(
            delay_to_duration(Tick::from_secs(i64::MAX / TICK_FREQ)),
            delay_to_duration(MAX_SLEEP_CHUNK)
        );
    }

    #[test]
    fn now_is_monotonic_after_selection() {
        // Whichever source other tests selected first, successive reads
        // of a monotonic-or-wall clock at rest must not run backwards by
        // more than wall-jump noise; for the in-process sources they must
        // not run backwards at all.
        let a = now();
        let b = now();
        if active_source() != Some(ClockSourceKind::Wall) {
            assert!(b >= a, "clock ran backwards: {a:?} -> {b:?}");
        }
    }

    #[test]
    fn setup_after_selection_is_a_no_op() {
        let _ = now(); // force selection
        let before = active_source().expect("a source is active after now()");
        let cfg = crate::config::MapConfig::new().with_string("clock-source", "wall");
        setup(Some(&cfg));
        assert_eq!(
            active_source(),
            Some(before),
            "second setup must not replace the active source"
        );
    }

    #[test]
    fn sleep_for_does_not_return_early() {
        let delay = Tick::from_millis(30);
        let start = now();
        sleep_for(delay);
        let elapsed = now() - start;
        assert!(
            elapsed >= delay,
            "slept {}us, requested {}us",
            elapsed.as_micros(),
            delay.as_micros()
        );
    }

    #[test]
    fn wait_until_past_deadline_returns_immediately() {
        let start = std::time::Instant::now();
        wait_until(now() - Tick::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
