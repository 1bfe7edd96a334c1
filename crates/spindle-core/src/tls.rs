//! Thread-local variable registry with guaranteed per-thread teardown.
//!
//! ## Design
//!
//! - **Slot registry**: an arena-backed doubly-linked list (indices, not
//!   pointers) under one process-wide mutex. The list order is creation
//!   order; teardown scans it from the tail. A per-entry generation
//!   counter invalidates stale [`TlsSlot`] handles when an arena index
//!   is reused.
//!
//! - **Per-thread values**: native `thread_local!` storage keyed by
//!   (index, generation). The access path takes no lock — only the
//!   calling thread ever reads or writes its own values.
//!
//! - **Teardown**: on thread exit, the first tail-ward slot holding a
//!   non-zero value with a destructor is cleared and its destructor run
//!   with the registry lock released, then the scan restarts from the
//!   tail. Destructors may create or destroy slots and set values on
//!   other slots; restarting keeps iteration valid across such side
//!   effects. The loop runs to fixpoint with no iteration cap, which is
//!   unbounded if a destructor perpetually re-sets its own slot — an
//!   accepted trade-off, not silently capped.

use std::cell::RefCell;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::RuntimeError;

/// Upper bound on live slots; creation past this fails with
/// [`RuntimeError::ResourceExhausted`].
pub const TLS_SLOTS_MAX: usize = 1024;

/// Per-thread destructor: receives the thread's value for the slot.
pub type Destructor = fn(usize);

/// Handle to a registered thread-local variable. Copyable and shared by
/// every thread that sets a value under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsSlot {
    index: u32,
    generation: u32,
}

// ---------------------------------------------------------------------------
// Global registry
// ---------------------------------------------------------------------------

struct SlotEntry {
    in_use: bool,
    destructor: Option<Destructor>,
    generation: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Registry {
    entries: Vec<SlotEntry>,
    free: Vec<usize>,
    tail: Option<usize>,
    live: usize,
}

/// One process-wide lock guards the list; the value access path never
/// takes it.
static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    entries: Vec::new(),
    free: Vec::new(),
    tail: None,
    live: 0,
});

thread_local! {
    /// This thread's values, keyed by (index, generation). 0 means unset.
    static VALUES: RefCell<HashMap<(u32, u32), usize>> = RefCell::new(HashMap::new());
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Register a new thread-local variable.
///
/// The optional `destructor` runs during a thread's exit teardown for
/// each thread that still holds a non-zero value.
pub fn create(destructor: Option<Destructor>) -> Result<TlsSlot, RuntimeError> {
    let mut reg = REGISTRY.lock();
    if reg.live >= TLS_SLOTS_MAX {
        return Err(RuntimeError::ResourceExhausted {
            what: "TLS slot",
            source: None,
        });
    }

    let index = match reg.free.pop() {
        Some(index) => index,
        None => {
            reg.entries.push(SlotEntry {
                in_use: false,
                destructor: None,
                generation: 0,
                prev: None,
                next: None,
            });
            reg.entries.len() - 1
        }
    };

    let tail = reg.tail;
    let generation = {
        let entry = &mut reg.entries[index];
        entry.in_use = true;
        entry.destructor = destructor;
        entry.prev = tail;
        entry.next = None;
        entry.generation
    };
    if let Some(t) = tail {
        reg.entries[t].next = Some(index);
    }
    reg.tail = Some(index);
    reg.live += 1;

    Ok(TlsSlot {
        index: index as u32,
        generation,
    })
}

/// Remove a variable from the registry.
///
/// Does *not* run destructors and does not touch values other threads
/// already set; clearing those is the caller's responsibility if it
/// matters. A handle that was already destroyed is ignored.
pub fn destroy(slot: TlsSlot) {
    let mut reg = REGISTRY.lock();
    let index = slot.index as usize;
    if index >= reg.entries.len() {
        return;
    }
    if !reg.entries[index].in_use || reg.entries[index].generation != slot.generation {
        return; // stale handle
    }

    let (prev, next) = (reg.entries[index].prev, reg.entries[index].next);
    if let Some(p) = prev {
        reg.entries[p].next = next;
    }
    if let Some(n) = next {
        reg.entries[n].prev = prev;
    } else {
        reg.tail = prev;
    }

    let entry = &mut reg.entries[index];
    entry.in_use = false;
    entry.destructor = None;
    entry.prev = None;
    entry.next = None;
    entry.generation = entry.generation.wrapping_add(1);
    reg.free.push(index);
    reg.live -= 1;
}

/// Set the calling thread's value for `slot`. Setting 0 clears it.
///
/// No lock is taken: only the calling thread touches its own values. A
/// stale handle (destroyed slot) is inert.
pub fn set(slot: TlsSlot, value: usize) {
    VALUES.with(|values| {
        let key = (slot.index, slot.generation);
        if value == 0 {
            values.borrow_mut().remove(&key);
        } else {
            values.borrow_mut().insert(key, value);
        }
    });
}

/// The calling thread's value for `slot`, or 0 if unset (or the handle
/// is stale).
#[must_use]
pub fn get(slot: TlsSlot) -> usize {
    VALUES.with(|values| {
        values
            .borrow()
            .get(&(slot.index, slot.generation))
            .copied()
            .unwrap_or(0)
    })
}

// ---------------------------------------------------------------------------
// Thread-exit teardown
// ---------------------------------------------------------------------------

/// Run destructors for every slot this thread holds a value on.
///
/// Called by the thread entry trampoline on every exit path. Each pass
/// scans the registry from the tail, fires at most one destructor with
/// the lock released, and restarts; the loop ends when a full scan finds
/// nothing left to do.
pub(crate) fn teardown_current_thread() {
    loop {
        let fired = {
            let reg = REGISTRY.lock();
            let mut cursor = reg.tail;
            let mut found = None;
            while let Some(index) = cursor {
                let entry = &reg.entries[index];
                let slot = TlsSlot {
                    index: index as u32,
                    generation: entry.generation,
                };
                if let Some(destructor) = entry.destructor {
                    let value = get(slot);
                    if value != 0 {
                        found = Some((slot, destructor, value));
                        break;
                    }
                }
                cursor = entry.prev;
            }
            found
        };

        match fired {
            Some((slot, destructor, value)) => {
                // Clear before invoking so the destructor observes the
                // slot as unset and a re-set is a deliberate act.
                set(slot, 0);
                destructor(value);
            }
            None => break,
        }
    }

    // Drop any values without destructors (and stale-generation keys).
    VALUES.with(|values| values.borrow_mut().clear());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
