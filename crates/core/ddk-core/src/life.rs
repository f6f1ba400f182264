//! Packed lifecycle counter deciding when a device is released.
//!
//! A device may only be released once two independent events have both
//! happened: its removal completed, and its reference count drained to zero.
//! Those events race (a client's final close against the manager's removal),
//! so they are tracked in one atomic word and every transition is a single
//! compare-exchange. Whichever transition first observes "removed and zero"
//! also sets `RELEASED` in the same exchange, so exactly one caller is told
//! to run the release.
//!
//! ## Layout
//!
//! ```text
//!  63      59  58        57       56      55         32 31          0
//! +----------+----------+--------+--------+-------------+-------------+
//! | reserved | RELEASED | REMOVED| REMOVING|    pins     |    opens    |
//! +----------+----------+--------+--------+-------------+-------------+
//! ```
//!
//! - **opens**: outstanding client opens.
//! - **pins**: structural references that are not opens: the tree's
//!   implicit reference while published, one per published child, and
//!   short-lived pins held across a driver `close` callback.

use core::fmt;

use crate::sync::loom_compat::{AtomicU64, Ordering};

const OPENS_MASK: u64 = 0xFFFF_FFFF;
const PINS_SHIFT: u32 = 32;
const PINS_MASK: u64 = 0x00FF_FFFF << PINS_SHIFT;
const PIN_ONE: u64 = 1 << PINS_SHIFT;
const REMOVING: u64 = 1 << 56;
const REMOVED: u64 = 1 << 57;
const RELEASED: u64 = 1 << 58;

/// Why a lifecycle transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeError {
    /// The object is being removed (or already released); no new references.
    Removing,
    /// A close was requested with no outstanding opens.
    NoOpens,
    /// A counter would overflow its field.
    Overflow,
}

impl fmt::Display for LifeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Removing => f.write_str("object is being removed"),
            Self::NoOpens => f.write_str("no outstanding opens"),
            Self::Overflow => f.write_str("reference count overflow"),
        }
    }
}

/// Outcome of a transition that drops a reference or completes removal.
#[must_use = "a `Drain::Release` must be acted upon exactly once"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The object stays alive.
    Live,
    /// This caller won the release: removal is complete, the count is zero,
    /// and `RELEASED` has been set on its behalf.
    Release,
}

/// Point-in-time view of a [`LifeCount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifeSnapshot {
    /// Outstanding opens.
    pub opens: u32,
    /// Structural pins.
    pub pins: u32,
    /// Removal has begun.
    pub removing: bool,
    /// Removal has completed.
    pub removed: bool,
    /// The release has been claimed.
    pub released: bool,
}

impl LifeSnapshot {
    /// Returns `opens + pins`.
    #[must_use]
    pub fn refcount(&self) -> u64 {
        u64::from(self.opens) + u64::from(self.pins)
    }

    fn decode(word: u64) -> Self {
        Self {
            opens: (word & OPENS_MASK) as u32,
            pins: ((word & PINS_MASK) >> PINS_SHIFT) as u32,
            removing: word & REMOVING != 0,
            removed: word & REMOVED != 0,
            released: word & RELEASED != 0,
        }
    }
}

/// Atomic reference count fused with removal/release state.
pub struct LifeCount {
    word: AtomicU64,
}

impl LifeCount {
    /// Creates a counter with no references and no removal in progress.
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Creates a counter with no references and no removal in progress.
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Returns a snapshot of the current state.
    pub fn snapshot(&self) -> LifeSnapshot {
        LifeSnapshot::decode(self.word.load(Ordering::Acquire))
    }

    /// Returns `true` once removal has begun.
    pub fn is_removing(&self) -> bool {
        self.word.load(Ordering::Acquire) & REMOVING != 0
    }

    /// Returns `true` once the release has been claimed.
    pub fn is_released(&self) -> bool {
        self.word.load(Ordering::Acquire) & RELEASED != 0
    }

    /// Takes a client open.
    ///
    /// Fails with [`LifeError::Removing`] once removal has begun, so no open
    /// can ever succeed on a removed or released object.
    pub fn acquire_open(&self) -> Result<(), LifeError> {
        self.update(|word| {
            if word & REMOVING != 0 {
                return Err(LifeError::Removing);
            }
            if word & OPENS_MASK == OPENS_MASK {
                return Err(LifeError::Overflow);
            }
            Ok(word + 1)
        })
        .map(drop)
    }

    /// Drops an open taken by [`acquire_open`](Self::acquire_open) without a
    /// close callback (used to roll back a refused open).
    pub fn cancel_open(&self) -> Result<Drain, LifeError> {
        self.update(|word| {
            if word & OPENS_MASK == 0 {
                return Err(LifeError::NoOpens);
            }
            Ok(settle(word - 1))
        })
        .map(|(old, new)| drain(old, new))
    }

    /// Converts one open into a pin.
    ///
    /// The caller runs its close callback while holding the pin and then
    /// calls [`unpin`](Self::unpin). The count therefore cannot reach zero,
    /// and the release cannot run, while the callback is in progress.
    pub fn begin_close(&self) -> Result<(), LifeError> {
        self.update(|word| {
            if word & OPENS_MASK == 0 {
                return Err(LifeError::NoOpens);
            }
            if word & PINS_MASK == PINS_MASK {
                return Err(LifeError::Overflow);
            }
            Ok(word - 1 + PIN_ONE)
        })
        .map(drop)
    }

    /// Takes a structural pin. Refused once removal has begun.
    pub fn pin(&self) -> Result<(), LifeError> {
        self.update(|word| {
            if word & REMOVING != 0 {
                return Err(LifeError::Removing);
            }
            if word & PINS_MASK == PINS_MASK {
                return Err(LifeError::Overflow);
            }
            Ok(word + PIN_ONE)
        })
        .map(drop)
    }

    /// Drops a structural pin.
    ///
    /// # Panics
    ///
    /// Panics if no pin is held; that is a bookkeeping bug in the caller.
    pub fn unpin(&self) -> Drain {
        match self.update(|word| {
            if word & PINS_MASK == 0 {
                return Err(LifeError::NoOpens);
            }
            Ok(settle(word - PIN_ONE))
        }) {
            Ok((old, new)) => drain(old, new),
            Err(_) => panic!("LifeCount::unpin without a pin"),
        }
    }

    /// Marks removal as begun.
    ///
    /// Returns `true` for the first caller only; later calls are no-ops.
    pub fn begin_removal(&self) -> bool {
        self.word.fetch_or(REMOVING, Ordering::AcqRel) & REMOVING == 0
    }

    /// Marks removal as complete, optionally dropping the tree's pin in the
    /// same step.
    ///
    /// Returns [`Drain::Release`] if nothing else holds a reference.
    pub fn finish_removal(&self, drop_tree_pin: bool) -> Drain {
        match self.update(|word| {
            let mut next = word | REMOVING | REMOVED;
            if drop_tree_pin {
                if next & PINS_MASK == 0 {
                    return Err(LifeError::NoOpens);
                }
                next -= PIN_ONE;
            }
            Ok(settle(next))
        }) {
            Ok((old, new)) => drain(old, new),
            Err(_) => panic!("LifeCount::finish_removal without the tree pin"),
        }
    }

    /// Runs a compare-exchange loop applying `f` to the current word.
    fn update(
        &self,
        mut f: impl FnMut(u64) -> Result<u64, LifeError>,
    ) -> Result<(u64, u64), LifeError> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let next = f(current)?;
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((current, next)),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(not(loom))]
impl Default for LifeCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LifeCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}

/// Claims the release if the word is removed, drained, and not yet released.
fn settle(word: u64) -> u64 {
    let drained = word & (OPENS_MASK | PINS_MASK) == 0;
    if drained && word & REMOVED != 0 && word & RELEASED == 0 {
        word | RELEASED
    } else {
        word
    }
}

fn drain(old: u64, new: u64) -> Drain {
    if old & RELEASED == 0 && new & RELEASED != 0 {
        Drain::Release
    } else {
        Drain::Live
    }
}
