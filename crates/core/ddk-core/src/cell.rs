//! Write-once cell that can be sealed.
//!
//! Devices expose a handful of fields (secondary protocol, binding
//! properties) that the creating driver fills in after creation and before
//! publication. After publication they are read without locks. [`SetOnce`]
//! models that window: it accepts a single write until it is sealed, after
//! which it only hands out shared references.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;
const SEALED: u8 = 3;

/// Why a [`SetOnce::set`] was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOnceError {
    /// The cell already holds a value (or another writer is filling it).
    Occupied,
    /// The cell was sealed while still empty.
    Sealed,
}

impl fmt::Display for SetOnceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Occupied => f.write_str("value already set"),
            Self::Sealed => f.write_str("cell is sealed"),
        }
    }
}

/// A cell written at most once, until [`seal`](SetOnce::seal) is called.
///
/// State machine: `Empty → Writing → Ready` for the single write, and
/// `Empty → Sealed` when sealed without a value. Sealing a `Ready` cell
/// leaves it `Ready`; either way no further write is accepted.
pub struct SetOnce<T> {
    state: AtomicU8,
    sealed: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The value is written exactly once by the thread that won the
// `EMPTY -> WRITING` transition, and only read after `READY` is published
// with release ordering. `T: Send` because the value moves in from the
// writer; `T: Sync` because readers on other threads share `&T`.
unsafe impl<T: Send> Send for SetOnce<T> {}
unsafe impl<T: Send + Sync> Sync for SetOnce<T> {}

impl<T> SetOnce<T> {
    /// Creates an empty, unsealed cell.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            sealed: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Stores `value` if the cell is empty and unsealed.
    ///
    /// On failure the value is handed back together with the reason.
    pub fn set(&self, value: T) -> Result<(), (T, SetOnceError)> {
        if self.sealed.load(Ordering::Acquire) {
            return Err((value, SetOnceError::Sealed));
        }
        match self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {
                // SAFETY: Winning EMPTY -> WRITING gives this thread exclusive
                // access to the slot; no reader looks at it before READY.
                unsafe { (*self.value.get()).write(value) };
                self.state.store(READY, Ordering::Release);
                Ok(())
            }
            Err(SEALED) => Err((value, SetOnceError::Sealed)),
            Err(_) => Err((value, SetOnceError::Occupied)),
        }
    }

    /// Seals the cell: later writes fail with [`SetOnceError::Sealed`].
    ///
    /// If a writer is mid-way through [`set`](Self::set), waits for it to
    /// finish so the sealed state is final when this returns.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        loop {
            match self
                .state
                .compare_exchange(EMPTY, SEALED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) | Err(READY | SEALED) => return,
                Err(_) => core::hint::spin_loop(),
            }
        }
    }

    /// Returns `true` once [`seal`](Self::seal) has been called.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Returns the stored value, if any.
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only stored after the value was fully written,
            // and the value is never written again.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }
}

impl<T> Default for SetOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SetOnce<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY means the value was initialized, and `&mut self`
            // rules out concurrent readers.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SetOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetOnce")
            .field("value", &self.get())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
