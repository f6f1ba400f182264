//! Abstraction over the kernel's waitable signal primitive.
//!
//! Devices report readiness to clients through a kernel object whose signal
//! bits can be set and cleared atomically and waited upon, possibly from
//! another process. The device model only calls into that primitive; it is
//! reached through [`SignalObject`] and created through [`SignalFactory`].
//!
//! [`EventObject`] is an in-process implementation of the same contract for
//! hosts without a kernel and for tests. It is level-triggered like the real
//! primitive: only the current bit values are observable.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Signal bits of a waitable kernel object.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Signals: u32 {
        /// Object-defined: readable.
        const READABLE = 1 << 0;
        /// Object-defined: writable.
        const WRITABLE = 1 << 1;
        /// Object-defined: peer closed.
        const PEER_CLOSED = 1 << 2;
        /// Object-defined: signaled.
        const SIGNALED = 1 << 3;
        /// Free for the object's user.
        const USER_0 = 1 << 4;
        /// Free for the object's user.
        const USER_1 = 1 << 5;
        /// Free for the object's user.
        const USER_2 = 1 << 6;
        /// Free for the object's user.
        const USER_3 = 1 << 7;
        /// All user-settable bits.
        const USER_ALL = Self::USER_0.bits()
            | Self::USER_1.bits()
            | Self::USER_2.bits()
            | Self::USER_3.bits();
    }
}

/// Errors reported by the signal primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// No kernel object could be allocated.
    NoResources,
    /// The requested bits are outside the user-settable range.
    InvalidBits,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoResources => f.write_str("no resources for signal object"),
            Self::InvalidBits => f.write_str("signal bits outside the user range"),
        }
    }
}

/// A waitable object supporting atomic "set some bits, clear others".
pub trait SignalObject: Send + Sync {
    /// Clears `clear` and sets `set` in one atomic step.
    ///
    /// Waiters observe either the old or the new bit pattern, never a mix.
    /// Bits in both masks end up set.
    fn signal(&self, set: Signals, clear: Signals) -> Result<(), SignalError>;

    /// Returns the currently asserted bits.
    fn observe(&self) -> Signals;

    /// Blocks until any bit in `mask` is asserted; returns all asserted bits.
    fn wait_any(&self, mask: Signals) -> Signals;
}

/// Creates signal objects (the primitive's `create()` call).
pub trait SignalFactory: Send + Sync {
    /// Allocates a new object with no bits asserted.
    fn create(&self) -> Result<Arc<dyn SignalObject>, SignalError>;
}

/// In-process [`SignalObject`] backed by one atomic word.
#[derive(Debug, Default)]
pub struct EventObject {
    bits: AtomicU32,
}

impl EventObject {
    /// Creates an object with no bits asserted.
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }
}

impl SignalObject for EventObject {
    fn signal(&self, set: Signals, clear: Signals) -> Result<(), SignalError> {
        if !Signals::USER_ALL.contains(set | clear) {
            return Err(SignalError::InvalidBits);
        }
        // Single read-modify-write: no intermediate state is ever stored.
        let _ = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((bits & !clear.bits()) | set.bits())
            });
        Ok(())
    }

    fn observe(&self) -> Signals {
        Signals::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    fn wait_any(&self, mask: Signals) -> Signals {
        loop {
            let bits = self.observe();
            if bits.intersects(mask) {
                return bits;
            }
            core::hint::spin_loop();
        }
    }
}

/// [`SignalFactory`] handing out [`EventObject`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEvents;

impl SignalFactory for LocalEvents {
    fn create(&self) -> Result<Arc<dyn SignalObject>, SignalError> {
        Ok(Arc::new(EventObject::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear() {
        let ev = EventObject::new();
        assert!(ev.observe().is_empty());
    }

    #[test]
    fn set_and_clear_in_one_call() {
        let ev = EventObject::new();
        ev.signal(Signals::USER_0, Signals::empty()).unwrap();
        ev.signal(Signals::USER_1, Signals::USER_0).unwrap();
        assert_eq!(ev.observe(), Signals::USER_1);
    }

    #[test]
    fn set_wins_over_clear() {
        let ev = EventObject::new();
        ev.signal(Signals::USER_2, Signals::USER_2).unwrap();
        assert_eq!(ev.observe(), Signals::USER_2);
    }

    #[test]
    fn non_user_bits_rejected() {
        let ev = EventObject::new();
        assert_eq!(
            ev.signal(Signals::READABLE, Signals::empty()),
            Err(SignalError::InvalidBits)
        );
        assert!(ev.observe().is_empty());
    }

    #[test]
    fn wait_any_returns_when_already_set() {
        let ev = EventObject::new();
        ev.signal(Signals::USER_3, Signals::empty()).unwrap();
        assert_eq!(ev.wait_any(Signals::USER_3 | Signals::USER_0), Signals::USER_3);
    }

    #[test]
    fn wait_any_wakes_on_other_thread() {
        let ev = Arc::new(EventObject::new());
        let waiter = {
            let ev = Arc::clone(&ev);
            std::thread::spawn(move || ev.wait_any(Signals::USER_2))
        };
        ev.signal(Signals::USER_2, Signals::empty()).unwrap();
        assert!(waiter.join().unwrap().contains(Signals::USER_2));
    }

    #[test]
    fn factory_creates_independent_objects() {
        let a = LocalEvents.create().unwrap();
        let b = LocalEvents.create().unwrap();
        a.signal(Signals::USER_0, Signals::empty()).unwrap();
        assert!(b.observe().is_empty());
    }

    #[test]
    fn display_all_variants() {
        assert_eq!(
            format!("{}", SignalError::NoResources),
            "no resources for signal object"
        );
        assert_eq!(
            format!("{}", SignalError::InvalidBits),
            "signal bits outside the user range"
        );
    }
}
