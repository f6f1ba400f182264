//! Device readiness state and its mapping onto signal bits.

use ddk_core::Signals;

bitflags::bitflags! {
    /// Logical readiness flags a device reports to its clients.
    ///
    /// Each flag occupies one of the signal primitive's user bits, so a
    /// combined set/clear is a single call on the readiness handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceState: u32 {
        /// Data can be read without blocking.
        const READABLE = 1 << 0;
        /// Data can be written without blocking.
        const WRITABLE = 1 << 1;
        /// The device failed or is being removed.
        const ERROR = 1 << 2;
    }
}

impl DeviceState {
    /// Translates to the signal bits of the readiness handle.
    #[must_use]
    pub fn to_signals(self) -> Signals {
        let mut signals = Signals::empty();
        if self.contains(Self::READABLE) {
            signals |= Signals::USER_0;
        }
        if self.contains(Self::WRITABLE) {
            signals |= Signals::USER_1;
        }
        if self.contains(Self::ERROR) {
            signals |= Signals::USER_2;
        }
        signals
    }

    /// Recovers the logical state from observed signal bits. Bits outside
    /// the three reserved positions are ignored.
    #[must_use]
    pub fn from_signals(signals: Signals) -> Self {
        let mut state = Self::empty();
        if signals.contains(Signals::USER_0) {
            state |= Self::READABLE;
        }
        if signals.contains(Signals::USER_1) {
            state |= Self::WRITABLE;
        }
        if signals.contains(Signals::USER_2) {
            state |= Self::ERROR;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_reserved_user_bits() {
        assert_eq!(DeviceState::READABLE.to_signals(), Signals::USER_0);
        assert_eq!(DeviceState::WRITABLE.to_signals(), Signals::USER_1);
        assert_eq!(DeviceState::ERROR.to_signals(), Signals::USER_2);
        assert!(Signals::USER_ALL.contains(DeviceState::all().to_signals()));
    }

    #[test]
    fn unrelated_signal_bits_ignored() {
        let observed = Signals::USER_1 | Signals::USER_3 | Signals::PEER_CLOSED;
        assert_eq!(DeviceState::from_signals(observed), DeviceState::WRITABLE);
    }

    #[test]
    fn mapping_is_reversible() {
        let state = DeviceState::READABLE | DeviceState::ERROR;
        assert_eq!(DeviceState::from_signals(state.to_signals()), state);
    }
}
