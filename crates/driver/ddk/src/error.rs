//! Device framework error types.

use core::fmt;

use ddk_core::{LifeError, SetOnceError, SignalError};

/// Outcomes of device, dispatch and lifecycle operations.
///
/// All variants except [`Corruption`](Self::Corruption) are ordinary,
/// recoverable results returned to the caller. Lifecycle errors
/// (`AlreadyBound`, `AlreadyPublished`) indicate a defect in the calling
/// driver; retrying will not help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The requested protocol is not implemented by this device.
    NotSupported,
    /// The device is not in a valid state for this operation (e.g. it is
    /// being removed, or was never published).
    BadState,
    /// The device already has a bound driver.
    AlreadyBound,
    /// The device was already published, or a write-once field was written
    /// after publication.
    AlreadyPublished,
    /// No live device or driver matches the given id.
    NotFound,
    /// An argument was malformed.
    InvalidArgs,
    /// A backing kernel object could not be allocated.
    NoResources,
    /// A device failed its validity check. Fatal: never returned, only
    /// raised by aborting.
    Corruption,
}

impl DeviceError {
    /// Returns `true` for the single unrecoverable class.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Corruption)
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported => f.write_str("protocol not supported"),
            Self::BadState => f.write_str("bad device state"),
            Self::AlreadyBound => f.write_str("device already bound"),
            Self::AlreadyPublished => f.write_str("device already published"),
            Self::NotFound => f.write_str("device not found"),
            Self::InvalidArgs => f.write_str("invalid arguments"),
            Self::NoResources => f.write_str("no resources"),
            Self::Corruption => f.write_str("device corruption detected"),
        }
    }
}

impl From<LifeError> for DeviceError {
    fn from(err: LifeError) -> Self {
        match err {
            LifeError::Removing | LifeError::NoOpens => Self::BadState,
            LifeError::Overflow => Self::NoResources,
        }
    }
}

impl From<SetOnceError> for DeviceError {
    fn from(err: SetOnceError) -> Self {
        match err {
            SetOnceError::Occupied => Self::BadState,
            SetOnceError::Sealed => Self::AlreadyPublished,
        }
    }
}

impl From<SignalError> for DeviceError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::NoResources => Self::NoResources,
            SignalError::InvalidBits => Self::InvalidArgs,
        }
    }
}
