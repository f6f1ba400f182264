//! Base driver trait and metadata types.

use alloc::sync::Arc;

use crate::device::Device;
use crate::error::DeviceError;

/// Static metadata describing a driver.
#[derive(Debug, Clone, Copy)]
pub struct DriverInfo {
    /// Short name of the driver (e.g. "ahci").
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
}

/// A driver known to the device manager.
///
/// The manager calls these hooks without holding any of its locks, so a
/// driver may create and publish child devices from inside `bind`.
pub trait Driver: Send + Sync {
    /// Returns static information about this driver.
    fn info(&self) -> DriverInfo;

    /// Called after the manager assigned `dev` to this driver.
    ///
    /// An error undoes the assignment and returns `dev` to the unmatched
    /// index, unless the device was unbound or removed in the meantime.
    ///
    /// The device is already assigned while this runs. A concurrent
    /// [`unbind`](Self::unbind) or removal is not held back, so `unbind` can
    /// be delivered before `bind` returns; the manager then fails the bind
    /// with [`DeviceError::BadState`].
    fn bind(&self, dev: &Arc<Device>) -> Result<(), DeviceError> {
        let _ = dev;
        Ok(())
    }

    /// Called when `dev` is unbound from this driver or removed while bound.
    fn unbind(&self, dev: &Arc<Device>) {
        let _ = dev;
    }
}
