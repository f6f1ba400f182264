//! Capability ("protocol") dispatch.
//!
//! A device always implements the base device protocol and may expose
//! protocol-specific operation tables on top of it. Operation tables are
//! type-erased as `Arc<dyn Any + Send + Sync>` so a device can hand out any
//! concrete ops type; callers recover the concrete type with
//! [`ProtocolRef::downcast`] or [`Device::protocol`](crate::Device::protocol).

use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

use ddk_core::ProtocolId;

use crate::device::Device;
use crate::error::DeviceError;

/// A type-erased protocol operation table.
pub type ProtocolOps = Arc<dyn Any + Send + Sync>;

/// The result of a successful protocol query.
#[derive(Clone)]
pub enum ProtocolRef {
    /// The base device protocol: the device's own [`DeviceOps`](crate::DeviceOps).
    Device,
    /// A protocol-specific operation table.
    Ops(ProtocolOps),
}

impl ProtocolRef {
    /// Returns the operation table as `T`, or `None` for the base protocol
    /// or a different concrete type.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Device => None,
            Self::Ops(ops) => Arc::clone(ops).downcast::<T>().ok(),
        }
    }

    /// Returns `true` for the base device protocol.
    #[must_use]
    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device)
    }
}

impl fmt::Debug for ProtocolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => f.write_str("ProtocolRef::Device"),
            Self::Ops(_) => f.write_str("ProtocolRef::Ops(..)"),
        }
    }
}

/// The one additional protocol a device may expose through the
/// convenience dispatch path.
#[derive(Clone)]
pub struct SecondaryProtocol {
    /// Protocol identifier.
    pub id: ProtocolId,
    /// Operation table returned for `id`.
    pub ops: ProtocolOps,
}

impl SecondaryProtocol {
    /// Wraps a concrete operation table.
    pub fn new<T: Any + Send + Sync>(id: ProtocolId, ops: Arc<T>) -> Self {
        Self { id, ops }
    }
}

impl fmt::Debug for SecondaryProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryProtocol")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Convenience `get_protocol` for devices with at most one secondary
/// protocol.
///
/// The base protocol always resolves; any other id resolves only if it
/// equals the device's secondary protocol id. Everything else is
/// [`DeviceError::NotSupported`].
pub fn base_get_protocol(dev: &Device, proto: ProtocolId) -> Result<ProtocolRef, DeviceError> {
    if proto == ProtocolId::DEVICE {
        return Ok(ProtocolRef::Device);
    }
    match dev.secondary_protocol() {
        Some(secondary) if secondary.id == proto => {
            Ok(ProtocolRef::Ops(Arc::clone(&secondary.ops)))
        }
        _ => Err(DeviceError::NotSupported),
    }
}
