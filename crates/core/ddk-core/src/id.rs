//! Type-safe identifiers for devices, drivers and protocols.
//!
//! These newtypes prevent accidental mixing of arena slots, driver handles
//! and protocol codes at compile time.

use core::fmt;

/// Generation-checked index of a device in the device tree arena.
///
/// A slot can be reused after its device has been removed; the generation is
/// bumped on every reuse so that an id held across a removal never resolves
/// to the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    index: u32,
    generation: u32,
}

impl DeviceId {
    /// Creates a new `DeviceId` from a slot index and its generation.
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the arena slot index.
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the slot generation this id was issued for.
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Returns the slot index as `usize` (convenience for indexing).
    pub const fn as_usize(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Driver identifier, issued by the driver registry in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DriverId(u32);

impl DriverId {
    /// The device manager itself; owns and binds the root device.
    pub const MANAGER: Self = Self(0);

    /// Creates a new `DriverId`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drv{}", self.0)
    }
}

/// Protocol (capability) identifier.
///
/// Protocol ids are four-character codes packed big-endian into a `u32`,
/// e.g. `pDEV` for the base device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ProtocolId(u32);

impl ProtocolId {
    /// The base device protocol every device implements.
    pub const DEVICE: Self = Self::fourcc(*b"pDEV");

    /// Creates a new `ProtocolId` from its raw value.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Creates a `ProtocolId` from a four-character code.
    pub const fn fourcc(code: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(code))
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        if bytes.iter().all(u8::is_ascii_graphic) {
            for b in bytes {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

/// Identifier of a remote (peer-side) object associated with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RemoteId(u64);

impl RemoteId {
    /// Creates a new `RemoteId`.
    pub const fn new(val: u64) -> Self {
        Self(val)
    }

    /// Returns the raw `u64` value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_parts() {
        let id = DeviceId::new(3, 7);
        assert_eq!(id.index(), 3);
        assert_eq!(id.generation(), 7);
        assert_eq!(id.as_usize(), 3);
    }

    #[test]
    fn device_id_generation_distinguishes() {
        assert_ne!(DeviceId::new(1, 0), DeviceId::new(1, 1));
    }

    #[test]
    fn device_id_display() {
        assert_eq!(format!("{}", DeviceId::new(4, 2)), "4v2");
    }

    #[test]
    fn driver_id_manager_is_zero() {
        assert_eq!(DriverId::MANAGER.as_u32(), 0);
        assert_eq!(format!("{}", DriverId::new(5)), "drv5");
    }

    #[test]
    fn protocol_fourcc() {
        assert_eq!(ProtocolId::DEVICE.as_u32(), 0x7044_4556);
        assert_eq!(format!("{}", ProtocolId::DEVICE), "pDEV");
    }

    #[test]
    fn protocol_display_non_ascii() {
        assert_eq!(format!("{}", ProtocolId::new(1)), "0x00000001");
    }

    #[test]
    fn remote_id_roundtrip() {
        assert_eq!(RemoteId::new(0xabc).as_u64(), 0xabc);
        assert_eq!(format!("{}", RemoteId::new(0xabc)), "0xabc");
    }
}
