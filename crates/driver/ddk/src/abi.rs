//! ABI-visible constants and the inline device name buffer.
//!
//! Existing drivers see a device through a fixed layout: a validity tag at a
//! fixed offset, a name buffer of [`DEVICE_NAME_MAX`] bytes plus a
//! terminator, and a single secondary protocol id/ops pair. These values must
//! not change.

use core::fmt;

/// Validity tag stored in every live device: the four-character code `MDEV`.
pub const DEVICE_MAGIC: usize = u32::from_be_bytes(*b"MDEV") as usize;

/// Maximum device name length in bytes, excluding the NUL terminator.
pub const DEVICE_NAME_MAX: usize = 32;

/// Fixed-capacity, NUL-terminated device name.
///
/// Names longer than [`DEVICE_NAME_MAX`] bytes are truncated at the last
/// UTF-8 character boundary that fits; an embedded NUL ends the name.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceName {
    buf: [u8; DEVICE_NAME_MAX + 1],
    len: u8,
}

impl DeviceName {
    /// Builds a name from `name`, truncating as described above.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let name = name.split('\0').next().unwrap_or_default();
        let mut len = name.len().min(DEVICE_NAME_MAX);
        while !name.is_char_boundary(len) {
            len -= 1;
        }

        let mut buf = [0u8; DEVICE_NAME_MAX + 1];
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            buf,
            // `len <= DEVICE_NAME_MAX`, which fits in a byte.
            len: len as u8,
        }
    }

    /// Returns `true` if [`DeviceName::new`] would shorten `name`.
    #[must_use]
    pub fn truncates(name: &str) -> bool {
        let stored = Self::new(name);
        stored.as_str().len() != name.len()
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..usize::from(self.len)]).unwrap_or_default()
    }

    /// Returns the raw buffer including the NUL terminator, as laid out in
    /// the ABI.
    #[must_use]
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..=usize::from(self.len)]
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_mdev() {
        assert_eq!(DEVICE_MAGIC, 0x4D44_4556);
    }

    #[test]
    fn short_name_kept() {
        let name = DeviceName::new("ahci-0");
        assert_eq!(name.as_str(), "ahci-0");
        assert_eq!(name.as_bytes_with_nul(), b"ahci-0\0");
        assert!(!DeviceName::truncates("ahci-0"));
    }

    #[test]
    fn exact_capacity_kept() {
        let raw = "a".repeat(DEVICE_NAME_MAX);
        let name = DeviceName::new(&raw);
        assert_eq!(name.as_str(), raw);
        assert_eq!(name.as_bytes_with_nul().len(), DEVICE_NAME_MAX + 1);
    }

    #[test]
    fn long_name_truncated() {
        let raw = "b".repeat(DEVICE_NAME_MAX + 10);
        assert!(DeviceName::truncates(&raw));
        assert_eq!(DeviceName::new(&raw).as_str().len(), DEVICE_NAME_MAX);
    }

    #[test]
    fn truncation_respects_char_boundary() {
        // 31 ASCII bytes followed by a 2-byte character straddling the limit.
        let raw = format!("{}é", "c".repeat(DEVICE_NAME_MAX - 1));
        let name = DeviceName::new(&raw);
        assert_eq!(name.as_str(), "c".repeat(DEVICE_NAME_MAX - 1));
    }

    #[test]
    fn embedded_nul_ends_name() {
        let name = DeviceName::new("usb\0tail");
        assert_eq!(name.as_str(), "usb");
        assert!(DeviceName::truncates("usb\0tail"));
    }

    #[test]
    fn empty_name() {
        let name = DeviceName::new("");
        assert_eq!(name.as_str(), "");
        assert_eq!(name.as_bytes_with_nul(), b"\0");
    }
}
