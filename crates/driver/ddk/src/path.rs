//! Hierarchical device paths.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// A device's position in the tree as the names from the root down
/// (e.g., `root/pci/ahci-0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DevicePath {
    segments: Vec<String>,
}

impl DevicePath {
    /// Builds a path from root-first segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the leaf (last) segment: the device's own name.
    #[must_use]
    pub fn leaf(&self) -> &str {
        self.segments.last().map_or("", String::as_str)
    }

    /// Returns the number of segments; the root has depth 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Returns the path segments, root first.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns `true` if `self` is `other` or lies beneath it.
    #[must_use]
    pub fn starts_with(&self, other: &Self) -> bool {
        self.segments.starts_with(&other.segments)
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.segments {
            if !first {
                f.write_str("/")?;
            }
            f.write_str(seg)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_with_slash() {
        let path = DevicePath::from_segments(["root", "pci", "ahci-0"]);
        assert_eq!(path.to_string(), "root/pci/ahci-0");
        assert_eq!(path.leaf(), "ahci-0");
        assert_eq!(path.depth(), 3);
    }

    #[test]
    fn empty_path() {
        let path = DevicePath::from_segments(Vec::<String>::new());
        assert_eq!(path.leaf(), "");
        assert_eq!(path.to_string(), "");
    }

    #[test]
    fn prefix_check() {
        let parent = DevicePath::from_segments(["root", "pci"]);
        let child = DevicePath::from_segments(["root", "pci", "ahci-0"]);
        assert!(child.starts_with(&parent));
        assert!(!parent.starts_with(&child));
    }
}
