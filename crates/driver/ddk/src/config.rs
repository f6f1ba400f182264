//! Device manager configuration.
//!
//! The manager takes a [`ManagerConfig`] at construction; the policy it
//! carries is copied into every device created afterwards.

/// What `close` does when the device has no outstanding opens.
///
/// This covers an unbalanced close on a live device as well as any close
/// arriving after the device was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    /// Return [`DeviceError::BadState`](crate::DeviceError::BadState).
    /// No close ever reports success once the device is released.
    #[default]
    Reject,
    /// Return `Ok(())` without touching the count or calling the driver.
    Ignore,
}

/// Runtime configuration for a [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Handling of closes with no outstanding opens.
    pub stale_close: ClosePolicy,
    /// Probe for a matching driver as part of `publish`.
    pub auto_bind: bool,
}

impl ManagerConfig {
    /// The default configuration: reject stale closes, bind on publish.
    pub const DEFAULT: Self = Self {
        stale_close: ClosePolicy::Reject,
        auto_bind: true,
    };

    /// Sets the stale-close policy.
    #[must_use]
    pub const fn with_stale_close(mut self, policy: ClosePolicy) -> Self {
        self.stale_close = policy;
        self
    }

    /// Enables or disables probing on publish.
    #[must_use]
    pub const fn with_auto_bind(mut self, auto_bind: bool) -> Self {
        self.auto_bind = auto_bind;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rejects_stale_close_and_auto_binds() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.stale_close, ClosePolicy::Reject);
        assert!(cfg.auto_bind);
        assert_eq!(cfg, ManagerConfig::DEFAULT);
    }

    #[test]
    fn setters_override_fields() {
        let cfg = ManagerConfig::DEFAULT
            .with_stale_close(ClosePolicy::Ignore)
            .with_auto_bind(false);
        assert_eq!(cfg.stale_close, ClosePolicy::Ignore);
        assert!(!cfg.auto_bind);
    }
}
