//! Device properties and driver matching.
//!
//! A published device carries an ordered list of [`DeviceProp`] key/value
//! pairs. The manager hands that list to a [`BindMatcher`], which names at
//! most one driver to bind. [`RuleMatcher`] is the in-tree matcher: drivers
//! register [`BindRule`]s, each a set of key/value conditions that must all
//! hold. A key the rule does not mention matches anything.

use alloc::vec::Vec;

use ddk_core::{DriverId, SpinLock};

// ---------------------------------------------------------------------------
// Property keys
// ---------------------------------------------------------------------------

/// Protocol id the device exposes. Added implicitly from the secondary
/// protocol when the device does not declare it.
pub const BIND_PROTOCOL: u16 = 0x0001;

/// PCI vendor id.
pub const BIND_PCI_VID: u16 = 0x0100;
/// PCI device id.
pub const BIND_PCI_DID: u16 = 0x0101;
/// PCI class code.
pub const BIND_PCI_CLASS: u16 = 0x0102;
/// PCI subclass.
pub const BIND_PCI_SUBCLASS: u16 = 0x0103;
/// PCI programming interface.
pub const BIND_PCI_INTERFACE: u16 = 0x0104;
/// PCI revision id.
pub const BIND_PCI_REVISION: u16 = 0x0105;

/// USB vendor id.
pub const BIND_USB_VID: u16 = 0x0200;
/// USB product id.
pub const BIND_USB_PID: u16 = 0x0201;
/// USB class.
pub const BIND_USB_CLASS: u16 = 0x0202;
/// USB subclass.
pub const BIND_USB_SUBCLASS: u16 = 0x0203;
/// USB protocol.
pub const BIND_USB_PROTOCOL: u16 = 0x0204;

/// Platform device vendor id.
pub const BIND_PLATFORM_VID: u16 = 0x0300;
/// Platform device product id.
pub const BIND_PLATFORM_PID: u16 = 0x0301;

// ---------------------------------------------------------------------------
// DeviceProp
// ---------------------------------------------------------------------------

/// One key/value pair consulted by the matcher.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceProp {
    /// Property key (`BIND_*`).
    pub id: u16,
    /// Property value.
    pub value: u32,
}

impl DeviceProp {
    /// Creates a property.
    #[must_use]
    pub const fn new(id: u16, value: u32) -> Self {
        Self { id, value }
    }
}

/// Decides which driver, if any, should bind a device.
pub trait BindMatcher: Send + Sync {
    /// Returns the driver to bind a device with `props`, or `None`.
    fn match_props(&self, props: &[DeviceProp]) -> Option<DriverId>;
}

// ---------------------------------------------------------------------------
// BindRule
// ---------------------------------------------------------------------------

/// A driver's claim on devices whose properties meet every condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRule {
    driver: DriverId,
    conditions: Vec<DeviceProp>,
}

impl BindRule {
    /// Creates a rule with no conditions; it matches every device.
    #[must_use]
    pub fn new(driver: DriverId) -> Self {
        Self {
            driver,
            conditions: Vec::new(),
        }
    }

    /// Adds the condition `key == value`.
    #[must_use]
    pub fn require(mut self, key: u16, value: u32) -> Self {
        self.conditions.push(DeviceProp::new(key, value));
        self
    }

    /// Returns the driver this rule binds.
    #[must_use]
    pub fn driver(&self) -> DriverId {
        self.driver
    }

    /// Returns the number of conditions; more conditions is more specific.
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.conditions.len()
    }

    /// Returns `true` if every condition is met by some property in `props`.
    #[must_use]
    pub fn matches(&self, props: &[DeviceProp]) -> bool {
        self.conditions.iter().all(|cond| {
            props
                .iter()
                .any(|prop| prop.id == cond.id && prop.value == cond.value)
        })
    }
}

// ---------------------------------------------------------------------------
// RuleMatcher
// ---------------------------------------------------------------------------

/// Table-driven [`BindMatcher`].
///
/// The matching rule with the most conditions wins. Among equally specific
/// rules the one registered first wins; drivers should not rely on that.
pub struct RuleMatcher {
    rules: SpinLock<Vec<BindRule>>,
}

impl RuleMatcher {
    /// Creates a matcher with no rules.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rules: SpinLock::named("RuleMatcher", Vec::new()),
        }
    }

    /// Appends a rule.
    pub fn add_rule(&self, rule: BindRule) {
        log::debug!(
            "RuleMatcher: {} conditions -> {}",
            rule.specificity(),
            rule.driver()
        );
        self.rules.lock().push(rule);
    }

    /// Drops every rule naming `driver`. Returns how many were removed.
    pub fn remove_driver(&self, driver: DriverId) -> usize {
        let mut rules = self.rules.lock();
        let before = rules.len();
        rules.retain(|rule| rule.driver != driver);
        before - rules.len()
    }

    /// Returns the number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    /// Returns `true` if no rules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RuleMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl BindMatcher for RuleMatcher {
    fn match_props(&self, props: &[DeviceProp]) -> Option<DriverId> {
        let rules = self.rules.lock();
        let mut best: Option<&BindRule> = None;
        for rule in rules.iter().filter(|rule| rule.matches(props)) {
            // Strictly greater: the earliest rule keeps a tie.
            if best.is_none_or(|b| rule.specificity() > b.specificity()) {
                best = Some(rule);
            }
        }
        best.map(BindRule::driver)
    }
}
