//! Driver development kit: the device object model.
//!
//! Devices form a tree rooted at the manager's `root` device. Each device
//! goes through a fixed lifecycle:
//!
//! ```text
//! Created --publish--> Published --bind--> Bound <--> operated
//!                          ^                 |
//!                          +-----unbind------+
//! any published stage --remove--> Removing --last reference--> Released
//! ```
//!
//! - [`DeviceManager`] owns the [`DeviceTree`] and is the only code that
//!   links, binds, unbinds or removes devices.
//! - [`Device`] is what drivers and clients hold. Opens and closes are
//!   counted atomically without taking the tree lock.
//! - [`DeviceOps`] is the driver's capability trait; protocols beyond the
//!   base device protocol are reached through [`Device::get_protocol`].
//! - [`BindMatcher`] decides which [`Driver`] binds a published device.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod abi;
pub mod bind;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod manager;
pub mod path;
pub mod protocol;
pub mod state;
pub mod tree;

pub use abi::{DEVICE_MAGIC, DEVICE_NAME_MAX, DeviceName};
pub use bind::{BindMatcher, BindRule, DeviceProp, RuleMatcher};
pub use config::{ClosePolicy, ManagerConfig};
pub use device::{
    Device, DeviceFlags, DeviceLifecycle, DeviceOps, ExternalRef, OpenFlags, RemoteRef,
};
pub use driver::{Driver, DriverInfo};
pub use error::DeviceError;
pub use manager::DeviceManager;
pub use path::DevicePath;
pub use protocol::{ProtocolOps, ProtocolRef, SecondaryProtocol, base_get_protocol};
pub use state::DeviceState;
pub use tree::{Detached, DeviceTree};

pub use ddk_core::{DeviceId, DriverId, ProtocolId, RemoteId, Signals};
