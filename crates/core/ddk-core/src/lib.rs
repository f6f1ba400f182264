//! Core types and synchronization primitives for the driver development kit.
//!
//! This crate holds the host-testable pieces the device model in `ddk` is
//! built from: typed identifiers, a spin lock, a write-once cell, the packed
//! lifecycle counter that decides when a device is released, and the
//! abstraction over the kernel signal primitive.
//!
//! Everything here is `no_std` + `alloc` so it can be linked into a kernel,
//! and tested with `cargo test` and loom on the host.

#![cfg_attr(not(any(test, loom)), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cell;
pub mod id;
pub mod life;
pub mod signal;
pub mod sync;

pub use cell::{SetOnce, SetOnceError};
pub use id::{DeviceId, DriverId, ProtocolId, RemoteId};
pub use life::{Drain, LifeCount, LifeError, LifeSnapshot};
pub use signal::{EventObject, LocalEvents, SignalError, SignalFactory, SignalObject, Signals};
pub use sync::{SpinLock, SpinLockGuard};
