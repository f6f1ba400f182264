//! Synchronization primitives for the device model.
//!
//! Provides [`SpinLock`], suitable for `static` items and usable before any
//! scheduler is available. The device tree lock and per-device bookkeeping
//! slots are built on it.

mod spinlock;

pub(crate) mod loom_compat;

pub use spinlock::{SpinLock, SpinLockGuard};
