//! Loom compatibility shim.
//!
//! When compiled with `cfg(loom)`, re-exports loom's atomics so that the
//! lifecycle counter can be model-checked under loom's deterministic
//! scheduler without code changes. Otherwise, re-exports
//! `core::sync::atomic`.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU64, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicU64, Ordering};
