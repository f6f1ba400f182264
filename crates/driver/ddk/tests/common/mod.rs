//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ddk::{
    BindMatcher, ClosePolicy, Device, DeviceError, DeviceManager, DeviceOps, Driver, DriverInfo,
    ManagerConfig, OpenFlags, RuleMatcher,
};
use ddk_core::LocalEvents;

/// Device operations that count every callback.
#[derive(Default)]
pub struct CountingOps {
    pub opens: AtomicU32,
    pub closes: AtomicU32,
    pub releases: AtomicU32,
    pub refuse_open: AtomicBool,
}

impl CountingOps {
    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }
}

impl DeviceOps for CountingOps {
    fn open(&self, _dev: &Device, _flags: OpenFlags) -> Result<(), DeviceError> {
        if self.refuse_open.load(Ordering::SeqCst) {
            return Err(DeviceError::BadState);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, _dev: &Device) -> Result<(), DeviceError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, _dev: &Device) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// A driver that records bind/unbind calls by device name.
#[derive(Default)]
pub struct RecordingDriver {
    pub name: &'static str,
    pub refuse: AtomicBool,
    pub bound: Mutex<Vec<String>>,
    pub unbound: Mutex<Vec<String>>,
}

impl RecordingDriver {
    pub fn named(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            ..Self::default()
        })
    }

    pub fn bound(&self) -> Vec<String> {
        self.bound.lock().unwrap().clone()
    }

    pub fn unbound(&self) -> Vec<String> {
        self.unbound.lock().unwrap().clone()
    }
}

impl Driver for RecordingDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            name: self.name,
            description: "test driver",
        }
    }

    fn bind(&self, dev: &Arc<Device>) -> Result<(), DeviceError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DeviceError::NotSupported);
        }
        self.bound.lock().unwrap().push(dev.name().to_owned());
        Ok(())
    }

    fn unbind(&self, dev: &Arc<Device>) {
        self.unbound.lock().unwrap().push(dev.name().to_owned());
    }
}

/// A manager with local events, the given matcher and auto-bind off.
pub fn manager_with(matcher: Arc<dyn BindMatcher>, policy: ClosePolicy) -> DeviceManager {
    let config = ManagerConfig::DEFAULT
        .with_auto_bind(false)
        .with_stale_close(policy);
    DeviceManager::new(config, Arc::new(LocalEvents), matcher).unwrap()
}

/// A manager with no binding rules and auto-bind off.
pub fn manager() -> DeviceManager {
    manager_with(Arc::new(RuleMatcher::new()), ClosePolicy::Reject)
}

/// Creates and publishes a child of the root owned by driver 0.
pub fn published_child(mgr: &DeviceManager, name: &str, ops: Arc<CountingOps>) -> Arc<Device> {
    let dev = mgr
        .create(mgr.root().id(), name, ddk::DriverId::MANAGER, ops)
        .unwrap();
    mgr.publish(dev.id()).unwrap();
    dev
}
