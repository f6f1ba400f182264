//! The binding and lifecycle manager.
//!
//! [`DeviceManager`] is the only writer of tree linkage, bound drivers and
//! lifecycle flags. Every tree mutation happens under one
//! [`SpinLock<DeviceTree>`]; driver callbacks ([`Driver::bind`],
//! [`Driver::unbind`], [`DeviceOps`]) always run after that lock is dropped,
//! so drivers may call back into the manager from them.
//!
//! Opens and closes never touch the tree lock: they go straight to the
//! device's lifecycle counter.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ddk_core::{DeviceId, DriverId, SignalFactory, SpinLock};

use crate::abi::DeviceName;
use crate::bind::{BIND_PROTOCOL, BindMatcher, DeviceProp};
use crate::config::ManagerConfig;
use crate::device::{Device, DeviceInit, DeviceOps};
use crate::driver::Driver;
use crate::error::DeviceError;
use crate::path::DevicePath;
use crate::state::DeviceState;
use crate::tree::{Detached, DeviceTree};

/// Base operations of the root device.
struct RootOps;

impl DeviceOps for RootOps {}

/// Owner of the device tree and the driver registry.
pub struct DeviceManager {
    config: ManagerConfig,
    events: Arc<dyn SignalFactory>,
    matcher: Arc<dyn BindMatcher>,
    tree: SpinLock<DeviceTree>,
    drivers: SpinLock<Vec<Arc<dyn Driver>>>,
    root: Arc<Device>,
}

impl DeviceManager {
    /// Creates a manager with a published root device named `root`, bound
    /// to [`DriverId::MANAGER`].
    ///
    /// # Errors
    ///
    /// [`DeviceError::NoResources`] if the root's readiness handle cannot be
    /// created.
    pub fn new(
        config: ManagerConfig,
        events: Arc<dyn SignalFactory>,
        matcher: Arc<dyn BindMatcher>,
    ) -> Result<Self, DeviceError> {
        let handle = events.create()?;
        let mut tree = DeviceTree::new();
        let mut root = None;
        let id = tree.insert(None, |id| {
            let dev = Arc::new(Device::new(DeviceInit {
                id,
                name: DeviceName::new("root"),
                parent: None,
                owner: DriverId::MANAGER,
                ops: Arc::new(RootOps),
                events: handle,
                close_policy: config.stale_close,
            }));
            root = Some(Arc::clone(&dev));
            dev
        })?;
        tree.publish(id)?;
        tree.bind(id, DriverId::MANAGER)?;
        let root = root.ok_or(DeviceError::BadState)?;

        log::info!("devmgr: root device {} ready", id);
        Ok(Self {
            config,
            events,
            matcher,
            tree: SpinLock::named("DeviceManager::tree", tree),
            drivers: SpinLock::named("DeviceManager::drivers", Vec::new()),
            root,
        })
    }

    /// Returns the configuration given at construction.
    #[must_use]
    pub fn config(&self) -> ManagerConfig {
        self.config
    }

    /// Returns the root device.
    #[must_use]
    pub fn root(&self) -> &Arc<Device> {
        &self.root
    }

    // -----------------------------------------------------------------------
    // Drivers
    // -----------------------------------------------------------------------

    /// Registers a driver. Ids are handed out sequentially from 1; 0 is
    /// [`DriverId::MANAGER`].
    pub fn register_driver(&self, driver: Arc<dyn Driver>) -> DriverId {
        let info = driver.info();
        let mut drivers = self.drivers.lock();
        drivers.push(driver);
        // The registry cannot outgrow u32 before allocation fails.
        let id = DriverId::new(u32::try_from(drivers.len()).unwrap_or(u32::MAX));
        drop(drivers);

        log::info!("devmgr: registered driver '{}' as {}", info.name, id);
        id
    }

    /// Returns a registered driver.
    #[must_use]
    pub fn driver(&self, id: DriverId) -> Option<Arc<dyn Driver>> {
        let index = usize::try_from(id.as_u32()).ok()?.checked_sub(1)?;
        self.drivers.lock().get(index).cloned()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Creates a device under `parent` on behalf of `driver`.
    ///
    /// The device is in the created state: the driver fills in properties
    /// and its secondary protocol, then calls [`publish`](Self::publish).
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] for an unknown parent,
    /// [`DeviceError::BadState`] if the parent is being removed and
    /// [`DeviceError::NoResources`] if no readiness handle is available.
    pub fn create(
        &self,
        parent: DeviceId,
        name: &str,
        driver: DriverId,
        ops: Arc<dyn DeviceOps>,
    ) -> Result<Arc<Device>, DeviceError> {
        if DeviceName::truncates(name) {
            log::warn!("devmgr: device name '{}' truncated", name);
        }
        let events = self.events.create()?;

        let mut created = None;
        let id = self.tree.lock().insert(Some(parent), |id| {
            let dev = Arc::new(Device::new(DeviceInit {
                id,
                name: DeviceName::new(name),
                parent: Some(parent),
                owner: driver,
                ops,
                events,
                close_policy: self.config.stale_close,
            }));
            created = Some(Arc::clone(&dev));
            dev
        })?;

        log::debug!("devmgr: created {} under {}", id, parent);
        created.ok_or(DeviceError::BadState)
    }

    /// Links a created device into the tree and the unmatched index.
    ///
    /// With [`ManagerConfig::auto_bind`] set, the device is probed right
    /// away; a driver refusing it is logged and leaves it unmatched.
    ///
    /// # Errors
    ///
    /// See [`DeviceTree::publish`].
    pub fn publish(&self, id: DeviceId) -> Result<(), DeviceError> {
        self.tree.lock().publish(id).inspect_err(|err| {
            log::warn!("devmgr: publish {} failed: {}", id, err);
        })?;
        log::info!("devmgr: published {}", id);

        if self.config.auto_bind {
            if let Err(err) = self.probe(id) {
                log::warn!("devmgr: probe of {} failed: {}", id, err);
            }
        }
        Ok(())
    }

    /// Binds `driver` to a published, unmatched device and calls
    /// [`Driver::bind`]. If the driver refuses, the device returns to the
    /// unmatched index and the driver's error is returned.
    ///
    /// The assignment is visible before [`Driver::bind`] runs, so an unbind
    /// or removal from another thread may reach the driver first. In that
    /// case the binding no longer holds when the hook returns, and this
    /// reports [`DeviceError::BadState`]; the driver has already seen its
    /// [`Driver::unbind`].
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] for an unknown device or driver,
    /// [`DeviceError::AlreadyBound`], [`DeviceError::BadState`], or the
    /// driver's own error.
    pub fn bind(&self, id: DeviceId, driver: DriverId) -> Result<(), DeviceError> {
        let hooks = if driver == DriverId::MANAGER {
            None
        } else {
            Some(self.driver(driver).ok_or(DeviceError::NotFound)?)
        };

        let dev = self.tree.with(|tree| -> Result<Arc<Device>, DeviceError> {
            tree.bind(id, driver)?;
            tree.device(id).cloned().ok_or(DeviceError::NotFound)
        });
        let dev = dev.inspect_err(|err| {
            log::warn!("devmgr: bind {} to {} failed: {}", id, driver, err);
        })?;

        if let Some(hooks) = hooks {
            if let Err(err) = hooks.bind(&dev) {
                log::warn!(
                    "devmgr: driver '{}' refused {}: {}",
                    hooks.info().name,
                    id,
                    err
                );
                // Only undo our own assignment: the device may have been
                // removed, or unbound and handed to another driver, meanwhile.
                let undone = self.tree.lock().unbind_if(id, driver).unwrap_or(false);
                if !undone {
                    log::debug!("devmgr: {} no longer bound to {}", id, driver);
                }
                return Err(err);
            }

            if self.tree.lock().bound_driver(id) != Some(driver) {
                log::warn!(
                    "devmgr: {} lost its binding to '{}' during bind",
                    id,
                    hooks.info().name
                );
                return Err(DeviceError::BadState);
            }
        }

        log::info!("devmgr: bound {} to {}", id, driver);
        Ok(())
    }

    /// Detaches the bound driver and returns the device to the unmatched
    /// index, then calls [`Driver::unbind`].
    ///
    /// # Errors
    ///
    /// See [`DeviceTree::unbind`].
    pub fn unbind(&self, id: DeviceId) -> Result<(), DeviceError> {
        let (driver, dev) = self.tree.with(|tree| -> Result<_, DeviceError> {
            let driver = tree.unbind(id)?;
            let dev = tree.device(id).cloned().ok_or(DeviceError::NotFound)?;
            Ok((driver, dev))
        })?;

        log::info!("devmgr: unbound {} from {}", id, driver);
        if let Some(hooks) = self.driver(driver) {
            hooks.unbind(&dev);
        }
        Ok(())
    }

    /// Removes a device and its subtree.
    ///
    /// Children are finished before their parents: each one is signalled
    /// [`DeviceState::ERROR`] (clearing readable and writable), its bound
    /// driver is told to unbind, and its removal is completed, which runs
    /// the release at once if nothing holds it open. Removing a stale id is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// [`DeviceError::BadState`] for the root.
    pub fn remove(&self, id: DeviceId) -> Result<(), DeviceError> {
        let detached = self.tree.lock().remove(id)?;
        if detached.is_empty() {
            log::trace!("devmgr: remove {}: already gone", id);
            return Ok(());
        }

        log::info!("devmgr: removing {} ({} devices)", id, detached.len());
        for node in detached {
            self.finish_removal(node);
        }
        Ok(())
    }

    fn finish_removal(&self, node: Detached) {
        let Detached {
            device,
            published,
            bound,
        } = node;

        if let Err(err) = device.set_state(
            DeviceState::ERROR,
            DeviceState::READABLE | DeviceState::WRITABLE,
        ) {
            log::warn!("devmgr: signalling removal of {}: {}", device.id(), err);
        }
        if let Some(hooks) = bound.and_then(|driver| self.driver(driver)) {
            hooks.unbind(&device);
        }
        device.finish_removal(published);
    }

    // -----------------------------------------------------------------------
    // Matching
    // -----------------------------------------------------------------------

    /// Asks the matcher for a driver for `id` and binds it.
    ///
    /// Returns the bound driver, or `None` if nothing matched.
    ///
    /// # Errors
    ///
    /// [`DeviceError::AlreadyBound`] if a driver is already bound, or any
    /// error from [`bind`](Self::bind).
    pub fn probe(&self, id: DeviceId) -> Result<Option<DriverId>, DeviceError> {
        let dev = self.tree.with(|tree| -> Result<Arc<Device>, DeviceError> {
            let dev = tree.device(id).cloned().ok_or(DeviceError::NotFound)?;
            if tree.bound_driver(id).is_some() {
                return Err(DeviceError::AlreadyBound);
            }
            if !tree.is_published(id) {
                return Err(DeviceError::BadState);
            }
            Ok(dev)
        })?;

        let props = effective_props(&dev);
        let Some(driver) = self.matcher.match_props(&props) else {
            log::debug!("devmgr: no driver for {} ({})", id, dev.name());
            return Ok(None);
        };

        self.bind(id, driver)?;
        Ok(Some(driver))
    }

    /// Probes every device in the unmatched index. Returns how many were
    /// bound.
    pub fn probe_all(&self) -> usize {
        let pending: Vec<DeviceId> = self.tree.lock().unmatched().to_vec();
        let mut bound = 0;
        for id in pending {
            match self.probe(id) {
                Ok(Some(_)) => bound += 1,
                Ok(None) => {}
                Err(err) => log::debug!("devmgr: probe of {} skipped: {}", id, err),
            }
        }
        bound
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Runs `f` with shared access to the tree. Do not call back into the
    /// manager from `f`.
    pub fn with_tree<R>(&self, f: impl FnOnce(&DeviceTree) -> R) -> R {
        self.tree.with(|tree| f(tree))
    }

    /// Returns the live device for `id`.
    #[must_use]
    pub fn device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.tree.lock().device(id).cloned()
    }

    /// Returns the published children of `id`.
    #[must_use]
    pub fn children(&self, id: DeviceId) -> Vec<DeviceId> {
        self.tree
            .lock()
            .children(id)
            .map(<[DeviceId]>::to_vec)
            .unwrap_or_default()
    }

    /// Returns a snapshot of the unmatched index.
    #[must_use]
    pub fn unmatched(&self) -> Vec<DeviceId> {
        self.tree.lock().unmatched().to_vec()
    }

    /// Returns `true` if `id` is published and unbound.
    #[must_use]
    pub fn is_unmatched(&self, id: DeviceId) -> bool {
        self.tree.lock().is_unmatched(id)
    }

    /// Returns the driver bound to `id`.
    #[must_use]
    pub fn bound_driver(&self, id: DeviceId) -> Option<DriverId> {
        self.tree.lock().bound_driver(id)
    }

    /// Returns the path of `id` from the root.
    #[must_use]
    pub fn path(&self, id: DeviceId) -> Option<DevicePath> {
        self.tree.lock().path(id)
    }

    /// Returns the number of live devices, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.lock().len()
    }

    /// Always `false`: the root is never removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.lock().is_empty()
    }
}

/// Declared properties plus `BIND_PROTOCOL` from the secondary protocol when
/// the device does not declare it.
fn effective_props(dev: &Device) -> Vec<DeviceProp> {
    let mut props = dev.props().to_vec();
    let declared = props.iter().any(|prop| prop.id == BIND_PROTOCOL);
    if !declared {
        if let Some(secondary) = dev.secondary_protocol() {
            props.push(DeviceProp::new(BIND_PROTOCOL, secondary.id.as_u32()));
        }
    }
    props
}
