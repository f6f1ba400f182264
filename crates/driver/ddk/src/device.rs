//! The device node.
//!
//! A [`Device`] is created by the [`DeviceManager`](crate::DeviceManager),
//! filled in by its owning driver, then published into the tree. Clients
//! reach it through [`Device::open`], [`Device::close`] and
//! [`Device::get_protocol`], which forward to the driver's [`DeviceOps`].
//!
//! ## Lifetime
//!
//! `Arc<Device>` keeps the memory alive; the [`LifeCount`] decides when the
//! *driver-visible* release happens. The count holds outstanding opens plus
//! structural pins: one for the tree while the device is published, and one
//! on the parent for every published child. [`DeviceOps::release`] runs
//! exactly once, on whichever thread observes removal completed with a
//! zero count.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use ddk_core::{
    DeviceId, Drain, DriverId, LifeCount, LifeError, LifeSnapshot, ProtocolId, RemoteId, SetOnce,
    SignalObject, SpinLock,
};

use crate::abi::{DEVICE_MAGIC, DeviceName};
use crate::bind::DeviceProp;
use crate::config::ClosePolicy;
use crate::error::DeviceError;
use crate::protocol::{ProtocolRef, SecondaryProtocol, base_get_protocol};
use crate::state::DeviceState;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// Flags passed to [`Device::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
        /// Do not block in later operations.
        const NONBLOCK = 1 << 2;
        /// Request exclusive access; enforced by the driver, if at all.
        const EXCLUSIVE = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Snapshot of a device's lifecycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFlags: u32 {
        /// Linked into the tree.
        const PUBLISHED = 1 << 0;
        /// A driver is bound.
        const BOUND = 1 << 1;
        /// Removal has begun; new opens are refused.
        const REMOVING = 1 << 2;
        /// Removal has completed.
        const REMOVED = 1 << 3;
        /// The release has run (or is running).
        const RELEASED = 1 << 4;
    }
}

/// Coarse lifecycle stage of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLifecycle {
    /// Allocated; the owning driver is filling it in.
    Created,
    /// Linked into the tree and waiting for a driver.
    Published,
    /// A driver is bound.
    Bound,
    /// Removal has begun; the release has not run yet.
    Removing,
    /// The release has run.
    Released,
}

// ---------------------------------------------------------------------------
// Collaborator references
// ---------------------------------------------------------------------------

/// Opaque object held on behalf of an external collaborator.
pub type ExternalRef = Arc<dyn Any + Send + Sync>;

/// Bookkeeping reference to a peer-side representation of the device, such
/// as a connected client channel.
#[derive(Clone)]
pub struct RemoteRef {
    /// Peer identifier.
    pub id: RemoteId,
    /// Peer handle; never dereferenced by the device model.
    pub handle: ExternalRef,
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRef")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// DeviceOps
// ---------------------------------------------------------------------------

/// Driver-supplied operations of a device.
///
/// Calls may arrive concurrently from any thread. The device model only
/// guarantees refcount atomicity around them; drivers synchronize their own
/// state.
pub trait DeviceOps: Send + Sync {
    /// Resolves a protocol id. The default handles the base protocol plus
    /// the device's single secondary protocol; override to expose several.
    fn get_protocol(&self, dev: &Device, proto: ProtocolId) -> Result<ProtocolRef, DeviceError> {
        base_get_protocol(dev, proto)
    }

    /// Called after the open was counted. An error undoes the open.
    fn open(&self, dev: &Device, flags: OpenFlags) -> Result<(), DeviceError> {
        let _ = (dev, flags);
        Ok(())
    }

    /// Called for each close. The device cannot be released while this runs.
    fn close(&self, dev: &Device) -> Result<(), DeviceError> {
        let _ = dev;
        Ok(())
    }

    /// Called exactly once, after removal completed and the last reference
    /// was dropped. Free driver-private state here.
    fn release(&self, dev: &Device) {
        let _ = dev;
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// `bound` holds `driver + 1`; zero means unbound.
const UNBOUND: u64 = 0;

/// A node in the device tree.
pub struct Device {
    magic: usize,
    id: DeviceId,
    name: DeviceName,
    ops: Arc<dyn DeviceOps>,
    life: LifeCount,
    published: AtomicBool,
    driver_flags: AtomicU32,
    bound: AtomicU64,
    events: SpinLock<Option<Arc<dyn SignalObject>>>,
    remote: SpinLock<Option<RemoteRef>>,
    external: SpinLock<Option<ExternalRef>>,
    protocol: SetOnce<SecondaryProtocol>,
    props: SetOnce<Box<[DeviceProp]>>,
    owner: DriverId,
    parent: Option<DeviceId>,
    /// The parent, held from publish to release so its child pin can be
    /// returned.
    parent_pin: SpinLock<Option<Arc<Device>>>,
    close_policy: ClosePolicy,
}

/// Construction parameters; assembled by the manager.
pub(crate) struct DeviceInit {
    pub id: DeviceId,
    pub name: DeviceName,
    pub parent: Option<DeviceId>,
    pub owner: DriverId,
    pub ops: Arc<dyn DeviceOps>,
    pub events: Arc<dyn SignalObject>,
    pub close_policy: ClosePolicy,
}

impl Device {
    pub(crate) fn new(init: DeviceInit) -> Self {
        Self {
            magic: DEVICE_MAGIC,
            id: init.id,
            name: init.name,
            ops: init.ops,
            life: LifeCount::new(),
            published: AtomicBool::new(false),
            driver_flags: AtomicU32::new(0),
            bound: AtomicU64::new(UNBOUND),
            events: SpinLock::named("Device::events", Some(init.events)),
            remote: SpinLock::named("Device::remote", None),
            external: SpinLock::named("Device::external", None),
            protocol: SetOnce::new(),
            props: SetOnce::new(),
            owner: init.owner,
            parent: init.parent,
            parent_pin: SpinLock::named("Device::parent_pin", None),
            close_policy: init.close_policy,
        }
    }

    /// Checks the validity tag.
    ///
    /// # Panics
    ///
    /// Panics with [`DeviceError::Corruption`] if the tag does not match.
    /// Continuing with a corrupted device is never safe.
    #[inline]
    pub fn validate(&self) {
        if self.magic != DEVICE_MAGIC {
            corrupted(self);
        }
    }

    // -- identity -----------------------------------------------------------

    /// Returns the tree id.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Returns the device name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the fixed-layout name buffer.
    #[must_use]
    pub fn name_buf(&self) -> &DeviceName {
        &self.name
    }

    /// Returns the driver that created this device.
    #[must_use]
    pub fn owning_driver(&self) -> DriverId {
        self.owner
    }

    /// Returns the parent's id; `None` only for the root.
    #[must_use]
    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    /// Returns the currently bound driver.
    #[must_use]
    pub fn bound_driver(&self) -> Option<DriverId> {
        match self.bound.load(Ordering::Acquire) {
            UNBOUND => None,
            raw => u32::try_from(raw - 1).ok().map(DriverId::new),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Returns the lifecycle flags.
    #[must_use]
    pub fn flags(&self) -> DeviceFlags {
        let life = self.life.snapshot();
        let mut flags = DeviceFlags::empty();
        flags.set(DeviceFlags::PUBLISHED, self.published.load(Ordering::Acquire));
        flags.set(DeviceFlags::BOUND, self.bound_driver().is_some());
        flags.set(DeviceFlags::REMOVING, life.removing);
        flags.set(DeviceFlags::REMOVED, life.removed);
        flags.set(DeviceFlags::RELEASED, life.released);
        flags
    }

    /// Returns the current lifecycle stage.
    #[must_use]
    pub fn lifecycle(&self) -> DeviceLifecycle {
        let flags = self.flags();
        if flags.contains(DeviceFlags::RELEASED) {
            DeviceLifecycle::Released
        } else if flags.contains(DeviceFlags::REMOVING) {
            DeviceLifecycle::Removing
        } else if flags.contains(DeviceFlags::BOUND) {
            DeviceLifecycle::Bound
        } else if flags.contains(DeviceFlags::PUBLISHED) {
            DeviceLifecycle::Published
        } else {
            DeviceLifecycle::Created
        }
    }

    /// Returns the outstanding opens and pins.
    #[must_use]
    pub fn refs(&self) -> LifeSnapshot {
        self.life.snapshot()
    }

    /// Returns the driver-defined flag bits.
    #[must_use]
    pub fn driver_flags(&self) -> u32 {
        self.driver_flags.load(Ordering::Acquire)
    }

    /// Sets driver-defined flag bits.
    pub fn set_driver_flags(&self, bits: u32) {
        self.driver_flags.fetch_or(bits, Ordering::AcqRel);
    }

    /// Clears driver-defined flag bits.
    pub fn clear_driver_flags(&self, bits: u32) {
        self.driver_flags.fetch_and(!bits, Ordering::AcqRel);
    }

    // -- fill-then-publish fields -------------------------------------------

    /// Sets the secondary protocol. Allowed once, before publication.
    ///
    /// # Errors
    ///
    /// [`DeviceError::InvalidArgs`] for the base protocol id,
    /// [`DeviceError::AlreadyPublished`] after publication and
    /// [`DeviceError::BadState`] if a protocol was already set.
    pub fn set_protocol(&self, protocol: SecondaryProtocol) -> Result<(), DeviceError> {
        self.validate();
        if protocol.id == ProtocolId::DEVICE {
            return Err(DeviceError::InvalidArgs);
        }
        self.protocol
            .set(protocol)
            .map_err(|(_, err)| DeviceError::from(err))
    }

    /// Returns the secondary protocol, if set.
    #[must_use]
    pub fn secondary_protocol(&self) -> Option<&SecondaryProtocol> {
        self.protocol.get()
    }

    /// Sets the binding properties. Allowed once, before publication.
    ///
    /// # Errors
    ///
    /// Same as [`set_protocol`](Self::set_protocol), minus `InvalidArgs`.
    pub fn set_props(&self, props: &[DeviceProp]) -> Result<(), DeviceError> {
        self.validate();
        self.props
            .set(props.into())
            .map_err(|(_, err)| DeviceError::from(err))
    }

    /// Returns the declared binding properties.
    #[must_use]
    pub fn props(&self) -> &[DeviceProp] {
        match self.props.get() {
            Some(props) => props,
            None => &[],
        }
    }

    // -- dispatch -----------------------------------------------------------

    /// Resolves `proto` through the driver's [`DeviceOps::get_protocol`].
    ///
    /// The base protocol resolves for as long as the device is not released,
    /// including while removal is pending and opens are still draining. Once
    /// released, the driver's state is gone and every query fails.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] if the device does not implement it and
    /// [`DeviceError::BadState`] after release.
    pub fn get_protocol(&self, proto: ProtocolId) -> Result<ProtocolRef, DeviceError> {
        self.validate();
        if self.life.is_released() {
            return Err(DeviceError::BadState);
        }
        self.ops.get_protocol(self, proto)
    }

    /// Resolves `proto` and downcasts its operation table to `T`.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotSupported`] if the protocol is missing, is the base
    /// protocol, or carries a different type. [`DeviceError::BadState`]
    /// after release.
    pub fn protocol<T: Any + Send + Sync>(
        &self,
        proto: ProtocolId,
    ) -> Result<Arc<T>, DeviceError> {
        self.get_protocol(proto)?
            .downcast::<T>()
            .ok_or(DeviceError::NotSupported)
    }

    /// Opens the device.
    ///
    /// # Errors
    ///
    /// [`DeviceError::BadState`] once removal has begun, or whatever the
    /// driver's `open` returned.
    pub fn open(&self, flags: OpenFlags) -> Result<(), DeviceError> {
        self.validate();
        self.life.acquire_open().map_err(|err| {
            log::debug!("device {}: open refused: {}", self.name, err);
            DeviceError::from(err)
        })?;

        if let Err(err) = self.ops.open(self, flags) {
            // The open taken above is still outstanding, so the rollback
            // cannot fail; it may however be the last reference.
            let drain = self.life.cancel_open()?;
            self.settle(drain);
            return Err(err);
        }
        Ok(())
    }

    /// Closes one open.
    ///
    /// Runs the release if this drops the last reference of a removed
    /// device. A close without an outstanding open follows the configured
    /// [`ClosePolicy`].
    ///
    /// # Errors
    ///
    /// [`DeviceError::BadState`] for a stale close under
    /// [`ClosePolicy::Reject`], or whatever the driver's `close` returned.
    pub fn close(&self) -> Result<(), DeviceError> {
        self.validate();
        match self.life.begin_close() {
            Ok(()) => {}
            Err(LifeError::NoOpens) => {
                return match self.close_policy {
                    ClosePolicy::Reject => {
                        log::warn!("device {}: close without an open", self.name);
                        Err(DeviceError::BadState)
                    }
                    ClosePolicy::Ignore => Ok(()),
                };
            }
            Err(err) => return Err(err.into()),
        }

        let result = self.ops.close(self);
        self.settle(self.life.unpin());
        result
    }

    // -- state signaling ----------------------------------------------------

    /// Sets and clears readiness bits in one atomic step.
    ///
    /// # Errors
    ///
    /// [`DeviceError::BadState`] after release, when the readiness handle
    /// is gone.
    pub fn set_state(&self, set: DeviceState, clear: DeviceState) -> Result<(), DeviceError> {
        self.validate();
        let events = self.events.lock().clone().ok_or(DeviceError::BadState)?;
        events.signal(set.to_signals(), clear.to_signals())?;
        Ok(())
    }

    /// Asserts readiness bits.
    ///
    /// # Errors
    ///
    /// See [`set_state`](Self::set_state).
    pub fn state_set(&self, set: DeviceState) -> Result<(), DeviceError> {
        self.set_state(set, DeviceState::empty())
    }

    /// Deasserts readiness bits.
    ///
    /// # Errors
    ///
    /// See [`set_state`](Self::set_state).
    pub fn state_clear(&self, clear: DeviceState) -> Result<(), DeviceError> {
        self.set_state(DeviceState::empty(), clear)
    }

    /// Returns the current readiness bits; empty after release.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.validate();
        let events = self.events.lock().clone();
        events.map_or(DeviceState::empty(), |events| {
            DeviceState::from_signals(events.observe())
        })
    }

    /// Returns the readiness handle, until release.
    #[must_use]
    pub fn readiness_handle(&self) -> Option<Arc<dyn SignalObject>> {
        self.events.lock().clone()
    }

    // -- collaborator references --------------------------------------------

    /// Stores the peer-side reference, returning the previous one.
    ///
    /// # Errors
    ///
    /// [`DeviceError::BadState`] after release.
    pub fn set_remote(&self, remote: RemoteRef) -> Result<Option<RemoteRef>, DeviceError> {
        // Checked under the lock the release takes, so a racing release
        // either sees this store or refuses it.
        let mut slot = self.remote.lock();
        if self.life.is_released() {
            return Err(DeviceError::BadState);
        }
        Ok(slot.replace(remote))
    }

    /// Removes the peer-side reference.
    pub fn take_remote(&self) -> Option<RemoteRef> {
        self.remote.lock().take()
    }

    /// Returns the peer identifier, if a peer reference is stored.
    #[must_use]
    pub fn remote_id(&self) -> Option<RemoteId> {
        self.remote.lock().as_ref().map(|remote| remote.id)
    }

    /// Associates an external representation, returning the previous one.
    ///
    /// # Errors
    ///
    /// [`DeviceError::BadState`] after release.
    pub fn attach_external(
        &self,
        external: ExternalRef,
    ) -> Result<Option<ExternalRef>, DeviceError> {
        let mut slot = self.external.lock();
        if self.life.is_released() {
            return Err(DeviceError::BadState);
        }
        Ok(slot.replace(external))
    }

    /// Clears the external representation.
    pub fn detach_external(&self) -> Option<ExternalRef> {
        self.external.lock().take()
    }

    /// Returns the external representation.
    #[must_use]
    pub fn external(&self) -> Option<ExternalRef> {
        self.external.lock().clone()
    }

    // -- manager hooks ------------------------------------------------------

    /// Takes the tree's pin and, for a child, the pin on its parent, then
    /// freezes the fill-then-publish fields. Called under the tree lock.
    pub(crate) fn mark_published(&self, parent: Option<&Arc<Device>>) -> Result<(), DeviceError> {
        if let Some(parent) = parent {
            parent.life.pin()?;
        }
        if let Err(err) = self.life.pin() {
            if let Some(parent) = parent {
                parent.settle(parent.life.unpin());
            }
            return Err(err.into());
        }

        self.protocol.seal();
        self.props.seal();
        *self.parent_pin.lock() = parent.cloned();
        self.published.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn set_bound(&self, driver: Option<DriverId>) {
        let raw = driver.map_or(UNBOUND, |d| u64::from(d.as_u32()) + 1);
        self.bound.store(raw, Ordering::Release);
    }

    /// Flips `REMOVING`. Returns `true` for the first caller.
    pub(crate) fn begin_removal(&self) -> bool {
        self.life.begin_removal()
    }

    /// Completes removal, dropping the tree pin if the device was published,
    /// and runs the release if nothing else holds a reference.
    pub(crate) fn finish_removal(&self, published: bool) {
        self.settle(self.life.finish_removal(published));
    }

    fn settle(&self, drain: Drain) {
        if drain == Drain::Release {
            self.release();
        }
    }

    fn release(&self) {
        log::debug!("device {} ({}): released", self.name, self.id);
        self.ops.release(self);

        let events = self.events.lock().take();
        let remote = self.remote.lock().take();
        let external = self.external.lock().take();
        drop((events, remote, external));

        let parent = self.parent_pin.lock().take();
        if let Some(parent) = parent {
            parent.settle(parent.life.unpin());
        }
    }
}

#[cold]
fn corrupted(dev: &Device) -> ! {
    panic!("device at {:p}: {}", dev, DeviceError::Corruption)
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .field("refs", &self.life)
            .finish_non_exhaustive()
    }
}
