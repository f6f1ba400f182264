//! The device tree and the unmatched index.
//!
//! Devices live in an arena of slots addressed by [`DeviceId`]s. Each id
//! carries the generation of its slot; freeing a slot bumps the generation,
//! so an id kept past removal never resolves to a later occupant. Parent and
//! child relations are ids, not references.
//!
//! The tree itself is not synchronized. The
//! [`DeviceManager`](crate::DeviceManager) owns it behind one lock and is
//! the only code that mutates it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ddk_core::{DeviceId, DriverId};

use crate::device::{Device, DeviceFlags};
use crate::error::DeviceError;
use crate::path::DevicePath;

/// Per-device tree bookkeeping.
struct Node {
    device: Arc<Device>,
    parent: Option<DeviceId>,
    children: Vec<DeviceId>,
    published: bool,
    bound: Option<DriverId>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// A device taken out of the tree by [`DeviceTree::remove`].
///
/// The device is already marked as removing; the caller finishes removal
/// once it has dropped the tree lock.
#[derive(Debug)]
pub struct Detached {
    /// The removed device.
    pub device: Arc<Device>,
    /// Whether the tree held a pin on it.
    pub published: bool,
    /// The driver bound at the time of removal.
    pub bound: Option<DriverId>,
}

/// Arena of device nodes plus the ordered unmatched index.
#[derive(Default)]
pub struct DeviceTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    unmatched: Vec<DeviceId>,
    root: Option<DeviceId>,
    live: usize,
}

impl DeviceTree {
    /// Creates an empty tree.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            unmatched: Vec::new(),
            root: None,
            live: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocates a slot and stores the device built by `build` for the new id.
    ///
    /// The device starts unpublished. `parent` must be a live device that is
    /// not being removed; `None` creates the root, which may exist only once.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] for an unknown parent,
    /// [`DeviceError::BadState`] for a parent under removal and
    /// [`DeviceError::InvalidArgs`] for a second root.
    pub fn insert(
        &mut self,
        parent: Option<DeviceId>,
        build: impl FnOnce(DeviceId) -> Arc<Device>,
    ) -> Result<DeviceId, DeviceError> {
        match parent {
            Some(parent) => {
                let parent = self.node(parent).ok_or(DeviceError::NotFound)?;
                if parent.device.flags().contains(DeviceFlags::REMOVING) {
                    return Err(DeviceError::BadState);
                }
            }
            None if self.root.is_some() => return Err(DeviceError::InvalidArgs),
            None => {}
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| DeviceError::NoResources)?;
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = DeviceId::new(index, slot.generation);
        slot.node = Some(Node {
            device: build(id),
            parent,
            children: Vec::new(),
            published: false,
            bound: None,
        });
        self.live += 1;
        if parent.is_none() {
            self.root = Some(id);
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle transitions
    // -----------------------------------------------------------------------

    /// Links a created device under its parent and into the unmatched index.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] for a stale id,
    /// [`DeviceError::AlreadyPublished`] on the second call and
    /// [`DeviceError::BadState`] if the device or its parent is being
    /// removed, or the parent is not published.
    pub fn publish(&mut self, id: DeviceId) -> Result<(), DeviceError> {
        let node = self.node(id).ok_or(DeviceError::NotFound)?;
        if node.published {
            return Err(DeviceError::AlreadyPublished);
        }
        let device = Arc::clone(&node.device);

        let parent = match node.parent {
            Some(parent_id) => {
                let parent = self.node(parent_id).ok_or(DeviceError::BadState)?;
                if !parent.published {
                    return Err(DeviceError::BadState);
                }
                Some(Arc::clone(&parent.device))
            }
            None => None,
        };

        // Fails if either device is being removed.
        device.mark_published(parent.as_ref())?;

        if let Some(parent) = &parent {
            if let Some(parent) = self.node_mut(parent.id()) {
                parent.children.push(id);
            }
        }
        if let Some(node) = self.node_mut(id) {
            node.published = true;
        }
        self.unmatched.push(id);
        Ok(())
    }

    /// Assigns `driver` to a published, unbound device.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] for a stale id,
    /// [`DeviceError::AlreadyBound`] if a driver is bound and
    /// [`DeviceError::BadState`] if unpublished or being removed.
    pub fn bind(&mut self, id: DeviceId, driver: DriverId) -> Result<(), DeviceError> {
        let node = self.node_mut(id).ok_or(DeviceError::NotFound)?;
        if node.bound.is_some() {
            return Err(DeviceError::AlreadyBound);
        }
        if !node.published || node.device.flags().contains(DeviceFlags::REMOVING) {
            return Err(DeviceError::BadState);
        }

        node.bound = Some(driver);
        node.device.set_bound(Some(driver));
        self.unmatched.retain(|&other| other != id);
        Ok(())
    }

    /// Clears the bound driver and returns the device to the unmatched
    /// index. Returns the driver that was bound.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] for a stale id and
    /// [`DeviceError::BadState`] if nothing is bound or the device is being
    /// removed.
    pub fn unbind(&mut self, id: DeviceId) -> Result<DriverId, DeviceError> {
        let node = self.node_mut(id).ok_or(DeviceError::NotFound)?;
        if node.device.flags().contains(DeviceFlags::REMOVING) {
            return Err(DeviceError::BadState);
        }
        let driver = node.bound.take().ok_or(DeviceError::BadState)?;

        node.device.set_bound(None);
        self.unmatched.push(id);
        Ok(driver)
    }

    /// Unbinds `id` only while it is still bound to `driver`.
    ///
    /// Returns `false`, changing nothing, if the device was removed or is
    /// being removed, or if another driver (or none) is bound by now.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] for a stale id.
    pub fn unbind_if(&mut self, id: DeviceId, driver: DriverId) -> Result<bool, DeviceError> {
        let node = self.node_mut(id).ok_or(DeviceError::NotFound)?;
        if node.bound != Some(driver) || node.device.flags().contains(DeviceFlags::REMOVING) {
            return Ok(false);
        }

        node.bound = None;
        node.device.set_bound(None);
        self.unmatched.push(id);
        Ok(true)
    }

    /// Removes a device and its whole subtree.
    ///
    /// Returns the detached devices in post-order (children before their
    /// parent). Every one of them is marked as removing, unlinked from its
    /// parent and from the unmatched index, and its slot is freed. A stale
    /// id yields an empty list: removal is idempotent.
    ///
    /// # Errors
    ///
    /// [`DeviceError::BadState`] for the root.
    pub fn remove(&mut self, id: DeviceId) -> Result<Vec<Detached>, DeviceError> {
        if self.node(id).is_none() {
            return Ok(Vec::new());
        }
        if self.root == Some(id) {
            return Err(DeviceError::BadState);
        }

        let order = self.post_order(id);

        // Mark the whole subtree before unlinking anything.
        for &member in &order {
            if let Some(node) = self.node(member) {
                node.device.begin_removal();
            }
        }

        if let Some(parent) = self.node(id).and_then(|node| node.parent) {
            if let Some(parent) = self.node_mut(parent) {
                parent.children.retain(|&child| child != id);
            }
        }
        self.unmatched.retain(|member| !order.contains(member));

        let mut detached = Vec::with_capacity(order.len());
        for member in order {
            if let Some(node) = self.free_slot(member) {
                detached.push(Detached {
                    device: node.device,
                    published: node.published,
                    bound: node.bound,
                });
            }
        }
        Ok(detached)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Returns the root's id.
    #[must_use]
    pub fn root(&self) -> Option<DeviceId> {
        self.root
    }

    /// Returns the live device for `id`.
    #[must_use]
    pub fn device(&self, id: DeviceId) -> Option<&Arc<Device>> {
        self.node(id).map(|node| &node.device)
    }

    /// Returns the published children of `id`, in publication order.
    #[must_use]
    pub fn children(&self, id: DeviceId) -> Option<&[DeviceId]> {
        self.node(id).map(|node| node.children.as_slice())
    }

    /// Returns the parent of `id`.
    #[must_use]
    pub fn parent(&self, id: DeviceId) -> Option<DeviceId> {
        self.node(id).and_then(|node| node.parent)
    }

    /// Returns the unmatched index in publication order.
    #[must_use]
    pub fn unmatched(&self) -> &[DeviceId] {
        &self.unmatched
    }

    /// Returns `true` if `id` is published and unbound.
    #[must_use]
    pub fn is_unmatched(&self, id: DeviceId) -> bool {
        self.unmatched.contains(&id)
    }

    /// Returns `true` if `id` is live and published.
    #[must_use]
    pub fn is_published(&self, id: DeviceId) -> bool {
        self.node(id).is_some_and(|node| node.published)
    }

    /// Returns the driver bound to `id`.
    #[must_use]
    pub fn bound_driver(&self, id: DeviceId) -> Option<DriverId> {
        self.node(id).and_then(|node| node.bound)
    }

    /// Returns the names from the root down to `id`.
    #[must_use]
    pub fn path(&self, id: DeviceId) -> Option<DevicePath> {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.node(current)?;
            names.push(node.device.name());
            cursor = node.parent;
        }
        names.reverse();
        Some(DevicePath::from_segments(names))
    }

    /// Returns the number of live devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if the tree holds no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn node(&self, id: DeviceId) -> Option<&Node> {
        self.slots
            .get(id.as_usize())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: DeviceId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.as_usize())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    fn free_slot(&mut self, id: DeviceId) -> Option<Node> {
        let slot = self
            .slots
            .get_mut(id.as_usize())
            .filter(|slot| slot.generation == id.generation())?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.live -= 1;
        Some(node)
    }

    /// Collects `top` and its descendants, children before parents.
    fn post_order(&self, top: DeviceId) -> Vec<DeviceId> {
        let mut out = Vec::new();
        let mut stack = alloc::vec![(top, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            stack.push((id, true));
            if let Some(children) = self.children(id) {
                // Reversed so children come out in publication order.
                stack.extend(children.iter().rev().map(|&child| (child, false)));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use ddk_core::EventObject;

    use super::*;
    use crate::abi::DeviceName;
    use crate::config::ClosePolicy;
    use crate::device::{DeviceInit, DeviceLifecycle, DeviceOps};

    struct NoOps;
    impl DeviceOps for NoOps {}

    const DRV: DriverId = DriverId::new(1);

    fn add(tree: &mut DeviceTree, parent: Option<DeviceId>, name: &str) -> DeviceId {
        tree.insert(parent, |id| {
            Arc::new(Device::new(DeviceInit {
                id,
                name: DeviceName::new(name),
                parent,
                owner: DRV,
                ops: Arc::new(NoOps),
                events: Arc::new(EventObject::new()),
                close_policy: ClosePolicy::Reject,
            }))
        })
        .unwrap()
    }

    fn with_root() -> (DeviceTree, DeviceId) {
        let mut tree = DeviceTree::new();
        let root = add(&mut tree, None, "root");
        tree.publish(root).unwrap();
        tree.bind(root, DriverId::MANAGER).unwrap();
        (tree, root)
    }

    #[test]
    fn publish_links_child_and_unmatched() {
        let (mut tree, root) = with_root();
        let dev = add(&mut tree, Some(root), "pci");
        assert!(!tree.is_unmatched(dev));
        assert_eq!(tree.children(root), Some(&[][..]));

        tree.publish(dev).unwrap();
        assert_eq!(tree.children(root), Some(&[dev][..]));
        assert_eq!(tree.unmatched(), &[dev]);
        assert_eq!(tree.publish(dev), Err(DeviceError::AlreadyPublished));
    }

    #[test]
    fn child_of_unpublished_parent_cannot_publish() {
        let (mut tree, root) = with_root();
        let bus = add(&mut tree, Some(root), "bus");
        let leaf = add(&mut tree, Some(bus), "leaf");
        assert_eq!(tree.publish(leaf), Err(DeviceError::BadState));
        tree.publish(bus).unwrap();
        tree.publish(leaf).unwrap();
    }

    #[test]
    fn unmatched_iff_unbound() {
        let (mut tree, root) = with_root();
        let dev = add(&mut tree, Some(root), "dev");
        tree.publish(dev).unwrap();

        tree.bind(dev, DRV).unwrap();
        assert!(!tree.is_unmatched(dev));
        assert_eq!(tree.bound_driver(dev), Some(DRV));
        assert_eq!(tree.bind(dev, DRV), Err(DeviceError::AlreadyBound));

        assert_eq!(tree.unbind(dev), Ok(DRV));
        assert!(tree.is_unmatched(dev));
        assert_eq!(tree.bound_driver(dev), None);
        assert_eq!(tree.unbind(dev), Err(DeviceError::BadState));
    }

    #[test]
    fn unbind_if_leaves_other_driver_bound() {
        const OTHER: DriverId = DriverId::new(2);

        let (mut tree, root) = with_root();
        let dev = add(&mut tree, Some(root), "dev");
        tree.publish(dev).unwrap();

        tree.bind(dev, OTHER).unwrap();
        assert_eq!(tree.unbind_if(dev, DRV), Ok(false));
        assert_eq!(tree.bound_driver(dev), Some(OTHER));
        assert!(!tree.is_unmatched(dev));

        assert_eq!(tree.unbind_if(dev, OTHER), Ok(true));
        assert_eq!(tree.bound_driver(dev), None);
        assert_eq!(tree.unmatched(), &[dev]);
        assert_eq!(tree.unbind_if(dev, OTHER), Ok(false));
        assert_eq!(tree.unmatched(), &[dev]);

        let _ = tree.remove(dev).unwrap();
        assert_eq!(tree.unbind_if(dev, OTHER), Err(DeviceError::NotFound));
    }

    #[test]
    fn bind_requires_publication() {
        let (mut tree, root) = with_root();
        let dev = add(&mut tree, Some(root), "dev");
        assert_eq!(tree.bind(dev, DRV), Err(DeviceError::BadState));
    }

    #[test]
    fn remove_is_post_order_and_frees_slots() {
        let (mut tree, root) = with_root();
        let bus = add(&mut tree, Some(root), "bus");
        tree.publish(bus).unwrap();
        let a = add(&mut tree, Some(bus), "a");
        tree.publish(a).unwrap();
        let b = add(&mut tree, Some(bus), "b");
        tree.publish(b).unwrap();
        let a1 = add(&mut tree, Some(a), "a1");
        tree.publish(a1).unwrap();
        assert_eq!(tree.len(), 5);

        let detached = tree.remove(bus).unwrap();
        let order: Vec<DeviceId> = detached.iter().map(|d| d.device.id()).collect();
        assert_eq!(order, [a1, a, b, bus]);
        assert!(detached.iter().all(|d| d.device.lifecycle() == DeviceLifecycle::Removing));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.children(root), Some(&[][..]));
        assert!(tree.unmatched().is_empty());

        for d in detached {
            d.device.finish_removal(d.published);
            assert_eq!(d.device.lifecycle(), DeviceLifecycle::Released);
        }
    }

    #[test]
    fn remove_is_idempotent_for_stale_ids() {
        let (mut tree, root) = with_root();
        let dev = add(&mut tree, Some(root), "dev");
        tree.publish(dev).unwrap();
        assert_eq!(tree.remove(dev).unwrap().len(), 1);
        assert!(tree.remove(dev).unwrap().is_empty());
    }

    #[test]
    fn root_cannot_be_removed() {
        let (mut tree, root) = with_root();
        assert!(matches!(tree.remove(root), Err(DeviceError::BadState)));
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let (mut tree, root) = with_root();
        let old = add(&mut tree, Some(root), "old");
        let _ = tree.remove(old).unwrap();
        let new = add(&mut tree, Some(root), "new");
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(tree.device(old).is_none());
        assert_eq!(tree.device(new).map(|d| d.name()), Some("new"));
    }

    #[test]
    fn second_root_refused() {
        let (mut tree, _) = with_root();
        let result = tree.insert(None, |_| unreachable!());
        assert_eq!(result, Err(DeviceError::InvalidArgs));
    }

    #[test]
    fn path_lists_names_from_root() {
        let (mut tree, root) = with_root();
        let bus = add(&mut tree, Some(root), "pci");
        let dev = add(&mut tree, Some(bus), "ahci-0");
        assert_eq!(tree.path(dev).unwrap().to_string(), "root/pci/ahci-0");
        assert_eq!(tree.parent(dev), Some(bus));
    }
}
