//! Protocol queries and readiness signaling through published devices.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use common::{CountingOps, manager, published_child};
use ddk::{
    Device, DeviceError, DeviceLifecycle, DeviceOps, DeviceState, DriverId, ProtocolId,
    ProtocolRef, SecondaryProtocol,
};

const BLOCK: ProtocolId = ProtocolId::fourcc(*b"pBLK");
const ETHERNET: ProtocolId = ProtocolId::fourcc(*b"pETH");

struct BlockOps {
    block_size: u32,
}

struct EthOps {
    mtu: u16,
}

#[test]
fn base_protocol_always_resolves() {
    let mgr = manager();
    let dev = published_child(&mgr, "plain", Arc::default());
    assert!(dev.get_protocol(ProtocolId::DEVICE).unwrap().is_device());
    assert!(mgr.root().get_protocol(ProtocolId::DEVICE).unwrap().is_device());
}

#[test]
fn unknown_protocol_without_secondary_is_not_supported() {
    let mgr = manager();
    let dev = published_child(&mgr, "plain", Arc::default());
    assert!(matches!(
        dev.get_protocol(BLOCK),
        Err(DeviceError::NotSupported)
    ));
    assert!(matches!(
        dev.protocol::<BlockOps>(BLOCK),
        Err(DeviceError::NotSupported)
    ));
}

#[test]
fn secondary_protocol_resolves_only_its_id() {
    let mgr = manager();
    let dev = mgr
        .create(mgr.root().id(), "sda", DriverId::MANAGER, Arc::new(CountingOps::default()))
        .unwrap();
    dev.set_protocol(SecondaryProtocol::new(BLOCK, Arc::new(BlockOps { block_size: 512 })))
        .unwrap();
    mgr.publish(dev.id()).unwrap();

    let ops = dev.protocol::<BlockOps>(BLOCK).unwrap();
    assert_eq!(ops.block_size, 512);
    assert!(matches!(
        dev.get_protocol(ETHERNET),
        Err(DeviceError::NotSupported)
    ));
    // Right id, wrong concrete type.
    assert!(matches!(
        dev.protocol::<EthOps>(BLOCK),
        Err(DeviceError::NotSupported)
    ));
}

#[test]
fn secondary_protocol_frozen_after_publish() {
    let mgr = manager();
    let dev = published_child(&mgr, "late", Arc::default());
    let ops = Arc::new(BlockOps { block_size: 1 });
    let result = dev.set_protocol(SecondaryProtocol::new(BLOCK, ops));
    assert_eq!(result, Err(DeviceError::AlreadyPublished));
    assert!(dev.secondary_protocol().is_none());
}

#[test]
fn overridden_dispatch_serves_several_protocols() {
    struct Nic {
        block: Arc<BlockOps>,
        eth: Arc<EthOps>,
    }

    impl DeviceOps for Nic {
        fn get_protocol(
            &self,
            _dev: &Device,
            proto: ProtocolId,
        ) -> Result<ProtocolRef, DeviceError> {
            match proto {
                ProtocolId::DEVICE => Ok(ProtocolRef::Device),
                BLOCK => Ok(ProtocolRef::Ops(self.block.clone())),
                ETHERNET => Ok(ProtocolRef::Ops(self.eth.clone())),
                _ => Err(DeviceError::NotSupported),
            }
        }
    }

    let mgr = manager();
    let nic = Arc::new(Nic {
        block: Arc::new(BlockOps { block_size: 4096 }),
        eth: Arc::new(EthOps { mtu: 1500 }),
    });
    let dev = mgr
        .create(mgr.root().id(), "combo", DriverId::MANAGER, nic)
        .unwrap();
    mgr.publish(dev.id()).unwrap();

    assert_eq!(dev.protocol::<EthOps>(ETHERNET).unwrap().mtu, 1500);
    assert_eq!(dev.protocol::<BlockOps>(BLOCK).unwrap().block_size, 4096);
    assert!(matches!(
        dev.get_protocol(ProtocolId::fourcc(*b"pUSB")),
        Err(DeviceError::NotSupported)
    ));
}

#[test]
fn dispatch_fails_once_released() {
    let mgr = manager();
    let dev = mgr
        .create(mgr.root().id(), "sdb", DriverId::MANAGER, Arc::new(CountingOps::default()))
        .unwrap();
    dev.set_protocol(SecondaryProtocol::new(BLOCK, Arc::new(BlockOps { block_size: 7 })))
        .unwrap();
    mgr.publish(dev.id()).unwrap();
    assert_eq!(dev.protocol::<BlockOps>(BLOCK).unwrap().block_size, 7);

    mgr.remove(dev.id()).unwrap();
    assert_eq!(dev.lifecycle(), DeviceLifecycle::Released);
    assert!(matches!(
        dev.get_protocol(ProtocolId::DEVICE),
        Err(DeviceError::BadState)
    ));
    assert!(matches!(
        dev.protocol::<BlockOps>(BLOCK),
        Err(DeviceError::BadState)
    ));
}

#[test]
fn dispatch_continues_while_removal_drains() {
    let mgr = manager();
    let dev = published_child(&mgr, "held", Arc::default());
    dev.open(ddk::OpenFlags::READ).unwrap();
    mgr.remove(dev.id()).unwrap();

    assert_eq!(dev.lifecycle(), DeviceLifecycle::Removing);
    assert!(dev.get_protocol(ProtocolId::DEVICE).unwrap().is_device());
    dev.close().unwrap();
    assert!(matches!(
        dev.get_protocol(ProtocolId::DEVICE),
        Err(DeviceError::BadState)
    ));
}

#[test]
fn set_state_combines_set_and_clear() {
    let mgr = manager();
    let dev = published_child(&mgr, "tty", Arc::default());
    assert_eq!(dev.state(), DeviceState::empty());

    dev.state_set(DeviceState::READABLE).unwrap();
    dev.set_state(DeviceState::WRITABLE, DeviceState::READABLE)
        .unwrap();
    assert_eq!(dev.state(), DeviceState::WRITABLE);

    dev.state_clear(DeviceState::WRITABLE).unwrap();
    assert_eq!(dev.state(), DeviceState::empty());
}

#[test]
fn waiter_never_sees_mixed_state() {
    let mgr = manager();
    let dev = published_child(&mgr, "pipe", Arc::default());
    let handle = dev.readiness_handle().unwrap();
    let a = DeviceState::READABLE;
    let b = DeviceState::WRITABLE | DeviceState::ERROR;
    dev.state_set(a).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let observer = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut seen = 0u32;
            while !done.load(Ordering::Acquire) {
                let state = DeviceState::from_signals(handle.observe());
                assert!(state == a || state == b, "observed {state:?}");
                seen += 1;
            }
            seen
        })
    };

    for i in 0..20_000 {
        if i % 2 == 0 {
            dev.set_state(b, a).unwrap();
        } else {
            dev.set_state(a, b).unwrap();
        }
    }
    done.store(true, Ordering::Release);
    assert!(observer.join().unwrap() > 0);
}

#[test]
fn waiter_wakes_on_removal() {
    let mgr = manager();
    let dev = published_child(&mgr, "usb0", Arc::default());
    dev.open(ddk::OpenFlags::READ).unwrap();
    let handle = dev.readiness_handle().unwrap();

    let waiter = thread::spawn(move || handle.wait_any(DeviceState::ERROR.to_signals()));
    mgr.remove(dev.id()).unwrap();

    let woke = DeviceState::from_signals(waiter.join().unwrap());
    assert_eq!(woke, DeviceState::ERROR);
    dev.close().unwrap();
}
