//! Network interfaces.
//!
//! A [`NetDevice`] couples the interface's addressing (MAC, IPv4, subnet,
//! gateway, MTU) with the NIC driver's transmit entry point. The IP layer
//! performs next-hop and source selection against the registered devices.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::Errno;
use crate::sync::Spinlock;

use super::types::{Ipv4Addr, MacAddr};

/// Transmit half of a NIC driver. Receive is interrupt-driven: the driver
/// pushes frames into `ethernet::handle_frame`.
pub trait NetDriver: Send + Sync {
    fn transmit(&self, frame: &[u8]) -> Result<(), Errno>;
}

/// One configured interface.
pub struct NetDevice {
    pub index: usize,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mtu: usize,
    driver: &'static dyn NetDriver,
}

static DEVICES: Spinlock<Vec<&'static NetDevice>> = Spinlock::new(Vec::new());

impl NetDevice {
    /// Build and transmit one Ethernet frame.
    pub fn send_frame(&self, dst: MacAddr, ethertype: u16, payload: &[u8]) -> Result<(), Errno> {
        let frame = super::ethernet::build_frame(dst, self.mac, ethertype, payload);
        self.driver.transmit(&frame)
    }
}

/// Register an interface. Returns the leaked device handle.
pub fn register(
    mac: MacAddr,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
    mtu: usize,
    driver: &'static dyn NetDriver,
) -> &'static NetDevice {
    let mut devices = DEVICES.lock();
    let dev: &'static NetDevice = Box::leak(Box::new(NetDevice {
        index: devices.len(),
        mac,
        ip,
        netmask,
        gateway,
        mtu,
        driver,
    }));
    devices.push(dev);
    log::info!(target: "net", "if{}: {} ({}) mtu {}", dev.index, dev.ip, dev.mac, dev.mtu);
    dev
}

/// Every registered interface.
pub fn all() -> Vec<&'static NetDevice> {
    DEVICES.lock().clone()
}

/// The interface owning `ip` (for input filtering).
pub fn device_with_ip(ip: Ipv4Addr) -> Option<&'static NetDevice> {
    DEVICES.lock().iter().copied().find(|d| d.ip == ip)
}
