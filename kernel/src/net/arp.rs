//! ARP: IPv4 → MAC resolution with a fixed-size cache.
//!
//! Each entry is `{ip, mac, status, last_request_tick}`. Resolution either
//! hits a valid entry, creates an incomplete one (emitting a request), or
//! reports that a request is already pending. A retry for the same address
//! is throttled to one request per [`ARP_DELAY`] ticks, so concurrent
//! resolvers of a cold address emit exactly one request.

use crate::sync::Spinlock;
use crate::time;

use super::device::NetDevice;
use super::ethernet::ETHERTYPE_ARP;
use super::types::{Ipv4Addr, MacAddr};

const ARP_HW_ETHERNET: u16 = 1;
const ARP_PROTO_IPV4: u16 = 0x0800;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
const ARP_PACKET_LEN: usize = 28;

/// Cache entries.
pub const ARP_CACHE_SIZE: usize = 32;
/// Minimum ticks between requests for the same address.
pub const ARP_DELAY: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpStatus {
    Free,
    Incomplete,
    Valid,
}

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddr,
    status: ArpStatus,
    last_request: u64,
}

const FREE_ENTRY: ArpEntry = ArpEntry {
    ip: Ipv4Addr::ZERO,
    mac: MacAddr::ZERO,
    status: ArpStatus::Free,
    last_request: 0,
};

static CACHE: Spinlock<[ArpEntry; ARP_CACHE_SIZE]> = Spinlock::new([FREE_ENTRY; ARP_CACHE_SIZE]);

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// Cache hit; the MAC is usable now.
    Hit(MacAddr),
    /// No entry existed: an incomplete entry was added and a request sent.
    None,
    /// An entry exists and a request went out recently; wait.
    Incomplete,
    /// An entry exists but the request is stale; another was sent.
    Trigger,
}

fn free_slot(cache: &[ArpEntry; ARP_CACHE_SIZE]) -> usize {
    if let Some(i) = cache.iter().position(|e| e.status == ArpStatus::Free) {
        return i;
    }
    // Full: evict the entry longest without a refresh.
    let mut oldest = 0;
    for (i, e) in cache.iter().enumerate() {
        if e.last_request < cache[oldest].last_request {
            oldest = i;
        }
    }
    oldest
}

/// Resolve `ip` on `dev`. The caller (the IP tx work queue) defers or
/// resubmits according to the verdict.
pub fn resolve(dev: &NetDevice, ip: Ipv4Addr) -> Resolve {
    if ip == Ipv4Addr::BROADCAST {
        return Resolve::Hit(MacAddr::BROADCAST);
    }

    let now = time::current_ticks();
    let verdict = {
        let mut cache = CACHE.lock();
        match cache.iter_mut().find(|e| e.status != ArpStatus::Free && e.ip == ip) {
            Some(entry) if entry.status == ArpStatus::Valid => {
                return Resolve::Hit(entry.mac);
            }
            Some(entry) => {
                if now.wrapping_sub(entry.last_request) < ARP_DELAY {
                    Resolve::Incomplete
                } else {
                    entry.last_request = now;
                    Resolve::Trigger
                }
            }
            None => {
                let slot = free_slot(&cache);
                cache[slot] = ArpEntry {
                    ip,
                    mac: MacAddr::ZERO,
                    status: ArpStatus::Incomplete,
                    last_request: now,
                };
                Resolve::None
            }
        }
    };

    if matches!(verdict, Resolve::None | Resolve::Trigger) {
        send_request(dev, ip);
    }
    verdict
}

/// Look up without side effects.
pub fn lookup(ip: Ipv4Addr) -> Option<MacAddr> {
    CACHE
        .lock()
        .iter()
        .find(|e| e.status == ArpStatus::Valid && e.ip == ip)
        .map(|e| e.mac)
}

/// Install a mapping (reply processing, static entries, tests).
pub fn insert(ip: Ipv4Addr, mac: MacAddr) {
    let mut cache = CACHE.lock();
    match cache.iter_mut().find(|e| e.status != ArpStatus::Free && e.ip == ip) {
        Some(entry) => {
            entry.mac = mac;
            entry.status = ArpStatus::Valid;
        }
        None => {
            let slot = free_slot(&cache);
            cache[slot] = ArpEntry {
                ip,
                mac,
                status: ArpStatus::Valid,
                last_request: time::current_ticks(),
            };
        }
    }
}

/// Current non-free entries, for diagnostics.
pub fn entries() -> alloc::vec::Vec<(Ipv4Addr, MacAddr, ArpStatus)> {
    CACHE
        .lock()
        .iter()
        .filter(|e| e.status != ArpStatus::Free)
        .map(|e| (e.ip, e.mac, e.status))
        .collect()
}

fn send_request(dev: &NetDevice, target_ip: Ipv4Addr) {
    let mut packet = [0u8; ARP_PACKET_LEN];
    packet[0..2].copy_from_slice(&ARP_HW_ETHERNET.to_be_bytes());
    packet[2..4].copy_from_slice(&ARP_PROTO_IPV4.to_be_bytes());
    packet[4] = 6;
    packet[5] = 4;
    packet[6..8].copy_from_slice(&ARP_OP_REQUEST.to_be_bytes());
    packet[8..14].copy_from_slice(&dev.mac.0);
    packet[14..18].copy_from_slice(&dev.ip.0);
    // Target MAC left zero.
    packet[24..28].copy_from_slice(&target_ip.0);

    if let Err(e) = dev.send_frame(MacAddr::BROADCAST, ETHERTYPE_ARP, &packet) {
        log::warn!(target: "arp", "request for {} failed: {}", target_ip, e);
    }
}

/// Handle one incoming ARP packet on `dev`: learn the sender, kick the IP
/// transmit queue, and answer requests addressed to this interface.
pub fn handle_packet(dev: &'static NetDevice, data: &[u8]) {
    if data.len() < ARP_PACKET_LEN {
        return;
    }
    let hw_type = u16::from_be_bytes([data[0], data[1]]);
    let proto = u16::from_be_bytes([data[2], data[3]]);
    let hw_len = data[4];
    let proto_len = data[5];
    let op = u16::from_be_bytes([data[6], data[7]]);
    if hw_type != ARP_HW_ETHERNET || proto != ARP_PROTO_IPV4 || hw_len != 6 || proto_len != 4 {
        return;
    }

    let sender_mac = MacAddr([data[8], data[9], data[10], data[11], data[12], data[13]]);
    let sender_ip = Ipv4Addr([data[14], data[15], data[16], data[17]]);
    let target_ip = Ipv4Addr([data[24], data[25], data[26], data[27]]);

    insert(sender_ip, sender_mac);
    // A resolution may have been blocking the transmit queue.
    super::ip::kick_tx_queue();

    if op == ARP_OP_REQUEST && target_ip == dev.ip {
        let mut reply = [0u8; ARP_PACKET_LEN];
        reply[0..2].copy_from_slice(&ARP_HW_ETHERNET.to_be_bytes());
        reply[2..4].copy_from_slice(&ARP_PROTO_IPV4.to_be_bytes());
        reply[4] = 6;
        reply[5] = 4;
        reply[6..8].copy_from_slice(&ARP_OP_REPLY.to_be_bytes());
        reply[8..14].copy_from_slice(&dev.mac.0);
        reply[14..18].copy_from_slice(&dev.ip.0);
        reply[18..24].copy_from_slice(&sender_mac.0);
        reply[24..28].copy_from_slice(&sender_ip.0);
        if let Err(e) = dev.send_frame(sender_mac, ETHERTYPE_ARP, &reply) {
            log::warn!(target: "arp", "reply to {} failed: {}", sender_ip, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::{self, NetDriver};
    use crate::sync::Spinlock as Lock;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::boxed::Box;

    struct CountingNic {
        tx: AtomicUsize,
        frames: Lock<alloc::vec::Vec<alloc::vec::Vec<u8>>>,
    }

    impl NetDriver for CountingNic {
        fn transmit(&self, frame: &[u8]) -> Result<(), crate::error::Errno> {
            self.tx.fetch_add(1, Ordering::SeqCst);
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    /// Tests that read or advance the global tick counter serialize here
    /// so a concurrent advance cannot skew a throttle-window assertion.
    static CLOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn nic_device(ip: Ipv4Addr) -> (&'static CountingNic, &'static device::NetDevice) {
        let nic: &'static CountingNic = Box::leak(Box::new(CountingNic {
            tx: AtomicUsize::new(0),
            frames: Lock::new(alloc::vec::Vec::new()),
        }));
        let dev = device::register(
            MacAddr([0x52, 0x54, 0, 0, 0, ip.0[3]]),
            ip,
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(ip.0[0], ip.0[1], ip.0[2], 1),
            1500,
            nic,
        );
        (nic, dev)
    }

    #[test]
    fn request_throttle_allows_one_per_delay() {
        // Property: repeated resolution without a reply emits at most one
        // request per ARP_DELAY ticks.
        let _clock = CLOCK.lock().unwrap();
        let (nic, dev) = nic_device(Ipv4Addr::new(10, 40, 0, 2));
        let target = Ipv4Addr::new(10, 40, 0, 77);

        assert_eq!(resolve(dev, target), Resolve::None);
        assert_eq!(nic.tx.load(Ordering::SeqCst), 1);

        for _ in 0..10 {
            assert_eq!(resolve(dev, target), Resolve::Incomplete);
        }
        assert_eq!(nic.tx.load(Ordering::SeqCst), 1, "throttled while fresh");

        crate::time::advance(ARP_DELAY);
        assert_eq!(resolve(dev, target), Resolve::Trigger);
        assert_eq!(nic.tx.load(Ordering::SeqCst), 2, "retry after the delay");
    }

    #[test]
    fn concurrent_cold_resolvers_emit_one_request() {
        // Scenario: two threads race on a cold cache entry; exactly one
        // ARP request leaves the NIC, and both see the MAC once cached.
        let _clock = CLOCK.lock().unwrap();
        let (nic, dev) = nic_device(Ipv4Addr::new(10, 41, 0, 2));
        let target = Ipv4Addr::new(10, 41, 0, 99);

        let t1 = std::thread::spawn(move || resolve(dev, target));
        let t2 = std::thread::spawn(move || resolve(dev, target));
        let (r1, r2) = (t1.join().unwrap(), t2.join().unwrap());

        assert_eq!(nic.tx.load(Ordering::SeqCst), 1, "exactly one request on the wire");
        assert!(matches!(
            (r1, r2),
            (Resolve::None, Resolve::Incomplete) | (Resolve::Incomplete, Resolve::None)
        ));

        let mac = MacAddr([2, 2, 2, 2, 2, 2]);
        insert(target, mac);
        assert_eq!(resolve(dev, target), Resolve::Hit(mac));
        assert_eq!(resolve(dev, target), Resolve::Hit(mac));
        assert_eq!(nic.tx.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn incoming_request_for_our_ip_is_answered() {
        let (nic, dev) = nic_device(Ipv4Addr::new(10, 42, 0, 2));
        let peer_mac = MacAddr([9, 9, 9, 9, 9, 9]);
        let peer_ip = Ipv4Addr::new(10, 42, 0, 7);

        let mut req = [0u8; ARP_PACKET_LEN];
        req[0..2].copy_from_slice(&1u16.to_be_bytes());
        req[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        req[4] = 6;
        req[5] = 4;
        req[6..8].copy_from_slice(&1u16.to_be_bytes());
        req[8..14].copy_from_slice(&peer_mac.0);
        req[14..18].copy_from_slice(&peer_ip.0);
        req[24..28].copy_from_slice(&dev.ip.0);

        handle_packet(dev, &req);

        // The sender was learned and a reply went out to its MAC.
        assert_eq!(lookup(peer_ip), Some(peer_mac));
        let frames = nic.frames.lock();
        assert_eq!(frames.len(), 1);
        let reply = &frames[0];
        assert_eq!(&reply[0..6], &peer_mac.0, "unicast to the requester");
        let op = u16::from_be_bytes([reply[14 + 6], reply[14 + 7]]);
        assert_eq!(op, ARP_OP_REPLY);
    }

    #[test]
    fn malformed_packets_are_ignored() {
        let (nic, dev) = nic_device(Ipv4Addr::new(10, 43, 0, 2));
        let mut req = [0u8; ARP_PACKET_LEN];
        req[0..2].copy_from_slice(&7u16.to_be_bytes()); // bad hw type
        handle_packet(dev, &req);
        assert_eq!(nic.tx.load(Ordering::SeqCst), 0);
        handle_packet(dev, &req[..10]); // short
        assert_eq!(nic.tx.load(Ordering::SeqCst), 0);
    }
}
