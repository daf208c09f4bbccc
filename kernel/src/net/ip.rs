//! IPv4 glue: header build/parse, next-hop and source selection, and the
//! transmit work queue that waits out ARP resolution.
//!
//! No fragmentation: a payload that does not fit the interface MTU is
//! rejected; DF is set on everything we send.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU16, Ordering};

use crate::error::Errno;
use crate::sync::Spinlock;

use super::arp::{self, Resolve};
use super::checksum;
use super::device::{self, NetDevice};
use super::ethernet::ETHERTYPE_IPV4;
use super::types::Ipv4Addr;

pub const PROTO_TCP: u8 = 6;

const IPV4_HEADER_LEN: usize = 20;
const DEFAULT_TTL: u8 = 64;

/// A parsed IPv4 packet borrowing the receive buffer.
pub struct Ipv4Packet<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub payload: &'a [u8],
}

/// Parse and validate an IPv4 header (version, length, checksum).
pub fn parse(data: &[u8]) -> Option<Ipv4Packet<'_>> {
    if data.len() < IPV4_HEADER_LEN {
        return None;
    }
    if data[0] >> 4 != 4 {
        return None;
    }
    let header_len = ((data[0] & 0x0F) as usize) * 4;
    if header_len < IPV4_HEADER_LEN || data.len() < header_len {
        return None;
    }
    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if total_len < header_len || total_len > data.len() {
        return None;
    }
    if checksum::internet_checksum(&data[..header_len]) != 0 {
        return None;
    }
    Some(Ipv4Packet {
        src: Ipv4Addr([data[12], data[13], data[14], data[15]]),
        dst: Ipv4Addr([data[16], data[17], data[18], data[19]]),
        protocol: data[9],
        ttl: data[8],
        payload: &data[header_len..total_len],
    })
}

/// Next-hop selection: an interface whose subnet covers `dst` sends
/// on-link; otherwise the first interface with a gateway routes there.
/// The source address is the chosen interface's address.
pub fn route(dst: Ipv4Addr) -> Option<(&'static NetDevice, Ipv4Addr)> {
    let devices = device::all();
    if let Some(dev) = devices
        .iter()
        .find(|d| dst.same_subnet(d.ip, d.netmask))
    {
        return Some((*dev, dst));
    }
    devices
        .into_iter()
        .find(|d| d.gateway != Ipv4Addr::ZERO)
        .map(|d| (d, d.gateway))
}

/// MTU toward `dst`, for MSS selection.
pub fn mtu_for(dst: Ipv4Addr) -> Option<usize> {
    route(dst).map(|(dev, _)| dev.mtu)
}

struct PendingPacket {
    dev: &'static NetDevice,
    next_hop: Ipv4Addr,
    packet: Vec<u8>,
}

/// Packets waiting for ARP resolution of their next hop.
static TX_QUEUE: Spinlock<VecDeque<PendingPacket>> = Spinlock::new(VecDeque::new());

static IP_ID: AtomicU16 = AtomicU16::new(1);

fn build_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> [u8; IPV4_HEADER_LEN] {
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    let id = IP_ID.fetch_add(1, Ordering::Relaxed);
    let mut h = [0u8; IPV4_HEADER_LEN];
    h[0] = 0x45;
    h[2..4].copy_from_slice(&total_len.to_be_bytes());
    h[4..6].copy_from_slice(&id.to_be_bytes());
    h[6] = 0x40; // DF
    h[8] = DEFAULT_TTL;
    h[9] = protocol;
    h[12..16].copy_from_slice(&src.0);
    h[16..20].copy_from_slice(&dst.0);
    let ck = checksum::internet_checksum(&h);
    h[10..12].copy_from_slice(&ck.to_be_bytes());
    h
}

/// Build an IPv4 packet for `dst` and enqueue it for transmission.
///
/// `ENETUNREACH` without a route, `EINVAL` when the packet would exceed
/// the interface MTU (no fragmentation support).
pub fn send_ipv4(dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Result<(), Errno> {
    let (dev, next_hop) = route(dst).ok_or(Errno::NetUnreach)?;
    if IPV4_HEADER_LEN + payload.len() > dev.mtu {
        return Err(Errno::Inval);
    }

    let header = build_header(dev.ip, dst, protocol, payload.len());
    let mut packet = Vec::with_capacity(IPV4_HEADER_LEN + payload.len());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(payload);

    TX_QUEUE.lock().push_back(PendingPacket { dev, next_hop, packet });
    kick_tx_queue();
    Ok(())
}

/// Drain the transmit queue as far as ARP allows. Packets whose next hop
/// is unresolved stay queued; an ARP reply re-kicks the queue.
pub fn kick_tx_queue() {
    loop {
        let pending = TX_QUEUE.lock().pop_front();
        let p = match pending {
            Some(p) => p,
            None => return,
        };
        match arp::resolve(p.dev, p.next_hop) {
            Resolve::Hit(mac) => {
                if let Err(e) = p.dev.send_frame(mac, ETHERTYPE_IPV4, &p.packet) {
                    log::warn!(target: "ip", "transmit failed: {}", e);
                }
            }
            Resolve::None | Resolve::Incomplete | Resolve::Trigger => {
                // Put it back and stop: the head blocks until resolution.
                TX_QUEUE.lock().push_front(p);
                return;
            }
        }
    }
}

/// Dispatch one received IPv4 packet.
pub fn handle_ipv4(dev: &'static NetDevice, data: &[u8]) {
    let pkt = match parse(data) {
        Some(p) => p,
        None => return,
    };
    if pkt.dst != dev.ip && pkt.dst != Ipv4Addr::BROADCAST {
        return;
    }
    if pkt.protocol == PROTO_TCP {
        super::tcp::input::handle_segment(&pkt);
    }
}
