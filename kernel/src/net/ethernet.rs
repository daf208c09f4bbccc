//! Ethernet frame handling: parse incoming frames, build outgoing ones.

use alloc::vec::Vec;

use super::device::NetDevice;
use super::types::MacAddr;

/// EtherType value for ARP frames.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// EtherType value for IPv4 frames.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

const ETH_HEADER_LEN: usize = 14;
/// Minimum payload-carrying frame length (without FCS).
const ETH_MIN_FRAME: usize = 60;

/// A parsed Ethernet frame borrowing the receive buffer.
pub struct EthFrame<'a> {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

/// Parse raw bytes into an Ethernet frame. Returns `None` if too short.
pub fn parse(data: &[u8]) -> Option<EthFrame<'_>> {
    if data.len() < ETH_HEADER_LEN {
        return None;
    }
    let dst = MacAddr([data[0], data[1], data[2], data[3], data[4], data[5]]);
    let src = MacAddr([data[6], data[7], data[8], data[9], data[10], data[11]]);
    let ethertype = ((data[12] as u16) << 8) | data[13] as u16;
    Some(EthFrame { dst, src, ethertype, payload: &data[ETH_HEADER_LEN..] })
}

/// Build a frame: dst + src + ethertype + payload, padded to the minimum.
pub fn build_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + payload.len().max(46));
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.push((ethertype >> 8) as u8);
    frame.push(ethertype as u8);
    frame.extend_from_slice(payload);
    while frame.len() < ETH_MIN_FRAME {
        frame.push(0);
    }
    frame
}

/// Dispatch one received frame to ARP or IPv4. Called by NIC receive
/// paths with the frame and the interface it arrived on.
pub fn handle_frame(dev: &'static NetDevice, data: &[u8]) {
    let frame = match parse(data) {
        Some(f) => f,
        None => return,
    };
    if frame.dst != dev.mac && frame.dst != MacAddr::BROADCAST {
        return;
    }
    match frame.ethertype {
        ETHERTYPE_ARP => super::arp::handle_packet(dev, frame.payload),
        ETHERTYPE_IPV4 => super::ip::handle_ipv4(dev, frame.payload),
        _ => {}
    }
}
