//! Networking: Ethernet framing, ARP, the IPv4 glue, and TCP.

pub mod arp;
pub mod checksum;
pub mod device;
pub mod ethernet;
pub mod ip;
pub mod tcp;
pub mod types;
